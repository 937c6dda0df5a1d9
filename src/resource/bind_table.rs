//! Bind table pool. Each frame executor owns one, and recycles every table it handed out when the executor
//! is reset, since by then the GPU finished all work of that slot.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::device::{BindLayoutId, BindTableHandle, Device};

#[derive(Debug, Default)]
struct LayoutTables {
    tables: Vec<BindTableHandle>,
    used: usize,
}

/// Pool of bind tables, grouped by layout.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BindTablePool {
    #[derivative(Debug = "ignore")]
    device: Arc<dyn Device>,
    layouts: HashMap<BindLayoutId, LayoutTables>,
}

impl BindTablePool {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            layouts: HashMap::new(),
        }
    }

    /// Get an unused bind table for this layout, creating one if every table is in use.
    pub fn pop(&mut self, layout: BindLayoutId) -> Result<BindTableHandle> {
        let tables = self.layouts.entry(layout).or_default();
        if tables.used == tables.tables.len() {
            let table = self.device.create_bind_table(layout)?;
            #[cfg(feature = "log-objects")]
            trace!("Created new bind table {:?} for layout {:?}", table, layout);
            tables.tables.push(table);
        }
        let table = tables.tables[tables.used];
        tables.used += 1;
        Ok(table)
    }

    /// Mark every table as unused again.
    pub fn reset(&mut self) {
        for tables in self.layouts.values_mut() {
            tables.used = 0;
        }
    }

    /// Amount of tables currently handed out.
    pub fn in_use(&self) -> usize {
        self.layouts.values().map(|tables| tables.used).sum()
    }

    /// Amount of tables owned by the pool.
    pub fn capacity(&self) -> usize {
        self.layouts.values().map(|tables| tables.tables.len()).sum()
    }

    /// Destroy every table.
    pub fn destroy(&mut self) {
        for (_, tables) in self.layouts.drain() {
            for table in tables.tables {
                self.device.free_bind_table(table);
            }
        }
    }
}
