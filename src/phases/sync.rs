//! Cross-queue synchronization analysis.
//!
//! Each queue owns a timeline semaphore. The n-th pass of a queue in a frame (counting from one) completes
//! timeline value `base + n`, where `base` is the value the queue reached at the end of the previous frame. A
//! dependency between passes on different queues is enforced by a [`SyncPoint`]: the consumer's submission waits
//! until the producer's queue reaches the producer's value.
//!
//! Since timeline values only increase, waiting for a value also covers every earlier pass of that queue, and
//! everything that queue had waited for itself. A dependency that is already covered this way, directly or
//! through a third queue, gets no new sync point.

use std::cmp::Reverse;
use std::collections::HashMap;

use multimap::MultiMap;

use crate::core::queue::QueueId;
use crate::graph::pass::PassId;
use crate::phases::dependency::DependencyGraph;
use crate::phases::schedule::QueueSchedule;

/// A wait of one queue on a timeline value of another queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    pub producer: PassId,
    pub consumer: PassId,
    /// Queue that signals.
    pub source: QueueId,
    /// Queue that waits.
    pub destination: QueueId,
    /// Timeline value of `source` to wait for, relative to the start of the frame.
    pub value: u64,
}

/// A run of consecutive passes of one queue that is submitted as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub queue: QueueId,
    pub passes: Vec<PassId>,
    /// Sync points this segment waits on before executing.
    pub waits: Vec<usize>,
    /// Relative timeline value of `queue` signaled when the segment completes.
    pub signal: u64,
}

/// Output of the sync analysis.
#[derive(Debug, Clone, Default)]
pub struct SyncAnalysis {
    points: Vec<SyncPoint>,
    waits: MultiMap<PassId, usize>,
    enforced_by: HashMap<(PassId, PassId), usize>,
}

impl SyncAnalysis {
    fn from_points(points: Vec<SyncPoint>, enforced_by: HashMap<(PassId, PassId), usize>) -> Self {
        let mut waits = MultiMap::new();
        for (index, point) in points.iter().enumerate() {
            waits.insert(point.consumer, index);
        }
        Self {
            points,
            waits,
            enforced_by,
        }
    }

    pub fn points(&self) -> &[SyncPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sync points a pass waits on before it executes.
    pub fn waits_of(&self, pass: PassId) -> impl Iterator<Item = &SyncPoint> {
        self.waits
            .get_vec(&pass)
            .into_iter()
            .flatten()
            .map(|index| &self.points[*index])
    }

    /// Whether another queue waits on the completion of this pass.
    pub fn is_signaled(&self, pass: PassId) -> bool {
        self.points.iter().any(|point| point.producer == pass)
    }

    /// The sync point enforcing a cross-queue dependency edge.
    pub fn enforced_by(&self, producer: PassId, consumer: PassId) -> Option<&SyncPoint> {
        self.enforced_by
            .get(&(producer, consumer))
            .map(|index| &self.points[*index])
    }

    /// A copy of this analysis with one sync point removed. Dependencies it enforced are left unsynchronized.
    pub fn without_point(&self, index: usize) -> Self {
        let mut points = self.points.clone();
        points.remove(index);
        let enforced_by = self
            .enforced_by
            .iter()
            .filter(|(_, point)| **point != index)
            .map(|(edge, point)| (*edge, if *point > index { point - 1 } else { *point }))
            .collect();
        Self::from_points(points, enforced_by)
    }

    /// Compute which passes of every queue are known to be complete when a pass starts executing, and report
    /// every cross-queue dependency whose producer is not among them.
    ///
    /// An empty result means the sync points order every dependency.
    pub fn find_unsynchronized(&self, deps: &DependencyGraph, schedule: &QueueSchedule) -> Vec<(PassId, PassId)> {
        let queue_count = schedule.queues().len();
        let mut clocks: Vec<Vec<Option<usize>>> = vec![vec![None; queue_count]; deps.len()];

        for pass in schedule.order() {
            let mut clock = vec![None; queue_count];
            if let Some(previous) = schedule.previous_on_queue(*pass) {
                merge(&mut clock, &clocks[previous.index()]);
                let queue = schedule.queue_of(previous).index();
                clock[queue] = clock[queue].max(Some(schedule.local_index(previous)));
            }
            for point in self.waits_of(*pass) {
                let covered = point.value as usize;
                if covered == 0 {
                    continue;
                }
                let producer = schedule.sequence(point.source)[covered - 1];
                merge(&mut clock, &clocks[producer.index()]);
                let source = point.source.index();
                clock[source] = clock[source].max(Some(covered - 1));
            }
            clocks[pass.index()] = clock;
        }

        let mut races = deps
            .edges()
            .filter(|(producer, consumer, _)| schedule.queue_of(*producer) != schedule.queue_of(*consumer))
            .filter(|(producer, consumer, _)| {
                let known = clocks[consumer.index()][schedule.queue_of(*producer).index()];
                known.map_or(true, |known| known < schedule.local_index(*producer))
            })
            .map(|(producer, consumer, _)| (producer, consumer))
            .collect::<Vec<_>>();
        races.sort();
        races
    }

    /// Split every queue's pass sequence into submissions. A segment ends after a pass another queue waits on,
    /// and a new one starts at a pass that waits on another queue. Segments are returned in an order in which
    /// every wait refers to a segment submitted before it.
    pub fn segments(&self, schedule: &QueueSchedule) -> Vec<Segment> {
        let mut segments = vec![];
        for queue in schedule.active_queues() {
            let mut current: Option<Segment> = None;
            for pass in schedule.sequence(queue) {
                let waits = self.waits.get_vec(pass).cloned().unwrap_or_default();
                if !waits.is_empty() {
                    segments.extend(current.take());
                }
                let segment = current.get_or_insert_with(|| Segment {
                    queue,
                    passes: vec![],
                    waits: vec![],
                    signal: 0,
                });
                segment.passes.push(*pass);
                segment.waits.extend(waits);
                segment.signal = schedule.local_index(*pass) as u64 + 1;
                if self.is_signaled(*pass) {
                    segments.extend(current.take());
                }
            }
            segments.extend(current);
        }
        segments.sort_by_key(|segment| schedule.position(segment.passes[0]));
        segments
    }
}

fn merge(into: &mut [Option<usize>], other: &[Option<usize>]) {
    for (a, b) in into.iter_mut().zip(other) {
        *a = (*a).max(*b);
    }
}

/// Every dependency edge between passes on different queues, as `(producer, consumer)`.
pub fn cross_queue_edges(deps: &DependencyGraph, schedule: &QueueSchedule) -> Vec<(PassId, PassId)> {
    let mut edges = deps
        .edges()
        .filter(|(producer, consumer, _)| schedule.queue_of(*producer) != schedule.queue_of(*consumer))
        .map(|(producer, consumer, _)| (producer, consumer))
        .collect::<Vec<_>>();
    edges.sort();
    edges
}

/// What a pass knows about another queue when it starts executing.
#[derive(Debug, Copy, Clone)]
struct Known {
    /// Highest local index of that queue known to be complete.
    index: usize,
    /// Wait of the pass's own queue that made it known. `None` for the pass's own queue.
    point: Option<usize>,
}

fn merge_known(into: &mut [Option<Known>], other: &[Option<Known>], via: Option<usize>) {
    for (known, other) in into.iter_mut().zip(other) {
        let Some(mut other) = *other else {
            continue;
        };
        if via.is_some() {
            other.point = via;
        }
        if known.map_or(true, |known| known.index < other.index) {
            *known = Some(other);
        }
    }
}

/// Run the sync analysis.
///
/// Every pass carries a vector clock of the passes known to be complete when it starts: everything its queue
/// knew before it, plus everything the producers it waits on knew. A cross-queue dependency whose producer is
/// already covered by that clock needs no new wait, including when the coverage comes through a third queue.
pub fn analyze(deps: &DependencyGraph, schedule: &QueueSchedule) -> SyncAnalysis {
    let queue_count = schedule.queues().len();
    let mut clocks: Vec<Vec<Option<Known>>> = vec![vec![None; queue_count]; deps.len()];
    let mut points = vec![];
    let mut enforced_by = HashMap::new();

    for consumer in schedule.order() {
        let destination = schedule.queue_of(*consumer);
        let mut clock = vec![None; queue_count];
        if let Some(previous) = schedule.previous_on_queue(*consumer) {
            merge_known(&mut clock, &clocks[previous.index()], None);
            clock[destination.index()] = Some(Known {
                index: schedule.local_index(previous),
                point: None,
            });
        }

        let mut by_source: MultiMap<QueueId, PassId> = MultiMap::new();
        for producer in deps.predecessors(*consumer) {
            let source = schedule.queue_of(producer);
            if source != destination {
                by_source.insert(source, producer);
            }
        }

        // Latest producer first, since waiting on it often covers the producers on other queues.
        let mut sources = by_source
            .iter_all()
            .filter_map(|(source, producers)| {
                producers
                    .iter()
                    .copied()
                    .max_by_key(|producer| schedule.local_index(*producer))
                    .map(|last| (*source, last))
            })
            .collect::<Vec<_>>();
        sources.sort_by_key(|(_, last)| Reverse(schedule.position(*last)));

        for (source, last) in sources {
            let needed = schedule.local_index(last);
            let point = match clock[source.index()] {
                Some(Known {
                    index,
                    point: Some(point),
                }) if index >= needed => {
                    trace!("{last} -> {consumer} is covered by an earlier wait of {destination}");
                    point
                }
                _ => {
                    points.push(SyncPoint {
                        producer: last,
                        consumer: *consumer,
                        source,
                        destination,
                        value: needed as u64 + 1,
                    });
                    let point = points.len() - 1;
                    trace!("{destination} waits for {source} = {} before {consumer}", needed + 1);
                    merge_known(&mut clock, &clocks[last.index()], Some(point));
                    clock[source.index()] = Some(Known {
                        index: needed,
                        point: Some(point),
                    });
                    point
                }
            };
            for producer in by_source.get_vec(&source).into_iter().flatten() {
                enforced_by.insert((*producer, *consumer), point);
            }
        }
        clocks[consumer.index()] = clock;
    }

    debug!("Sync analysis emitted {} sync points", points.len());
    SyncAnalysis::from_points(points, enforced_by)
}
