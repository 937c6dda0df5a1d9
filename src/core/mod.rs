//! The core module holds the error type, backend configuration and queue descriptions.

pub mod error;
pub mod queue;
pub mod settings;
