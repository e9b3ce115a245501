//! Infrastructure layer: task storage, workers, distributed locks, config.

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod lock;
pub mod tasks;
pub mod workers;
