//! TUI module for terminal user interfaces

mod batch_monitor;

pub use batch_monitor::BatchMonitor;
