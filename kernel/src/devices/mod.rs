//! Device drivers the core depends on: the serial console and the PIT.

pub mod pit;
pub mod serial;
