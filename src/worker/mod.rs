//! Background work: the relay scheduler.
//!
//! - `scheduler`: interval ticker, cycle tracking, drain-on-stop

pub mod scheduler;

pub use scheduler::{DEFAULT_STOP_GRACE, Scheduler, SchedulerStatus};
