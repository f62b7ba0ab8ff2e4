//! Execution side of the scheduler.
//!
//! - [`JobRunner`]: starts admitted migrations on the driver and applies
//!   terminal outcomes, releasing the slot and admitting the next job
//! - [`HypervisorJobMonitor`]: polls the driver for each active migration
//!
//! # Execution Flow
//!
//! 1. Admission moves a job to `running` under the queue lock
//! 2. [`JobRunner::start`] spawns the driver's initiation call
//! 3. The returned handle is attached to the job
//! 4. The monitor polls the handle each tick until the job is terminal
//! 5. [`JobRunner::finish`] frees the slot and admits the next queued job

pub mod monitor;
pub mod runner;

pub use monitor::HypervisorJobMonitor;
pub use runner::{JobRunner, Outcome};
