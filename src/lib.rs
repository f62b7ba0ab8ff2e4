pub mod config;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{DriverError, MigrationError, Result};
pub use service::MigrationService;
