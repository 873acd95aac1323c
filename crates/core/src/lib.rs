pub mod config;
pub mod errors;
pub mod keys;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::*;
pub use keys::StoreKeys;
pub use logging::{init_logging, init_logging_from_config};
pub use traits::{DeviceDirectory, ScriptRepository, SharedStore, TaskRepository};
