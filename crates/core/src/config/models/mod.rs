pub mod app_config;
pub mod auth_retry;
pub mod queue_presence;
pub mod scheduler_observability;
pub mod store;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use auth_retry::{AuthConfig, RetryConfig};
pub use queue_presence::{PresenceConfig, QueueConfig};
pub use scheduler_observability::{ObservabilityConfig, SchedulerConfig};
pub use store::{StoreBackend, StoreConfig};
