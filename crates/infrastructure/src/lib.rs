pub mod instruction_queue;
pub mod lock;
pub mod presence;
pub mod repositories;
pub mod store;

pub use instruction_queue::{InstructionQueue, QueueDepth};
pub use lock::{DistributedLock, LockGuard};
pub use presence::PresenceTracker;
pub use repositories::{InMemoryDeviceDirectory, InMemoryScriptRepository, InMemoryTaskRepository};
pub use store::{InMemoryStore, RedisStore, SharedStoreFactory};
