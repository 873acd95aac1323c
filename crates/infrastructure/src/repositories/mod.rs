pub mod memory;

pub use memory::{InMemoryDeviceDirectory, InMemoryScriptRepository, InMemoryTaskRepository};
