pub mod memory;
pub mod redis;

use std::sync::Arc;

use fleet_core::config::{StoreBackend, StoreConfig};
use fleet_core::traits::SharedStore;
use fleet_core::FleetResult;
use tracing::{debug, info};

pub use memory::InMemoryStore;
pub use redis::RedisStore;

pub struct SharedStoreFactory;

impl SharedStoreFactory {
    pub async fn create(config: &StoreConfig) -> FleetResult<Arc<dyn SharedStore>> {
        debug!("创建共享存储，后端: {:?}", config.backend);

        match config.backend {
            StoreBackend::Memory => {
                info!("使用进程内共享存储");
                Ok(Arc::new(InMemoryStore::new()))
            }
            StoreBackend::Redis => {
                info!("使用Redis共享存储: {}", config.redis_url);
                let store = RedisStore::connect(config).await?;
                Ok(Arc::new(store))
            }
        }
    }
}
