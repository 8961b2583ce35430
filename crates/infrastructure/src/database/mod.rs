pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use zimfarm_config::DatabaseConfig;
use zimfarm_core::SchedulerResult;
use zimfarm_domain::TaskStore;

/// 根据配置创建任务存储
pub async fn connect_store(config: &DatabaseConfig) -> SchedulerResult<Arc<dyn TaskStore>> {
    if config.is_in_memory() {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::connect(config).await?))
}
