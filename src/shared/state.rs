use std::sync::Arc;

use crate::config::AppConfig;
use crate::lifecycle::LifecycleManager;
use crate::shared::utils::DbPool;
use crate::store::pg::PgStore;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub manager: Arc<LifecycleManager<PgStore>>,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> Self {
        let manager = Arc::new(LifecycleManager::new(PgStore::new(conn.clone())));
        Self {
            conn,
            config,
            manager,
        }
    }
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            manager: Arc::clone(&self.manager),
        }
    }
}
