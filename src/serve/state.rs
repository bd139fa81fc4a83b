use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::RegistryConfig;
use crate::store::upload::UploadSessionStore;
use crate::store::RegistryStore;

#[derive(Clone)]
pub struct AppState {
    pub config: RegistryConfig,
    pub store: Arc<RwLock<RegistryStore>>,
    pub upload_sessions: Arc<RwLock<UploadSessionStore>>,
}

impl AppState {
    pub fn new(config: RegistryConfig) -> Self {
        AppState {
            config,
            store: Arc::new(RwLock::new(RegistryStore::default())),
            upload_sessions: Arc::new(RwLock::new(UploadSessionStore::default())),
        }
    }
}
