use crate::api::CompletionProvider;
use crate::config::ConfigResolver;
use crate::storage::StorageManager;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared per-process state, created once at startup and injected into every
/// request handler. Nothing here is re-created per call.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Mutex<StorageManager>>,
    pub provider: Arc<dyn CompletionProvider>,
    pub resolver: ConfigResolver,
}

impl AppState {
    pub fn new(
        storage_manager: StorageManager,
        provider: Arc<dyn CompletionProvider>,
        env_api_key: Option<String>,
        env_system_prompt: Option<String>,
    ) -> Self {
        let storage = Arc::new(Mutex::new(storage_manager));
        let resolver = ConfigResolver::new(storage.clone(), env_api_key, env_system_prompt);
        Self {
            storage,
            provider,
            resolver,
        }
    }
}
