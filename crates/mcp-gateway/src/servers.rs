//! Read-only lookup of upstream server configurations.

use std::{collections::HashMap, sync::Arc, sync::RwLock};

use crate::model::UpstreamServerConfig;

/// Supplies upstream server configurations by server id. The gateway core
/// never mutates configurations; registration lives with an external
/// collaborator.
pub trait ServerRegistry: Send + Sync + 'static {
    fn get(&self, server_id: &str) -> Option<Arc<UpstreamServerConfig>>;
}

/// In-memory registry for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticServerRegistry {
    servers: RwLock<HashMap<String, Arc<UpstreamServerConfig>>>,
}

impl StaticServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server_id: impl Into<String>, config: UpstreamServerConfig) {
        if let Ok(mut servers) = self.servers.write() {
            servers.insert(server_id.into(), Arc::new(config));
        }
    }
}

impl ServerRegistry for StaticServerRegistry {
    fn get(&self, server_id: &str) -> Option<Arc<UpstreamServerConfig>> {
        self.servers
            .read()
            .ok()
            .and_then(|servers| servers.get(server_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_shared_config() {
        let registry = StaticServerRegistry::new();
        registry.insert(
            "srv",
            UpstreamServerConfig {
                service_endpoint: "https://h/sse".into(),
                ..Default::default()
            },
        );
        let config = registry.get("srv").unwrap();
        assert_eq!(config.service_endpoint, "https://h/sse");
        assert!(registry.get("other").is_none());
    }
}
