use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::social::{LogTransport, SocialConfig, SocialDispatcher, SocialTransport};

/// Per-tenant engines, keyed by the pgwire database name. Each tenant owns
/// an Engine, its WAL file, a social dispatcher and a compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    social_config: SocialConfig,
    transport: Arc<dyn SocialTransport>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, social_config: SocialConfig) -> Self {
        Self::with_transport(data_dir, compact_threshold, social_config, Arc::new(LogTransport))
    }

    /// Like [`TenantManager::new`] with a custom delivery for social calls.
    pub fn with_transport(
        data_dir: PathBuf,
        compact_threshold: u64,
        social_config: SocialConfig,
        transport: Arc<dyn SocialTransport>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            social_config,
            transport,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Path traversal: keep only filename-safe characters.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race here for a new tenant; the entry lock makes
        // sure only one engine opens the WAL file.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let social = SocialDispatcher::spawn(self.transport.clone(), self.social_config.clone());
        let engine = Arc::new(Engine::new(wal_path, Arc::new(social))?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        info!("tenant {tenant} loaded ({} users)", engine.user_count());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
