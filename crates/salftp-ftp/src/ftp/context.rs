//! Services shared by every connection of one client instance.

use crate::ftp::cache::ListingCache;
use crate::ftp::config::FtpGlobalConfig;
use crate::ftp::error::FtpResult;
use crate::ftp::parser::ServerTypeList;
use crate::ftp::socket::Dispatcher;
use crate::ftp::tls::TlsConfigs;
use std::sync::{Arc, RwLock};

/// Dispatcher, listing cache, server types and TLS configs.
///
/// Must be created inside a tokio runtime (the dispatcher spawns its task).
#[derive(Debug)]
pub struct FtpContext {
    pub dispatcher: Dispatcher,
    pub cache: ListingCache,
    pub server_types: ServerTypeList,
    pub tls: TlsConfigs,
    config: RwLock<FtpGlobalConfig>,
}

impl FtpContext {
    pub fn new(config: FtpGlobalConfig) -> FtpResult<Arc<Self>> {
        let server_types = ServerTypeList::with_builtins()?;
        for ty in &config.custom_server_types {
            server_types.add(ty)?;
        }
        log::debug!(
            "FTP context: {} server type(s), cache budget {} bytes",
            server_types.names().len(),
            config.effective_cache_budget()
        );
        Ok(Arc::new(Self {
            dispatcher: Dispatcher::new(),
            cache: ListingCache::new(config.effective_cache_budget()),
            server_types,
            tls: TlsConfigs::default(),
            config: RwLock::new(config),
        }))
    }

    /// Snapshot of the global config.
    pub fn config(&self) -> FtpGlobalConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    /// Replace the global config. Custom server types are re-added; the
    /// listing cache is trimmed to the new budget.
    pub fn set_config(&self, config: FtpGlobalConfig) -> FtpResult<()> {
        for ty in &config.custom_server_types {
            self.server_types.add(ty)?;
        }
        self.cache.set_budget(config.effective_cache_budget());
        if !config.use_listings_cache {
            self.cache.clear();
        }
        let mut current = self.config.write().unwrap_or_else(|p| p.into_inner());
        *current = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::parser::builtin::BUILTIN_SERVER_TYPES;

    #[tokio::test]
    async fn builtins_and_custom_types() {
        let mut custom = BUILTIN_SERVER_TYPES[0].clone();
        custom.name = "Custom".into();
        let ctx = FtpContext::new(FtpGlobalConfig {
            custom_server_types: vec![custom],
            ..Default::default()
        })
        .unwrap();
        assert!(ctx.server_types.get("UNIX").is_some());
        assert!(ctx.server_types.get("custom").is_some());
    }

    #[tokio::test]
    async fn disabling_the_cache_clears_it() {
        let ctx = FtpContext::new(FtpGlobalConfig::default()).unwrap();
        let key = crate::ftp::cache::CacheKey {
            host: "h",
            port: 21,
            user: "",
            path: "/",
            path_type: crate::ftp::paths::ServerPathType::Unix,
            list_cmd: "LIST",
            is_ftps: false,
        };
        ctx.cache
            .add_or_update_path_listing(&key, b"x\r\n", chrono::Utc::now());
        assert_eq!(ctx.cache.len(), 1);
        ctx.set_config(FtpGlobalConfig {
            use_listings_cache: false,
            ..Default::default()
        })
        .unwrap();
        assert!(ctx.cache.is_empty());
        assert!(!ctx.config().use_listings_cache);
    }
}
