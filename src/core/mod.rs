use crate::config::{Config, StorageConfig};
use crate::s3::{HttpTransport, StorageClient};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Core shared by all CLI commands
///
/// The StorageClient is created once. Clones share the same connection pool
/// and region caches.
#[derive(Clone)]
pub struct Core {
    pub profile: Arc<StorageConfig>,
    client: StorageClient,
}

impl Core {
    pub fn new(config: Config) -> Result<Self> {
        let profile = Self::select_profile(&config)?;
        let client = StorageClient::new(profile.client_options(), &profile.transport_options())
            .context("Failed to create storage client")?;

        tracing::debug!(
            endpoint = %profile.endpoint,
            secure = profile.secure,
            proxy = ?profile.proxy,
            "Storage client ready"
        );

        Ok(Self {
            profile: Arc::new(profile),
            client,
        })
    }

    /// Build over a caller supplied transport.
    pub fn with_transport(config: Config, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let profile = Self::select_profile(&config)?;
        let client = StorageClient::with_transport(transport, profile.client_options());
        Ok(Self {
            profile: Arc::new(profile),
            client,
        })
    }

    fn select_profile(config: &Config) -> Result<StorageConfig> {
        let profile = config
            .get_profile(None)
            .ok_or_else(|| anyhow::anyhow!("No profile found in configuration"))?
            .clone();
        profile.validate()?;
        Ok(profile)
    }

    /// Shared storage client
    pub fn client(&self) -> &StorageClient {
        &self.client
    }
}
