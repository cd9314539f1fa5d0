use crate::s3::multipart::{TransferSettings, DEFAULT_CHUNK_SIZE};
use crate::s3::{ClientOptions, Credentials, Endpoint, RetryPolicy, TransportOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Connection, credential and transfer settings of one storage account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// API host, without scheme
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub secret_access_key: String,

    /// Use HTTPS (default: true)
    #[serde(default = "default_true")]
    pub secure: bool,

    /// HTTP proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Part size of multipart transfers in bytes (default: 1 GiB)
    #[serde(default = "default_chunk_size")]
    pub multipart_chunk_size: u64,

    /// Spool directory for stream uploads (default: OS temp dir)
    #[serde(default = "std::env::temp_dir")]
    pub temp_dir: PathBuf,

    /// Retries after the first attempt
    #[serde(default = "default_retry")]
    pub retry: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Abort a multipart session when the transfer fails
    #[serde(default = "default_true")]
    pub abort_on_failure: bool,

    /// Token of the Authorization header
    #[serde(default = "default_vendor")]
    pub vendor: String,

    /// Part uploads in flight per transfer
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Route bucket calls to the bucket's regional endpoint
    #[serde(default = "default_true")]
    pub resolve_regions: bool,

    /// Log request and response headers
    #[serde(default)]
    pub debug: bool,
}

fn default_endpoint() -> String {
    "storage-dag.iijgio.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_retry() -> u32 {
    2
}

fn default_retry_interval_ms() -> u64 {
    3000
}

fn default_vendor() -> String {
    crate::s3::signer::DEFAULT_VENDOR.to_string()
}

fn default_concurrency() -> usize {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            secure: true,
            proxy: None,
            multipart_chunk_size: default_chunk_size(),
            temp_dir: std::env::temp_dir(),
            retry: default_retry(),
            retry_interval_ms: default_retry_interval_ms(),
            abort_on_failure: true,
            vendor: default_vendor(),
            concurrency: default_concurrency(),
            insecure_skip_verify: false,
            resolve_regions: true,
            debug: false,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            anyhow::bail!("endpoint must not be empty");
        }
        if self.multipart_chunk_size == 0 {
            anyhow::bail!("multipart_chunk_size must be positive");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be positive");
        }
        Ok(())
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            chunk_size: self.multipart_chunk_size,
            concurrency: self.concurrency,
            temp_dir: self.temp_dir.clone(),
            abort_on_failure: self.abort_on_failure,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            endpoint: Endpoint::new(self.endpoint.trim(), self.secure),
            credentials: Credentials::new(&self.access_key_id, &self.secret_access_key),
            vendor: self.vendor.clone(),
            retry: RetryPolicy {
                retries: self.retry,
                interval: Duration::from_millis(self.retry_interval_ms),
            },
            transfer: self.transfer_settings(),
            resolve_regions: self.resolve_regions,
            log_headers: self.debug,
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            proxy: self.proxy.clone().filter(|p| !p.is_empty()),
            insecure_skip_verify: self.insecure_skip_verify,
            ..TransportOptions::default()
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named storage profiles
    #[serde(default)]
    pub profiles: HashMap<String, StorageConfig>,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&StorageConfig> {
        match name.or(self.default_profile.as_deref()) {
            Some(name) => self.profiles.get(name),
            None => self
                .profiles
                .get("default")
                .or_else(|| self.profiles.values().next()),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    for (name, profile) in &config.profiles {
        profile
            .validate()
            .with_context(|| format!("Invalid profile '{}'", name))?;
    }

    Ok(config)
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        _ => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// A `.env` file is read first when present. Every variable is optional:
/// - STOWAGE_ENDPOINT, STOWAGE_SECURE, STOWAGE_PROXY
/// - STOWAGE_ACCESS_KEY_ID, STOWAGE_SECRET_ACCESS_KEY, STOWAGE_VENDOR
/// - STOWAGE_CHUNK_SIZE, STOWAGE_CONCURRENCY, STOWAGE_TEMP_DIR, STOWAGE_ABORT_ON_FAILURE
/// - STOWAGE_RETRY, STOWAGE_RETRY_INTERVAL_MS
/// - STOWAGE_DEBUG
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut profile = StorageConfig::default();

    if let Some(endpoint) = env_value::<String>("STOWAGE_ENDPOINT")? {
        profile.endpoint = endpoint;
    }
    if let Some(key) = env_value::<String>("STOWAGE_ACCESS_KEY_ID")? {
        profile.access_key_id = key;
    }
    if let Some(secret) = env_value::<String>("STOWAGE_SECRET_ACCESS_KEY")? {
        profile.secret_access_key = secret;
    }
    if let Some(secure) = env_value("STOWAGE_SECURE")? {
        profile.secure = secure;
    }
    profile.proxy = env_value("STOWAGE_PROXY")?;
    if let Some(chunk_size) = env_value("STOWAGE_CHUNK_SIZE")? {
        profile.multipart_chunk_size = chunk_size;
    }
    if let Some(temp_dir) = env_value::<String>("STOWAGE_TEMP_DIR")? {
        profile.temp_dir = PathBuf::from(temp_dir);
    }
    if let Some(retry) = env_value("STOWAGE_RETRY")? {
        profile.retry = retry;
    }
    if let Some(interval) = env_value("STOWAGE_RETRY_INTERVAL_MS")? {
        profile.retry_interval_ms = interval;
    }
    if let Some(abort) = env_value("STOWAGE_ABORT_ON_FAILURE")? {
        profile.abort_on_failure = abort;
    }
    if let Some(vendor) = env_value::<String>("STOWAGE_VENDOR")? {
        profile.vendor = vendor;
    }
    if let Some(concurrency) = env_value("STOWAGE_CONCURRENCY")? {
        profile.concurrency = concurrency;
    }
    if let Some(debug) = env_value("STOWAGE_DEBUG")? {
        profile.debug = debug;
    }

    profile.validate().context("Invalid environment configuration")?;

    let mut config = Config::new();
    config.profiles.insert("default".to_string(), profile);
    config.default_profile = Some("default".to_string());
    Ok(config)
}

/// Load configuration from file or environment
///
/// A YAML file is used when a path is given, otherwise the environment.
/// A requested profile becomes the default and must exist.
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    if let Some(name) = profile_name {
        if !config.profiles.contains_key(name) {
            anyhow::bail!("Profile '{}' not found in configuration", name);
        }
        config.default_profile = Some(name.to_string());
    }

    Ok(config)
}
