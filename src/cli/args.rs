use clap::{Parser, Subcommand};

/// Scheme of remote paths: `dag://bucket/key`
pub const PATH_SCHEME: &str = "dag://";

/// stowage - object storage client with resumable multipart transfers
#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (YAML); the environment is used when absent
    #[arg(long, global = true, env = "STOWAGE_CONFIG")]
    pub config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true, env = "STOWAGE_PROFILE")]
    pub profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Region for service and bucket creation commands
    #[arg(long, global = true)]
    pub region: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List buckets, or objects under dag://bucket/prefix
    Ls {
        path: Option<String>,

        /// List recursively
        #[arg(short, long)]
        recursive: bool,
    },

    /// Make bucket
    Mb {
        /// Bucket path (dag://bucket)
        bucket: String,
    },

    /// Remove bucket
    Rb {
        /// Bucket path (dag://bucket)
        bucket: String,
    },

    /// Upload a file, or standard input with `-`
    Put {
        source: String,

        /// Destination (dag://bucket/key)
        destination: String,
    },

    /// Download an object
    Get {
        /// Source (dag://bucket/key)
        source: String,

        destination: String,
    },

    /// Remove objects
    Rm {
        path: String,

        /// Remove every object under the prefix
        #[arg(short, long)]
        recursive: bool,
    },

    /// Server-side copy
    Cp {
        source: String,
        destination: String,
    },

    /// List incomplete multipart uploads
    Uploads {
        /// Bucket path with optional prefix (dag://bucket/prefix)
        path: String,
    },

    /// Abort a multipart upload
    Abort {
        /// Object path (dag://bucket/key)
        path: String,

        upload_id: String,
    },

    /// Resume a file upload in an existing multipart session
    Resume {
        source: String,

        /// Destination (dag://bucket/key)
        destination: String,

        upload_id: String,
    },

    /// Show storage usage
    Space,

    /// Show the region directory
    Regions,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Split `dag://bucket/key` into bucket and optional key.
pub fn parse_storage_path(path: &str) -> anyhow::Result<(String, Option<String>)> {
    let path = path.trim();

    let stripped = match path.strip_prefix(PATH_SCHEME) {
        Some(p) => p,
        None => anyhow::bail!("Invalid storage path format. Expected: {}bucket/key", PATH_SCHEME),
    };

    let (bucket, key) = match stripped.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (stripped, ""),
    };

    if bucket.is_empty() {
        anyhow::bail!("Bucket name cannot be empty");
    }

    let key = (!key.is_empty()).then(|| key.to_string());
    Ok((bucket.to_string(), key))
}

/// Like [`parse_storage_path`] but the key is required.
pub fn parse_object_path(path: &str) -> anyhow::Result<(String, String)> {
    match parse_storage_path(path)? {
        (bucket, Some(key)) => Ok((bucket, key)),
        (_, None) => anyhow::bail!("Storage path must include a key: {}", path),
    }
}

pub fn is_storage_path(path: &str) -> bool {
    path.trim().starts_with(PATH_SCHEME)
}
