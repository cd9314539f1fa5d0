//! Command-line front end
//!
//! Thin commands over [`crate::s3::StorageClient`]. Remote paths use the
//! `dag://bucket/key` form.
//!
//! ```bash
//! # List buckets, then objects
//! stowage ls
//! stowage ls dag://bucket/logs/ --recursive
//!
//! # Upload a file, or a stream from stdin
//! stowage put ./backup.tar dag://bucket/backup.tar
//! tar c dir | stowage put - dag://bucket/dir.tar
//!
//! # Continue an interrupted multipart upload
//! stowage uploads dag://bucket
//! stowage resume ./backup.tar dag://bucket/backup.tar <upload-id>
//! ```

pub mod args;
pub mod commands;

use crate::core::Core;
use anyhow::Result;
use args::{Cli, Commands};

/// Dispatch a parsed command line.
pub async fn run(cli: Cli, core: &Core) -> Result<()> {
    let region = cli.region.as_deref();

    match cli.command {
        Commands::Ls { path, recursive } => commands::cmd_ls(core, path.as_deref(), recursive).await,
        Commands::Mb { bucket } => commands::cmd_mb(core, &bucket, region).await,
        Commands::Rb { bucket } => commands::cmd_rb(core, &bucket).await,
        Commands::Put { source, destination } => commands::cmd_put(core, &source, &destination).await,
        Commands::Get { source, destination } => commands::cmd_get(core, &source, &destination).await,
        Commands::Rm { path, recursive } => commands::cmd_rm(core, &path, recursive).await,
        Commands::Cp { source, destination } => commands::cmd_cp(core, &source, &destination).await,
        Commands::Uploads { path } => commands::cmd_uploads(core, &path).await,
        Commands::Abort { path, upload_id } => commands::cmd_abort(core, &path, &upload_id).await,
        Commands::Resume {
            source,
            destination,
            upload_id,
        } => commands::cmd_resume(core, &source, &destination, &upload_id).await,
        Commands::Space => commands::cmd_space(core, region).await,
        Commands::Regions => commands::cmd_regions(core).await,
    }
}
