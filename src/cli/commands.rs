use crate::cli::args::{is_storage_path, parse_object_path, parse_storage_path};
use crate::core::Core;
use crate::s3::{DeletionResult, ListObjectsRequest, ListUploadsRequest, MultipartUpload, UploadOutcome};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write as FmtWrite;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Keys per multiple-object delete request
const DELETE_BATCH: usize = 1000;

// ============================================================================
// Utility functions
// ============================================================================

/// Format bytes in compact form (0B, 1.0KiB, 10MiB, etc.)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes == 0 {
        return "0B".to_string();
    }

    let mut value = bytes as f64;
    let mut exponent = 0;
    while value >= 1024.0 && exponent < UNITS.len() - 1 {
        value /= 1024.0;
        exponent += 1;
    }

    let mut buf = String::with_capacity(8);
    if exponent == 0 {
        let _ = write!(buf, "{}B", bytes);
    } else if value >= 10.0 {
        let _ = write!(buf, "{:.0}{}", value, UNITS[exponent]);
    } else {
        let _ = write!(buf, "{:.1}{}", value, UNITS[exponent]);
    }
    buf
}

/// Format a listing timestamp as [YYYY-MM-DD HH:MM:SS UTC]
pub fn format_timestamp(raw: &str) -> String {
    match raw.split_once('T') {
        Some((date, rest)) => {
            let time = rest.get(..8).unwrap_or_else(|| rest.trim_end_matches('Z'));
            format!("{} {} UTC", date, time)
        }
        None if raw.is_empty() => " ".repeat(23),
        None => raw.to_string(),
    }
}

/// Removed and failed counts of one delete batch of `sent` keys.
fn tally_deletion(sent: usize, result: &DeletionResult) -> (usize, usize) {
    let failed = result.errors.len();
    (sent.saturating_sub(failed), failed)
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {elapsed_precise} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn report_outcome(outcome: &UploadOutcome) {
    match &outcome.upload_id {
        Some(upload_id) => println!(
            "  {} parts, upload id {}, etag {}",
            outcome.parts,
            upload_id,
            outcome.etag.as_deref().unwrap_or("-")
        ),
        None => println!("  single request"),
    }
}

// ============================================================================
// Commands
// ============================================================================

/// List buckets, or objects under a prefix
pub async fn cmd_ls(core: &Core, path: Option<&str>, recursive: bool) -> Result<()> {
    let client = core.client();
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());

    let Some(path) = path else {
        let listing = client.list_buckets().await?;
        for bucket in &listing.buckets {
            let region = if bucket.region.is_empty() { "-" } else { &bucket.region };
            writeln!(out, "[{}] {:<10} {}/", format_timestamp(&bucket.creation_date), region, bucket.name)?;
        }
        out.flush()?;
        return Ok(());
    };

    let (bucket, prefix) = parse_storage_path(path)?;
    let mut request = ListObjectsRequest::new(&bucket).with_max_keys(1000);
    if let Some(prefix) = prefix {
        request = request.with_prefix(prefix);
    }
    if !recursive {
        request = request.with_delimiter("/");
    }

    let mut listing = client.list_objects(&request).await?;
    let mut total = 0usize;
    loop {
        for prefix in &listing.common_prefixes {
            writeln!(out, "[{}] {:>7} {}", format_timestamp(""), "PRE", prefix.prefix)?;
        }
        for object in &listing.contents {
            writeln!(
                out,
                "[{}] {:>7} {}",
                format_timestamp(&object.last_modified),
                format_bytes(object.size),
                object.key
            )?;
        }
        total += listing.contents.len() + listing.common_prefixes.len();

        if !listing.is_truncated {
            break;
        }
        listing = client.next_list_objects(&listing).await?;
    }
    out.flush()?;

    tracing::debug!(bucket = %bucket, entries = total, "Listing finished");
    Ok(())
}

/// Make bucket command
pub async fn cmd_mb(core: &Core, bucket: &str, region: Option<&str>) -> Result<()> {
    let (bucket_name, _) = parse_storage_path(bucket)?;
    let client = core.client();

    match region {
        Some(region) => client.create_bucket_in_region(&bucket_name, region).await?,
        None => client.create_bucket(&bucket_name).await?,
    }

    println!("Bucket created: dag://{}", bucket_name);
    Ok(())
}

/// Remove bucket command
pub async fn cmd_rb(core: &Core, bucket: &str) -> Result<()> {
    let (bucket_name, _) = parse_storage_path(bucket)?;
    core.client().delete_bucket(&bucket_name).await?;
    println!("Bucket removed: dag://{}", bucket_name);
    Ok(())
}

/// Upload a local file, or standard input when the source is `-`
pub async fn cmd_put(core: &Core, source: &str, destination: &str) -> Result<()> {
    let (bucket, key) = parse_object_path(destination)?;
    let client = core.client();

    let outcome = if source == "-" {
        let bar = spinner(format!("stdin -> dag://{}/{}", bucket, key));
        let result = client.upload(&bucket, &key, tokio::io::stdin(), None).await;
        bar.finish_and_clear();
        result.context("Upload from stdin failed")?
    } else {
        let path = Path::new(source);
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?
            .len();
        let bar = spinner(format!("{} -> dag://{}/{} ({})", path.display(), bucket, key, format_bytes(size)));
        let result = client.upload_file(&bucket, &key, path, None).await;
        bar.finish_and_clear();
        result.with_context(|| format!("Upload of {} failed", path.display()))?
    };

    println!("{} -> dag://{}/{}", source, bucket, key);
    report_outcome(&outcome);
    Ok(())
}

/// Download an object to a local file
pub async fn cmd_get(core: &Core, source: &str, destination: &str) -> Result<()> {
    let (bucket, key) = parse_object_path(source)?;
    let path = Path::new(destination);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes_written = core.client().download_object_to_file(&bucket, &key, path).await?;
    println!("dag://{}/{} -> {}", bucket, key, path.display());
    println!("  {} downloaded", format_bytes(bytes_written));
    Ok(())
}

/// Remove one object, or every object under a prefix
pub async fn cmd_rm(core: &Core, path: &str, recursive: bool) -> Result<()> {
    let (bucket, key) = parse_storage_path(path)?;
    let client = core.client();

    if !recursive {
        let key = key.ok_or_else(|| anyhow::anyhow!("Use --recursive to empty a whole bucket"))?;
        client.delete_object(&bucket, &key).await?;
        println!("Removed dag://{}/{}", bucket, key);
        return Ok(());
    }

    let mut request = ListObjectsRequest::new(&bucket).with_max_keys(DELETE_BATCH as u32);
    if let Some(prefix) = key {
        request = request.with_prefix(prefix);
    }

    let mut removed = 0usize;
    let mut failed = 0usize;
    let mut listing = client.list_objects(&request).await?;
    loop {
        let keys: Vec<&str> = listing.contents.iter().map(|o| o.key.as_str()).collect();
        for batch in keys.chunks(DELETE_BATCH) {
            let result = client.delete_multiple_objects(&bucket, batch, true).await?;
            for failure in &result.errors {
                eprintln!("Failed to remove {}: {} {}", failure.key, failure.code, failure.message);
            }
            let (ok, errors) = tally_deletion(batch.len(), &result);
            removed += ok;
            failed += errors;
        }

        if !listing.is_truncated {
            break;
        }
        listing = client.next_list_objects(&listing).await?;
    }

    println!("Removed {} object(s) from dag://{}", removed, bucket);
    if failed > 0 {
        anyhow::bail!("{} object(s) could not be removed", failed);
    }
    Ok(())
}

/// Server-side copy between storage paths
pub async fn cmd_cp(core: &Core, source: &str, destination: &str) -> Result<()> {
    if !is_storage_path(source) || !is_storage_path(destination) {
        anyhow::bail!("cp copies between storage paths; use put or get for local files");
    }
    let (src_bucket, src_key) = parse_object_path(source)?;
    let (dst_bucket, dst_key) = match parse_storage_path(destination)? {
        (bucket, Some(key)) => (bucket, key),
        (bucket, None) => (bucket, src_key.clone()),
    };

    let bar = spinner(format!("{} -> dag://{}/{}", source, dst_bucket, dst_key));
    let result = core
        .client()
        .copy_large_object(&src_bucket, &src_key, &dst_bucket, &dst_key)
        .await;
    bar.finish_and_clear();
    let outcome = result?;

    println!("{} -> dag://{}/{}", source, dst_bucket, dst_key);
    report_outcome(&outcome);
    Ok(())
}

/// List incomplete multipart uploads
pub async fn cmd_uploads(core: &Core, path: &str) -> Result<()> {
    let (bucket, prefix) = parse_storage_path(path)?;
    let client = core.client();

    let mut request = ListUploadsRequest::new(&bucket).with_max_uploads(1000);
    if let Some(prefix) = prefix {
        request = request.with_prefix(prefix);
    }

    let mut listing = client.list_multipart_uploads(&request).await?;
    loop {
        for upload in &listing.uploads {
            println!("[{}] {} {}", format_timestamp(&upload.initiated), upload.upload_id, upload.key);
        }
        if !listing.is_truncated {
            break;
        }
        listing = client.next_list_multipart_uploads(&listing).await?;
    }
    Ok(())
}

/// Abort a multipart upload
pub async fn cmd_abort(core: &Core, path: &str, upload_id: &str) -> Result<()> {
    let (bucket, key) = parse_object_path(path)?;
    let upload = MultipartUpload::new(&bucket, &key, upload_id);
    core.client().abort_multipart_upload(&upload).await?;
    println!("Aborted upload {} of dag://{}/{}", upload_id, bucket, key);
    Ok(())
}

/// Resume a file upload
pub async fn cmd_resume(core: &Core, source: &str, destination: &str, upload_id: &str) -> Result<()> {
    let (bucket, key) = parse_object_path(destination)?;
    let upload = MultipartUpload::new(&bucket, &key, upload_id);
    let path = Path::new(source);

    let bar = spinner(format!("{} -> dag://{}/{} (resume)", path.display(), bucket, key));
    let result = core.client().resume_upload_file(&upload, path).await;
    bar.finish_and_clear();
    let outcome = result.with_context(|| format!("Resuming upload {} failed", upload_id))?;

    println!("{} -> dag://{}/{}", source, bucket, key);
    report_outcome(&outcome);
    Ok(())
}

/// Storage usage of the contract and the account
pub async fn cmd_space(core: &Core, region: Option<&str>) -> Result<()> {
    let space = core.client().get_storage_space(region).await?;
    let contract = u64::try_from(space.contract_used).unwrap_or(0);
    let account = u64::try_from(space.account_used).unwrap_or(0);
    println!("Contract used: {} ({} bytes)", format_bytes(contract), space.contract_used);
    println!("Account used:  {} ({} bytes)", format_bytes(account), space.account_used);
    Ok(())
}

/// Region directory
pub async fn cmd_regions(core: &Core) -> Result<()> {
    let directory = core.client().get_regions().await?;
    for region in &directory.regions {
        println!("{:<10} {}", region.name, region.endpoint);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::types::DeleteFailure;

    #[test]
    fn test_tally_deletion() {
        let mut result = DeletionResult::default();
        assert_eq!(tally_deletion(3, &result), (3, 0));

        result.errors = vec![DeleteFailure::default(); 2];
        assert_eq!(tally_deletion(3, &result), (1, 2));
        // More errors than keys sent never underflows
        assert_eq!(tally_deletion(1, &result), (0, 2));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10MiB");
        assert_eq!(format_bytes(1 << 30), "1.0GiB");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp("2015-06-15T12:18:51.000Z"), "2015-06-15 12:18:51 UTC");
        assert_eq!(format_timestamp("").len(), 23);
        assert_eq!(format_timestamp("yesterday"), "yesterday");
    }
}
