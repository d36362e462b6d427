//! On-disk config files

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::common::{Error, Result};

/// First usable path: the primary unless it is a directory (a mounted
/// volume, typically), then the first alternative that is not one.
pub async fn select_config_path(primary: &Path, alternatives: &[PathBuf]) -> Result<PathBuf> {
    if !is_dir(primary).await {
        return Ok(primary.to_path_buf());
    }
    warn!(
        "Config path {} is a directory, using an alternative path",
        primary.display()
    );
    for candidate in alternatives {
        if !is_dir(candidate).await {
            info!("Using alternative config path: {}", candidate.display());
            return Ok(candidate.clone());
        }
    }
    Err(Error::config(
        "failed to find an alternative config path: all paths are directories",
    ))
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `data` through a temp file in the same directory.
/// Every call gets its own temp name, so concurrent writers never share one.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| Error::config(format!("invalid config path: {}", path.display())))?;
    tmp_name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Pick a path and write the config there atomically.
pub async fn write_config(primary: &Path, alternatives: &[PathBuf], data: &[u8]) -> Result<PathBuf> {
    let path = select_config_path(primary, alternatives).await?;
    write_atomic(&path, data).await?;
    debug!("Wrote config file: {} ({} bytes)", path.display(), data.len());
    Ok(path)
}
