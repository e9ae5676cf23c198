//! Atomic replacement of the configuration file read by the managed process.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Permissions of the written artifact.
pub const ARTIFACT_MODE: u32 = 0o644;

/// Sibling temp file the artifact is staged in before the rename.
fn staging_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::artifact_write(path, "path has no file name"))?;
    let mut staged = std::ffi::OsString::from(".");
    staged.push(file_name);
    staged.push(".tmp");
    Ok(path.with_file_name(staged))
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one.
pub async fn write_artifact(path: &Path, contents: &[u8]) -> Result<()> {
    let staged = staging_path(path)?;
    let fail = |e: std::io::Error| Error::artifact_write(path, e.to_string());

    tokio::fs::write(&staged, contents).await.map_err(fail)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(ARTIFACT_MODE))
            .await
            .map_err(fail)?;
    }

    if let Err(e) = tokio::fs::rename(&staged, path).await {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(fail(e));
    }
    debug!(path = %path.display(), bytes = contents.len(), "Artifact written");
    Ok(())
}
