use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use tokio::fs;

/// Path the new contents are staged at before replacing `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

/// Replaces the file at `path` with `contents`, creating missing parent
/// directories. Readers never observe a half-written file.
pub async fn write_file_atomically(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let staging = staging_path(path);
    fs::write(&staging, contents)
        .await
        .with_context(|| format!("Failed to write {:?}", staging))?;

    if let Err(e) = fs::rename(&staging, path).await {
        let _ = fs::remove_file(&staging).await;
        return Err(e).with_context(|| format!("Failed to replace {:?}", path));
    }
    debug!("Wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_replaces_contents() {
        let dir = std::env::temp_dir().join(format!("bike-bridge-utils-{}", std::process::id()));
        let path = dir.join("a").join("b").join("settings.json");

        write_file_atomically(&path, "first").await.unwrap();
        write_file_atomically(&path, "second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!staging_path(&path).exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
