use std::path::Path;

/// Creates a temporary file next to `path` named after it, e.g.
/// `.repodata.json.XXXXXX`.
fn temp_file_for(path: &Path) -> std::io::Result<tempfile::NamedTempFile> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        )
    })?;

    let prefix = format!(
        ".{}.",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")
    );

    tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)
}

/// Writes `contents` to a temporary file in the directory of `path` and
/// renames it over `path`. Readers never observe a partially written file.
pub async fn atomic_write(path: &Path, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    let temp_path = temp_file_for(path)?.into_temp_path();
    tokio::fs::write(&temp_path, contents).await?;
    temp_path.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Synchronous version of [`atomic_write`].
pub fn atomic_write_sync(path: &Path, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    let mut temp_file = temp_file_for(path)?;
    std::io::Write::write_all(&mut temp_file, contents.as_ref())?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
