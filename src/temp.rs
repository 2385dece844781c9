//! Scoped temp-path helpers.

use std::future::Future;
use std::path::PathBuf;

use crate::error::{Result, ScriptError};

/// Create a temporary directory for the duration of `cb`; it is
/// removed afterwards, whether or not `cb` succeeded.
pub async fn with_temp_dir<F, Fut, T>(cb: F) -> Result<T>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let dir = tempfile::tempdir()
        .map_err(|err| ScriptError::unhandled(format!("failed to create temp directory: {err}")))?;
    let result = cb(dir.path().to_path_buf()).await;
    let _ = dir.close();
    result
}

/// Create an empty temporary file for the duration of `cb`.
pub async fn with_temp_file<F, Fut, T>(cb: F) -> Result<T>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let file = tempfile::NamedTempFile::new()
        .map_err(|err| ScriptError::unhandled(format!("failed to create temp file: {err}")))?;
    let result = cb(file.path().to_path_buf()).await;
    let _ = file.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn temp_dir_is_removed_after_use() {
        let kept = with_temp_dir(|path| async move {
            std::fs::write(path.join("f"), "x")
                .map_err(|err| ScriptError::unhandled(err.to_string()))?;
            Ok(path)
        })
        .await
        .unwrap();
        assert!(!kept.exists());
    }

    #[tokio::test]
    async fn temp_file_is_removed_even_on_error() {
        let mut seen = None;
        let result: Result<()> = with_temp_file(|path| {
            seen = Some(path.clone());
            async move { Err(ScriptError::unhandled("boom")) }
        })
        .await;
        assert!(result.is_err());
        assert!(!seen.unwrap().exists());
    }
}
