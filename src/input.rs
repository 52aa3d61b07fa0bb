//! Input resolution: turn a user-supplied path or URL into a [`ConversionJob`].
//!
//! Documents are held in memory for the whole conversion: pdfium opens them
//! from a byte slice, so nothing is written to disk. The `%PDF-` header is
//! not checked here; the pipeline does that for every job, whatever its
//! origin.

use crate::error::DispatchError;
use crate::job::ConversionJob;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a job labelled with the input string.
pub async fn load_job(input: &str, download_timeout_secs: u64) -> Result<ConversionJob, DispatchError> {
    let bytes = if is_url(input) {
        download_url(input, download_timeout_secs).await?
    } else if input.trim().is_empty() {
        return Err(DispatchError::InvalidInput {
            input: input.to_string(),
        });
    } else {
        read_local(Path::new(input)).await?
    };
    Ok(ConversionJob::new(bytes).with_label(input))
}

/// Read a local file into memory.
pub async fn read_local(path: &Path) -> Result<Vec<u8>, DispatchError> {
    let path_buf = PathBuf::from(path);
    if path.is_dir() {
        return Err(DispatchError::InvalidInput {
            input: path.display().to_string(),
        });
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DispatchError::FileNotFound { path: path_buf.clone() },
        std::io::ErrorKind::PermissionDenied => DispatchError::PermissionDenied { path: path_buf.clone() },
        _ => DispatchError::Internal(format!("reading {}: {e}", path.display())),
    })?;

    debug!("Read {} bytes from {}", bytes.len(), path.display());
    Ok(bytes)
}

/// Download a URL into memory.
pub async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, DispatchError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| DispatchError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            DispatchError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(classify)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(classify)?;
    info!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
}

/// File stem used to name the Markdown written for `input`.
pub fn output_stem(input: &str) -> String {
    let last = if is_url(input) {
        reqwest::Url::parse(input)
            .ok()
            .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
            .unwrap_or_default()
    } else {
        Path::new(input)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let stem = Path::new(&last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.is_empty() {
        "document".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[tokio::test]
    async fn local_file_becomes_labelled_job() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF-1.7 body").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let job = load_job(&path, 5).await.unwrap();
        assert_eq!(job.byte_len(), 13);
        assert_eq!(job.label(), path);
    }

    #[tokio::test]
    async fn missing_file_is_typed() {
        let err = load_job("/no/such/dir/file.pdf", 5).await.unwrap_err();
        assert!(matches!(err, DispatchError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn directory_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_local(dir.path()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput { .. }));
    }

    #[test]
    fn stems_from_paths_and_urls() {
        assert_eq!(output_stem("/tmp/report.pdf"), "report");
        assert_eq!(output_stem("https://example.com/papers/attn.pdf?x=1"), "attn");
        assert_eq!(output_stem("https://example.com/"), "document");
    }
}
