//! Input classification and resolution.
//!
//! Two jobs live here:
//!
//! * [`DocumentFormat`] / [`validate_upload`] decide whether an upload is
//!   accepted at all, and whether it needs legacy-format bridging. This runs
//!   before a job is created, so a rejected upload leaves nothing behind.
//! * [`resolve_input`] turns the `docbundle convert` argument (a local path or
//!   an HTTP/HTTPS URL) into a local file. URLs are downloaded into a
//!   `TempDir` that is removed when the [`ResolvedInput`] is dropped.

use crate::error::DocBundleError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Extensions accepted for upload, in display order.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".pdf", ".docx", ".doc", ".xlsx", ".xls", ".jpg", ".jpeg", ".png",
];

/// Document formats the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    /// Legacy Word 97–2003; bridged to `.docx`.
    Doc,
    Xlsx,
    /// Legacy Excel 97–2003; bridged to `.xlsx`.
    Xls,
    Jpeg,
    Png,
}

impl DocumentFormat {
    /// Classify by extension (case-insensitive, with or without leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "doc" => Some(Self::Doc),
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    /// Classify a path by its extension, rejecting anything unsupported.
    pub fn from_path(path: &Path) -> Result<Self, DocBundleError> {
        let ext = extension_of(path);
        Self::from_extension(&ext).ok_or_else(|| unsupported(&ext))
    }

    /// The modern format a legacy format is bridged to, if bridging is needed.
    pub fn bridge_target(&self) -> Option<DocumentFormat> {
        match self {
            Self::Doc => Some(Self::Docx),
            Self::Xls => Some(Self::Xlsx),
            _ => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.bridge_target().is_some()
    }

    /// Canonical extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Lower-cased extension of `path` including the leading dot, or `""`.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Check an upload's size and extension before any job is created.
///
/// Returns the format and the normalised extension (with leading dot) the
/// upload should be stored under.
pub fn validate_upload(
    file_name: &str,
    size: u64,
    max_bytes: u64,
) -> Result<(DocumentFormat, String), DocBundleError> {
    if size > max_bytes {
        return Err(DocBundleError::FileTooLarge {
            size,
            max: max_bytes,
        });
    }
    let ext = extension_of(Path::new(file_name));
    let format = DocumentFormat::from_extension(&ext).ok_or_else(|| unsupported(&ext))?;
    Ok((format, ext))
}

fn unsupported(ext: &str) -> DocBundleError {
    DocBundleError::UnsupportedFileType {
        extension: if ext.is_empty() {
            "(none)".to_string()
        } else {
            ext.to_string()
        },
        allowed: ALLOWED_EXTENSIONS.join(", "),
    }
}

// ── CLI input resolution ─────────────────────────────────────────────────

/// The resolved input — either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the file lives in a temp directory kept alive until
    /// processing completes.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or URL to a local, supported document.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, DocBundleError> {
    let resolved = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        let path = PathBuf::from(input);
        if !path.is_file() {
            return Err(DocBundleError::FileNotFound { path });
        }
        debug!("Resolved local input: {}", path.display());
        ResolvedInput::Local(path)
    };
    DocumentFormat::from_path(resolved.path())?;
    Ok(resolved)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, DocBundleError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DocBundleError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DocBundleError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            DocBundleError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(DocBundleError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = filename_from_url(url);
    let temp_dir = TempDir::new().map_err(|e| DocBundleError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| DocBundleError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| DocBundleError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it carries an extension.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}
