//! Configuration types for the document bundling service.
//!
//! Process-wide settings live in [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`]. They are read once at start-up: the two engine
//! instances, the storage root and the cleanup cadence are all derived from
//! this struct and never change per request. Per-request knobs are carried by
//! [`ProcessingOptions`].

use crate::error::DocBundleError;
use crate::pipeline::engine::{AcceleratorOptions, PipelineOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the job service.
///
/// Built via [`ServiceConfig::builder()`] or using [`ServiceConfig::default()`].
///
/// # Example
/// ```rust
/// use docbundle::ServiceConfig;
/// use std::time::Duration;
///
/// let config = ServiceConfig::builder()
///     .storage_root("/var/lib/docbundle")
///     .ttl(Duration::from_secs(6 * 3600))
///     .max_upload_mb(20)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bind address for the HTTP surface. Default: `0.0.0.0`.
    pub host: String,

    /// Bind port for the HTTP surface. Default: 8000.
    pub port: u16,

    /// Root directory for task directories, archives and uploads.
    /// Default: `/tmp/docbundle`.
    ///
    /// This is the only durable state. A restart loses the in-memory registry
    /// but leaves whatever is on disk.
    pub storage_root: PathBuf,

    /// Age after which a job and its files are evicted. Default: 24 h.
    pub ttl: Duration,

    /// Maximum accepted upload size in bytes. Default: 50 MB.
    pub max_upload_bytes: u64,

    /// Compute device handed to the engine. Default: CPU.
    pub accelerator: AcceleratorDevice,

    /// Worker threads handed to the engine. Default: 4.
    pub num_threads: usize,

    /// Tesseract language codes used for OCR. Default: `rus`, `eng`.
    pub ocr_languages: Vec<String>,

    /// Pause between eviction passes. Default: 1 h.
    pub cleanup_interval: Duration,

    /// Pause before retrying after a failed eviction pass. Default: 5 min.
    pub cleanup_retry_interval: Duration,

    /// Upper bound for one legacy-format bridge invocation. Default: 60 s.
    pub bridge_timeout: Duration,

    /// Conversion engine executable. Default: `docling`.
    pub engine_program: PathBuf,

    /// Legacy-format bridge executable. Default: `soffice`.
    pub bridge_program: PathBuf,

    /// Jobs allowed to run the pipeline at the same time. Default: 2.
    ///
    /// Conversion is CPU/accelerator bound and the engine already uses
    /// `num_threads` internally; extra jobs wait in PENDING for a slot.
    pub max_concurrent_jobs: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            storage_root: PathBuf::from("/tmp/docbundle"),
            ttl: Duration::from_secs(24 * 3600),
            max_upload_bytes: 50 * 1024 * 1024,
            accelerator: AcceleratorDevice::default(),
            num_threads: 4,
            ocr_languages: vec!["rus".to_string(), "eng".to_string()],
            cleanup_interval: Duration::from_secs(3600),
            cleanup_retry_interval: Duration::from_secs(300),
            bridge_timeout: Duration::from_secs(60),
            engine_program: PathBuf::from("docling"),
            bridge_program: PathBuf::from("soffice"),
            max_concurrent_jobs: 2,
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Engine options for the standard or the force-full-page-OCR pipeline.
    ///
    /// Both pipelines share the same accelerator and language settings; only
    /// the OCR mode differs.
    pub fn pipeline_options(&self, force_full_page_ocr: bool) -> PipelineOptions {
        PipelineOptions {
            do_ocr: true,
            force_full_page_ocr,
            ocr_languages: self.ocr_languages.clone(),
            accelerator: AcceleratorOptions {
                device: self.accelerator,
                num_threads: self.num_threads,
            },
            ..PipelineOptions::default()
        }
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    pub fn ttl_hours(mut self, hours: u64) -> Self {
        self.config.ttl = Duration::from_secs(hours.saturating_mul(3600));
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn max_upload_mb(mut self, mb: u64) -> Self {
        self.config.max_upload_bytes = mb.saturating_mul(1024 * 1024);
        self
    }

    pub fn accelerator(mut self, device: AcceleratorDevice) -> Self {
        self.config.accelerator = device;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = n.max(1);
        self
    }

    pub fn ocr_languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.ocr_languages = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn cleanup_retry_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_retry_interval = interval;
        self
    }

    pub fn bridge_timeout(mut self, timeout: Duration) -> Self {
        self.config.bridge_timeout = timeout;
        self
    }

    pub fn engine_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.engine_program = program.into();
        self
    }

    pub fn bridge_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.bridge_program = program.into();
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, DocBundleError> {
        let c = &self.config;
        if c.ttl.is_zero() {
            return Err(DocBundleError::InvalidConfig(
                "TTL must be greater than zero".into(),
            ));
        }
        if chrono::Duration::from_std(c.ttl).is_err() {
            return Err(DocBundleError::InvalidConfig(format!(
                "TTL of {}s is out of range",
                c.ttl.as_secs()
            )));
        }
        if c.max_upload_bytes == 0 {
            return Err(DocBundleError::InvalidConfig(
                "Maximum upload size must be ≥ 1 byte".into(),
            ));
        }
        if c.cleanup_interval.is_zero() || c.cleanup_retry_interval.is_zero() {
            return Err(DocBundleError::InvalidConfig(
                "Cleanup intervals must be greater than zero".into(),
            ));
        }
        if c.bridge_timeout.is_zero() {
            return Err(DocBundleError::InvalidConfig(
                "Bridge timeout must be greater than zero".into(),
            ));
        }
        if c.ocr_languages.iter().any(|l| l.trim().is_empty()) {
            return Err(DocBundleError::InvalidConfig(
                "OCR language codes must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Compute device the engine runs its models on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorDevice {
    #[default]
    Cpu,
    Cuda,
    /// Apple Metal Performance Shaders.
    Mps,
}

impl AcceleratorDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorDevice::Cpu => "cpu",
            AcceleratorDevice::Cuda => "cuda",
            AcceleratorDevice::Mps => "mps",
        }
    }
}

impl fmt::Display for AcceleratorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcceleratorDevice {
    type Err = DocBundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(AcceleratorDevice::Cpu),
            "cuda" => Ok(AcceleratorDevice::Cuda),
            "mps" => Ok(AcceleratorDevice::Mps),
            other => Err(DocBundleError::InvalidConfig(format!(
                "Unknown accelerator device '{other}' (expected cpu, cuda or mps)"
            ))),
        }
    }
}

/// Table export format requested by the caller.
///
/// Forwarded to the engine as a hint; engines are free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Auto,
    Markdown,
    Html,
}

impl TableFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableFormat::Auto => "auto",
            TableFormat::Markdown => "markdown",
            TableFormat::Html => "html",
        }
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableFormat {
    type Err = DocBundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(TableFormat::Auto),
            "markdown" | "md" => Ok(TableFormat::Markdown),
            "html" => Ok(TableFormat::Html),
            _ => Err(DocBundleError::InvalidOption {
                option: "table_format".into(),
                value: s.to_string(),
            }),
        }
    }
}

/// Per-job processing options. Immutable for the duration of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Run OCR over every full page, even where embedded text was found.
    pub force_ocr: bool,
    /// Table export hint for the engine.
    pub table_format: TableFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ServiceConfig::default();
        assert_eq!(c.port, 8000);
        assert_eq!(c.ttl, Duration::from_secs(86_400));
        assert_eq!(c.max_upload_bytes, 52_428_800);
        assert_eq!(c.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(c.cleanup_retry_interval, Duration::from_secs(300));
        assert_eq!(c.bridge_timeout, Duration::from_secs(60));
        assert_eq!(c.ocr_languages, vec!["rus", "eng"]);
    }

    #[test]
    fn builder_rejects_zero_ttl() {
        let err = ServiceConfig::builder()
            .ttl(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, DocBundleError::InvalidConfig(_)));
    }

    #[test]
    fn huge_ttl_hours_saturate_and_are_rejected() {
        let err = ServiceConfig::builder()
            .ttl_hours(u64::MAX)
            .build()
            .unwrap_err();
        assert!(matches!(err, DocBundleError::InvalidConfig(_)));

        let c = ServiceConfig::builder().ttl_hours(6).build().unwrap();
        assert_eq!(c.ttl, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn builder_clamps_counts() {
        let c = ServiceConfig::builder()
            .num_threads(0)
            .max_concurrent_jobs(0)
            .build()
            .unwrap();
        assert_eq!(c.num_threads, 1);
        assert_eq!(c.max_concurrent_jobs, 1);
    }

    #[test]
    fn pipeline_options_differ_only_in_ocr_mode() {
        let c = ServiceConfig::builder()
            .accelerator(AcceleratorDevice::Cuda)
            .num_threads(8)
            .build()
            .unwrap();
        let standard = c.pipeline_options(false);
        let forced = c.pipeline_options(true);
        assert!(!standard.force_full_page_ocr);
        assert!(forced.force_full_page_ocr);
        assert_eq!(standard.accelerator, forced.accelerator);
        assert_eq!(forced.accelerator.device, AcceleratorDevice::Cuda);
        assert_eq!(forced.accelerator.num_threads, 8);
    }

    #[test]
    fn parse_table_format() {
        assert_eq!("HTML".parse::<TableFormat>().unwrap(), TableFormat::Html);
        assert_eq!("".parse::<TableFormat>().unwrap(), TableFormat::Auto);
        assert_eq!("md".parse::<TableFormat>().unwrap(), TableFormat::Markdown);
        assert!("csv".parse::<TableFormat>().unwrap_err().is_validation());
    }

    #[test]
    fn parse_accelerator() {
        assert_eq!("MPS".parse::<AcceleratorDevice>().unwrap(), AcceleratorDevice::Mps);
        assert!("tpu".parse::<AcceleratorDevice>().is_err());
    }
}
