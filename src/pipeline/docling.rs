//! Conversion engine backed by the `docling` command-line tool.
//!
//! Each instance holds a fixed argument list built once from its
//! [`PipelineOptions`]; `convert` only appends the input and a scratch output
//! directory. docling is asked for two outputs in one run:
//!
//! * `<stem>.md` with images in referenced mode, written to
//!   `<stem>_artifacts/` and linked by absolute path;
//! * `<stem>.json`, the structured document, from which the page count and
//!   the picture list are read.
//!
//! The scratch directory belongs to the returned [`DoclingDocument`] and is
//! removed when the document is dropped.

use crate::config::TableFormat;
use crate::pipeline::engine::{
    artifacts_dir_for, ConversionEngine, ConvertedDocument, EngineError, ImageRefMode,
    PipelineOptions, Picture,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, info};

/// A pre-configured docling invocation.
#[derive(Debug, Clone)]
pub struct DoclingEngine {
    name: String,
    program: PathBuf,
    options: PipelineOptions,
    args: Vec<OsString>,
}

impl DoclingEngine {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, options: PipelineOptions) -> Self {
        let args = build_args(&options);
        Self {
            name: name.into(),
            program: program.into(),
            options,
            args,
        }
    }

    /// Run `docling --version`; returns the reported version line.
    pub fn probe(&self) -> Result<String, EngineError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Launch {
                program: self.program.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Arguments shared by every invocation of this instance.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

fn build_args(options: &PipelineOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--to",
        "md",
        "--to",
        "json",
        "--image-export-mode",
        if options.generate_picture_images {
            "referenced"
        } else {
            "placeholder"
        },
        "--pdf-backend",
        options.pdf_backend.as_str(),
        "--device",
        options.accelerator.device.as_str(),
        "--num-threads",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(options.accelerator.num_threads.to_string().into());

    if options.do_ocr {
        args.push("--ocr".into());
        args.push("--ocr-engine".into());
        args.push("tesseract_cli".into());
        if !options.ocr_languages.is_empty() {
            args.push("--ocr-lang".into());
            args.push(options.ocr_languages.join(",").into());
        }
        if options.force_full_page_ocr {
            args.push("--force-ocr".into());
        }
    } else {
        args.push("--no-ocr".into());
    }
    args
}

impl ConversionEngine for DoclingEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn convert(
        &self,
        input: &Path,
        table_format: TableFormat,
    ) -> Result<Box<dyn ConvertedDocument>, EngineError> {
        let scratch = tempfile::Builder::new().prefix("docling-").tempdir()?;
        // docling has no table-format switch; the hint is recorded only.
        debug!(engine = %self.name, table_format = %table_format, "Running docling");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--output")
            .arg(scratch.path())
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Launch {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), 20),
            });
        }

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let markdown = scratch.path().join(format!("{stem}.md"));
        if !markdown.is_file() {
            return Err(EngineError::MissingOutput { path: markdown });
        }

        let json = scratch.path().join(format!("{stem}.json"));
        let structure = if json.is_file() {
            parse_structure(&std::fs::read_to_string(&json)?)?
        } else {
            DocumentStructure::default()
        };

        info!(
            engine = %self.name,
            pages = ?structure.page_count,
            pictures = structure.pictures.len(),
            "docling conversion finished"
        );

        Ok(Box::new(DoclingDocument {
            markdown,
            page_count: structure.page_count,
            pictures: structure.pictures,
            _scratch: scratch,
        }))
    }
}

/// docling output held in a scratch directory.
#[derive(Debug)]
pub struct DoclingDocument {
    markdown: PathBuf,
    page_count: Option<usize>,
    pictures: Vec<Picture>,
    _scratch: TempDir,
}

static RE_ANY_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\((?:[^()]|\([^()]*\))*\)").unwrap());

impl ConvertedDocument for DoclingDocument {
    fn page_count(&self) -> Option<usize> {
        self.page_count
    }

    fn pictures(&self) -> &[Picture] {
        &self.pictures
    }

    fn save_as_markdown(&self, dest: &Path, mode: ImageRefMode) -> Result<(), EngineError> {
        let text = std::fs::read_to_string(&self.markdown)?;
        match mode {
            ImageRefMode::Placeholder => {
                let text = RE_ANY_IMAGE.replace_all(&text, "<!-- image -->");
                std::fs::write(dest, text.as_ref())?;
            }
            ImageRefMode::Referenced => {
                let source_dir = artifacts_dir_for(&self.markdown);
                let mut text = text;
                if source_dir.is_dir() {
                    let dest_dir = artifacts_dir_for(dest);
                    relocate_dir(&source_dir, &dest_dir)?;
                    // docling links artifacts by absolute path; follow the move.
                    text = text.replace(
                        &source_dir.to_string_lossy().into_owned(),
                        &dest_dir.to_string_lossy(),
                    );
                }
                std::fs::write(dest, text)?;
            }
        }
        Ok(())
    }
}

/// Move `from` to `to`, copying when a rename crosses filesystems.
fn relocate_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    std::fs::remove_dir_all(from)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

// ── Structured output ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DocumentStructure {
    page_count: Option<usize>,
    pictures: Vec<Picture>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    pages: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pictures: Vec<RawPicture>,
}

#[derive(Deserialize)]
struct RawPicture {
    #[serde(default)]
    prov: Vec<RawProvenance>,
}

#[derive(Deserialize)]
struct RawProvenance {
    page_no: usize,
}

fn parse_structure(json: &str) -> Result<DocumentStructure, EngineError> {
    let raw: RawDocument =
        serde_json::from_str(json).map_err(|e| EngineError::Parse(e.to_string()))?;
    Ok(DocumentStructure {
        page_count: raw.pages.map(|p| p.len()),
        pictures: raw
            .pictures
            .into_iter()
            .map(|p| Picture {
                page: p.prov.first().map(|prov| prov.page_no),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcceleratorDevice;
    use crate::pipeline::engine::AcceleratorOptions;

    fn args_of(options: PipelineOptions) -> Vec<String> {
        DoclingEngine::new("t", "docling", options)
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn standard_args_request_md_json_and_referenced_images() {
        let args = args_of(PipelineOptions {
            ocr_languages: vec!["rus".into(), "eng".into()],
            accelerator: AcceleratorOptions {
                device: AcceleratorDevice::Cuda,
                num_threads: 8,
            },
            ..PipelineOptions::default()
        });
        let joined = args.join(" ");
        assert!(joined.contains("--to md --to json"));
        assert!(joined.contains("--image-export-mode referenced"));
        assert!(joined.contains("--device cuda --num-threads 8"));
        assert!(joined.contains("--ocr-engine tesseract_cli --ocr-lang rus,eng"));
        assert!(!args.contains(&"--force-ocr".to_string()));
    }

    #[test]
    fn force_ocr_instance_adds_flag() {
        let args = args_of(PipelineOptions {
            force_full_page_ocr: true,
            ..PipelineOptions::default()
        });
        assert!(args.contains(&"--force-ocr".to_string()));
    }

    #[test]
    fn ocr_disabled_instance() {
        let args = args_of(PipelineOptions {
            do_ocr: false,
            force_full_page_ocr: true,
            ..PipelineOptions::default()
        });
        assert!(args.contains(&"--no-ocr".to_string()));
        assert!(!args.contains(&"--force-ocr".to_string()));
    }

    #[test]
    fn without_picture_images_exports_placeholders() {
        let args = args_of(PipelineOptions {
            generate_picture_images: false,
            ..PipelineOptions::default()
        });
        assert!(args.join(" ").contains("--image-export-mode placeholder"));
    }

    #[test]
    fn parse_pages_and_pictures() {
        let json = r#"{
            "schema_name": "DoclingDocument",
            "pages": {"1": {"page_no": 1}, "2": {"page_no": 2}, "3": {"page_no": 3}},
            "pictures": [
                {"prov": [{"page_no": 2, "bbox": {}}]},
                {"prov": []}
            ]
        }"#;
        let s = parse_structure(json).unwrap();
        assert_eq!(s.page_count, Some(3));
        assert_eq!(s.pictures, vec![Picture { page: Some(2) }, Picture { page: None }]);
    }

    #[test]
    fn parse_without_pages_reports_unknown_count() {
        let s = parse_structure(r#"{"texts": []}"#).unwrap();
        assert_eq!(s.page_count, None);
        assert!(s.pictures.is_empty());
    }

    #[test]
    fn parse_garbage_is_parse_error() {
        assert!(matches!(parse_structure("not json"), Err(EngineError::Parse(_))));
    }

    #[test]
    fn missing_program_is_launch_error() {
        let engine = DoclingEngine::new("t", "/nonexistent/docling", PipelineOptions::default());
        let err = engine
            .convert(Path::new("/tmp/in.pdf"), TableFormat::Auto)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Launch { .. }));
        assert!(engine.probe().is_err());
    }

    fn scratch_document() -> DoclingDocument {
        let scratch = TempDir::new().unwrap();
        let markdown = scratch.path().join("input.md");
        let artifacts = scratch.path().join("input_artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join("image_000000_x.png"), b"png").unwrap();
        std::fs::write(
            &markdown,
            format!("# T\n\n![Image]({}/image_000000_x.png)\n", artifacts.display()),
        )
        .unwrap();
        DoclingDocument {
            markdown,
            page_count: Some(1),
            pictures: vec![Picture { page: Some(1) }],
            _scratch: scratch,
        }
    }

    #[test]
    fn referenced_export_moves_artifacts_next_to_dest() {
        let dir = TempDir::new().unwrap();
        let doc = scratch_document();
        let dest = dir.path().join("document.md");

        doc.save_as_markdown(&dest, ImageRefMode::Referenced).unwrap();
        let dest_artifacts = dir.path().join("document_artifacts");
        assert!(dest_artifacts.join("image_000000_x.png").is_file());
        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(
            text.contains(&format!("{}/image_000000_x.png", dest_artifacts.display())),
            "{text}"
        );
    }

    #[test]
    fn placeholder_export_writes_no_artifacts() {
        let dir = TempDir::new().unwrap();
        let doc = scratch_document();
        let dest = dir.path().join("document.md");

        doc.save_as_markdown(&dest, ImageRefMode::Placeholder).unwrap();
        assert!(!dir.path().join("document_artifacts").exists());
        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("<!-- image -->"));
        assert!(!text.contains("!["));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
