//! Artifact normalization: canonical `images/` directory and link rewriting.
//!
//! An export in referenced mode leaves the engine's intermediate directory
//! `<stem>_artifacts/` next to the document, and the document links into it.
//! This stage turns that into the bundle layout:
//!
//! 1. create `images/`;
//! 2. move every intermediate file, nested ones included, into `images/`
//!    under a fresh UUID name, recording its relative path → new name;
//! 3. remove the intermediate directory;
//! 4. rewrite every image reference that points into it.
//!
//! A reference points into the intermediate directory when one of its
//! directory components is the intermediate name (absolute or relative
//! form); the rest of the path is looked up in the recorded mapping. A bare
//! `images/<name>` reference is rewritten when `<name>` was a top-level file.
//! Both Markdown `![alt](target)` and HTML `<img src="target">` links are
//! covered; `file://` prefixes and percent-encoding are undone before
//! matching.

use crate::pipeline::engine::artifacts_dir_for;
use crate::store::IMAGES_DIR;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of normalizing one document's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedArtifacts {
    pub images_dir: PathBuf,
    /// Files present in `images/` afterwards.
    pub image_count: usize,
    /// References rewritten to `images/<new-name>`.
    pub rewritten: usize,
    /// References into the intermediate directory with no matching file.
    pub unresolved: usize,
}

/// Normalize the artifacts of the document at `markdown_path`.
///
/// Blocking; call from `spawn_blocking`.
pub fn normalize_artifacts(markdown_path: &Path) -> io::Result<NormalizedArtifacts> {
    let output_dir = markdown_path.parent().unwrap_or_else(|| Path::new(""));
    let images_dir = output_dir.join(IMAGES_DIR);
    let artifacts_dir = artifacts_dir_for(markdown_path);
    let artifacts_name = artifacts_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut rewritten = 0;
    let mut unresolved = 0;

    if artifacts_dir.is_dir() {
        info!("Moving {} into {}/", artifacts_name, IMAGES_DIR);
        std::fs::create_dir_all(&images_dir)?;
        let mapping = move_artifacts(&artifacts_dir, &images_dir)?;
        std::fs::remove_dir_all(&artifacts_dir)?;

        let markdown = std::fs::read_to_string(markdown_path)?;
        let result = rewrite_image_references(&markdown, &artifacts_name, &mapping);
        rewritten = result.rewritten;
        unresolved = result.unresolved;
        if unresolved > 0 {
            warn!(
                "{} image reference(s) into {} have no matching file",
                unresolved, artifacts_name
            );
        }
        std::fs::write(markdown_path, result.text)?;
        debug!("Rewrote {} image reference(s)", rewritten);
    } else {
        debug!("No intermediate artifacts at {}", artifacts_dir.display());
    }

    let image_count = if images_dir.is_dir() {
        std::fs::read_dir(&images_dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .count()
    } else {
        0
    };

    Ok(NormalizedArtifacts {
        images_dir,
        image_count,
        rewritten,
        unresolved,
    })
}

/// Move every file below `from` into `to` under a fresh name.
/// Returns relative path (`/`-separated) → new name.
fn move_artifacts(from: &Path, to: &Path) -> io::Result<HashMap<String, String>> {
    let mut files = Vec::new();
    collect_files(from, &mut files)?;
    files.sort();

    let mut mapping = HashMap::with_capacity(files.len());
    for path in files {
        let Some(old_name) = relative_key(from, &path) else {
            warn!("Skipping artifact outside {}: {}", from.display(), path.display());
            continue;
        };
        let new_name = fresh_image_name(&path);
        std::fs::rename(&path, to.join(&new_name))?;
        debug!("{} → {}/{}", old_name, IMAGES_DIR, new_name);
        mapping.insert(old_name, new_name);
    }
    Ok(mapping)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        } else {
            warn!("Skipping special artifact {}", entry.path().display());
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Collision-resistant name keeping the (lower-cased) extension.
fn fresh_image_name(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "png".to_string());
    format!("{}.{}", Uuid::new_v4().simple(), ext)
}

// ── Reference rewriting ──────────────────────────────────────────────────

// Targets may hold one level of balanced parentheses, e.g. `/srv/docs (v2)/x.png`.
static RE_MD_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(((?:[^()]|\([^()]*\))*)\)").unwrap());

static RE_HTML_IMG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<img\b[^>]*?\bsrc\s*=\s*)(["'])([^"']*)(["'])"#).unwrap());

/// Text after rewriting, with counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    pub text: String,
    pub rewritten: usize,
    pub unresolved: usize,
}

enum Target {
    Rewritten(String),
    Unresolved,
    Unrelated,
}

/// Rewrite image references into the intermediate directory `artifacts_name`
/// using `mapping` (old file name → new file name inside `images/`).
pub fn rewrite_image_references(
    text: &str,
    artifacts_name: &str,
    mapping: &HashMap<String, String>,
) -> RewriteResult {
    let mut rewritten = 0;
    let mut unresolved = 0;

    let text = RE_MD_IMAGE.replace_all(text, |caps: &Captures<'_>| {
        let (target, title) = split_title(&caps[2]);
        match classify(target, artifacts_name, mapping) {
            Target::Rewritten(new) => {
                rewritten += 1;
                format!("![{}]({}{})", &caps[1], new, title)
            }
            Target::Unresolved => {
                unresolved += 1;
                caps[0].to_string()
            }
            Target::Unrelated => caps[0].to_string(),
        }
    });

    let text = RE_HTML_IMG.replace_all(&text, |caps: &Captures<'_>| {
        match classify(&caps[3], artifacts_name, mapping) {
            Target::Rewritten(new) => {
                rewritten += 1;
                format!("{}{}{}{}", &caps[1], &caps[2], new, &caps[4])
            }
            Target::Unresolved => {
                unresolved += 1;
                caps[0].to_string()
            }
            Target::Unrelated => caps[0].to_string(),
        }
    });

    RewriteResult {
        text: text.into_owned(),
        rewritten,
        unresolved,
    }
}

/// Split `path "title"` into the path and the ` "title"` suffix.
fn split_title(inner: &str) -> (&str, &str) {
    let trimmed = inner.trim();
    if trimmed.ends_with('"') {
        if let Some(idx) = trimmed.rfind(" \"") {
            return (trimmed[..idx].trim_end(), &trimmed[idx..]);
        }
    }
    (trimmed, "")
}

fn classify(raw: &str, artifacts_name: &str, mapping: &HashMap<String, String>) -> Target {
    let target = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let target = target.strip_prefix("file://").unwrap_or(target);
    let decoded: Cow<'_, str> = urlencoding::decode(target).unwrap_or(Cow::Borrowed(target));
    let normalised = decoded.replace('\\', "/");

    let segments: Vec<&str> = normalised.split('/').collect();

    if let Some(pos) = segments.iter().rposition(|seg| *seg == artifacts_name) {
        let key = segments[pos + 1..].join("/");
        return match mapping.get(&key) {
            Some(new) => Target::Rewritten(format!("{IMAGES_DIR}/{new}")),
            None => Target::Unresolved,
        };
    }

    match segments.as_slice() {
        [.., parent, file] if *parent == IMAGES_DIR => match mapping.get(*file) {
            Some(new) => Target::Rewritten(format!("{IMAGES_DIR}/{new}")),
            None => Target::Unrelated,
        },
        _ => Target::Unrelated,
    }
}

/// Every image link target in `text`, Markdown and HTML, in order of
/// appearance per syntax.
pub fn image_references(text: &str) -> Vec<String> {
    let md = RE_MD_IMAGE
        .captures_iter(text)
        .map(|c| split_title(&c[2]).0.to_string());
    let html = RE_HTML_IMG.captures_iter(text).map(|c| c[3].to_string());
    md.chain(html).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
