//! Packaging a finished task directory into a zip archive.
//!
//! The archive is written to `<parent>/<dir-name>.zip.partial` and renamed into
//! place, so a reader never sees a half-written `.zip`. Entry names are
//! relative to the task directory and sorted; `images/` is always present as a
//! directory entry, even when empty. The source directory is removed only
//! after the rename succeeds.

use crate::error::DocBundleError;
use crate::store::IMAGES_DIR;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Zip `task_dir` into `<parent>/<name>.zip` and remove `task_dir`.
///
/// Runs on the blocking pool.
pub async fn pack(task_dir: &Path) -> Result<PathBuf, DocBundleError> {
    let dir = task_dir.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&dir))
        .await
        .map_err(|e| DocBundleError::Packaging {
            path: task_dir.to_path_buf(),
            detail: e.to_string(),
        })?
}

fn pack_blocking(task_dir: &Path) -> Result<PathBuf, DocBundleError> {
    let packaging = |detail: String| DocBundleError::Packaging {
        path: task_dir.to_path_buf(),
        detail,
    };

    let name = task_dir
        .file_name()
        .ok_or_else(|| packaging("directory has no name".to_string()))?
        .to_string_lossy()
        .into_owned();
    let parent = task_dir.parent().unwrap_or_else(|| Path::new(""));
    let archive = parent.join(format!("{name}.zip"));
    let partial = parent.join(format!("{name}.zip.partial"));

    let entries = collect_entries(task_dir).map_err(|e| packaging(e.to_string()))?;
    let written = write_archive(task_dir, &entries, &partial);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&partial);
        return Err(packaging(e.to_string()));
    }

    std::fs::rename(&partial, &archive).map_err(|e| packaging(format!("rename: {e}")))?;
    std::fs::remove_dir_all(task_dir).map_err(|e| packaging(format!("remove source: {e}")))?;

    info!("Packaged {} entries into {}", entries.len(), archive.display());
    Ok(archive)
}

/// One archive entry, relative to the task directory with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir(String),
    File(String),
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Dir(n) | Entry::File(n) => n,
        }
    }
}

fn collect_entries(root: &Path) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    walk(root, "", &mut entries)?;
    let images = format!("{IMAGES_DIR}/");
    if !entries.iter().any(|e| e.name() == images) {
        entries.push(Entry::Dir(images));
    }
    entries.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(entries)
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<Entry>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let relative = format!("{prefix}{file_name}");
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            out.push(Entry::Dir(format!("{relative}/")));
            walk(&entry.path(), &format!("{relative}/"), out)?;
        } else if file_type.is_file() {
            out.push(Entry::File(relative));
        }
    }
    Ok(())
}

fn write_archive(root: &Path, entries: &[Entry], dest: &Path) -> io::Result<()> {
    let file = File::create(dest)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in entries {
        match entry {
            Entry::Dir(name) => {
                zip.add_directory(name.as_str(), options).map_err(io::Error::other)?;
            }
            Entry::File(name) => {
                debug!("Adding {}", name);
                zip.start_file(name.as_str(), options).map_err(io::Error::other)?;
                let bytes = std::fs::read(root.join(name))?;
                zip.write_all(&bytes)?;
            }
        }
    }

    let mut writer = zip.finish().map_err(io::Error::other)?;
    writer.flush()?;
    Ok(())
}
