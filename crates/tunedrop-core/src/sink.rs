//! Destination-file handling for transfers.
//!
//! A [`FileSink`] owns the partial file of one running transfer. Bytes are
//! appended in the order they arrive; [`FileSink::finalize`] moves the file to
//! its final location and [`FileSink::discard`] deletes it. Both consume the
//! sink, so the handle is always released before the file is touched again.
//!
//! Partial files live at a deterministic path derived from the transfer id and
//! file name, next to a small JSON sidecar holding the [`ResumeValidator`]
//! needed to resume safely.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result};
use crate::fetch::ResumeValidator;

/// Extension used for partial files.
pub const PARTIAL_EXTENSION: &str = "part";

fn write_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn create_dir_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::CreateDirFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn delete_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::DeleteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn move_error(src: &Path, dst: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::MoveFailed {
        source_path: src.to_path_buf(),
        destination: dst.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Path of the partial file for a transfer.
#[must_use]
pub fn partial_path(incomplete_dir: &Path, id: &str, file_name: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0]);
    hasher.update(file_name.as_bytes());
    let digest = hasher.finalize();
    let key: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    incomplete_dir.join(format!("{key}.{PARTIAL_EXTENSION}"))
}

/// Path of the resume sidecar belonging to a partial file.
#[must_use]
pub fn sidecar_path(partial: &Path) -> PathBuf {
    let mut name = partial.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Size of the file at `path`, or `0` if it does not exist.
pub async fn current_size(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Read the resume validator stored next to a partial file.
pub async fn load_validator(partial: &Path) -> Option<ResumeValidator> {
    let sidecar = sidecar_path(partial);
    let content = fs::read_to_string(&sidecar).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(validator) => Some(validator),
        Err(e) => {
            warn!("Ignoring unreadable resume data {}: {}", sidecar.display(), e);
            None
        }
    }
}

/// Record the resume validator for a partial file.
pub async fn store_validator(partial: &Path, validator: &ResumeValidator) -> Result<()> {
    let sidecar = sidecar_path(partial);
    let content = serde_json::to_string(validator)?;
    fs::write(&sidecar, content)
        .await
        .map_err(|e| write_error(&sidecar, e))
}

/// Delete a partial file and its sidecar. Missing files are not an error.
pub async fn remove_partial(partial: &Path) -> Result<()> {
    for path in [partial.to_path_buf(), sidecar_path(partial)] {
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(delete_error(&path, e)),
        }
    }
    Ok(())
}

/// First free path for `file_name` in `dir`, adding ` (1)`, ` (2)`, ... before
/// the extension when the name is taken.
pub async fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if fs::try_exists(&candidate).await.ok() != Some(true) {
        return candidate;
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };
    let mut n = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if fs::try_exists(&candidate).await.ok() != Some(true) {
            return candidate;
        }
        n += 1;
    }
}

/// Exclusive writer for one transfer's partial file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
}

impl FileSink {
    /// Open `path` for writing, appending to existing content when `append`
    /// is set and truncating it otherwise.
    pub async fn open(path: &Path, append: bool) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| create_dir_error(parent, e))?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(path).await.map_err(|e| write_error(path, e))?;
        let size = if append { current_size(path).await } else { 0 };

        debug!(
            "Opened {} ({} bytes already present)",
            path.display(),
            size
        );
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            size,
        })
    }

    /// Path of the partial file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the file, including those still buffered.
    pub const fn current_size(&self) -> u64 {
        self.size
    }

    /// Append a chunk.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| write_error(&self.path, e))?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes and release the handle, keeping the file.
    pub async fn close(mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| write_error(&self.path, e))?;
        self.file
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| write_error(&self.path, e))
    }

    /// Flush, release the handle and move the file to `dest`.
    ///
    /// Falls back to copy-and-delete when a rename is not possible, e.g.
    /// across file systems.
    pub async fn finalize(self, dest: &Path) -> Result<PathBuf> {
        let src = self.path.clone();
        self.close().await?;

        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| create_dir_error(parent, e))?;
        }

        if let Err(rename_err) = fs::rename(&src, dest).await {
            debug!(
                "Rename {} -> {} failed ({}), copying instead",
                src.display(),
                dest.display(),
                rename_err
            );
            fs::copy(&src, dest)
                .await
                .map_err(|e| move_error(&src, dest, e))?;
            fs::remove_file(&src)
                .await
                .map_err(|e| delete_error(&src, e))?;
        }

        let sidecar = sidecar_path(&src);
        if let Err(e) = fs::remove_file(&sidecar).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove resume data {}: {}", sidecar.display(), e);
        }
        info!("Moved {} to {}", src.display(), dest.display());
        Ok(dest.to_path_buf())
    }

    /// Release the handle and delete the partial file and its sidecar.
    pub async fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        remove_partial(&path).await
    }
}
