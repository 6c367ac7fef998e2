//! On-disk artifact storage.
//!
//! Artifacts are plain files under the configured output directory. The
//! producer lock is the presence of a sibling `.tmp` file; atomic publish is
//! write-then-rename, so readers never observe a partially written artifact.

use jwalk::WalkDir;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ArtifactStore, WriteHandle};
use crate::cache::header;
use crate::error::{BalerError, Result};
use crate::utils::mtime::{mtime_ms, now_ms};

/// Suffix of the temporary file a producer writes before renaming.
const TMP_SUFFIX: &str = ".tmp";

pub struct DiskStore {
    out_dir: PathBuf,
    /// Staleness bound for abandoned temp files (the maximum build duration)
    max_build: Duration,
}

impl DiskStore {
    pub fn new(out_dir: &Path, max_build: Duration) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            max_build,
        }
    }

    fn artifact_path(&self, key: &str) -> PathBuf {
        self.out_dir.join(key)
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.out_dir.join(format!("{key}{TMP_SUFFIX}"))
    }

    /// Whether an existing temp file is a leftover from a crashed producer.
    ///
    /// A temp file older than the committed artifact, or older than the
    /// maximum build duration, cannot belong to a live build.
    fn tmp_is_stale(&self, tmp: &Path, dest: &Path) -> bool {
        let tmp_mtime = mtime_ms(tmp).unwrap_or(0);
        if let Some(dest_mtime) = mtime_ms(dest)
            && tmp_mtime < dest_mtime
        {
            return true;
        }
        now_ms().saturating_sub(tmp_mtime) > self.max_build.as_millis() as u64
    }
}

impl ArtifactStore for DiskStore {
    fn exists(&self, key: &str) -> bool {
        self.artifact_path(key).is_file()
    }

    fn open(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.artifact_path(key);
        fs::read(&path).map_err(|e| BalerError::io(path, e))
    }

    fn len(&self, key: &str) -> Result<u64> {
        let path = self.artifact_path(key);
        let meta = fs::metadata(&path).map_err(|e| BalerError::io(path, e))?;
        Ok(meta.len())
    }

    fn start_write(&self, key: &str) -> Result<Option<Box<dyn WriteHandle>>> {
        let dest = self.artifact_path(key);
        let tmp = self.tmp_path(key);

        if tmp.exists() {
            if !self.tmp_is_stale(&tmp, &dest) {
                // A live producer owns this key
                return Ok(None);
            }
            crate::debug!("store"; "reclaiming stale temp file {}", tmp.display());
            if let Err(e) = fs::remove_file(&tmp)
                && e.kind() != io::ErrorKind::NotFound
            {
                return Err(BalerError::io(tmp, e));
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| BalerError::io(parent.to_path_buf(), e))?;
        }

        // create_new arbitrates races: whoever creates the temp file is the
        // producer, everyone else backs off
        let file = match File::options().write(true).create_new(true).open(&tmp) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(BalerError::io(tmp, e)),
        };

        Ok(Some(Box::new(DiskWriteHandle {
            writer: Some(BufWriter::new(file)),
            tmp,
            dest,
            committed: false,
        })))
    }

    fn clear(&self, extension: &str) -> usize {
        if !self.out_dir.is_dir() {
            return 0;
        }

        let removed = WalkDir::new(&self.out_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(extension))
                    && header::file_has_signature(path)
            })
            .filter(|path| fs::remove_file(path).is_ok())
            .count();

        crate::log!("store"; "deleted {removed} cached artifacts from {}", self.out_dir.display());
        removed
    }
}

struct DiskWriteHandle {
    writer: Option<BufWriter<File>>,
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl Write for DiskWriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.writer {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::other("write after commit")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl WriteHandle for DiskWriteHandle {
    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| BalerError::io(self.tmp.clone(), e.into_error()))?;
            file.sync_all()
                .map_err(|e| BalerError::io(self.tmp.clone(), e))?;
        }

        crate::debug!(
            "store";
            "moving temp file {} to final path {}", self.tmp.display(), self.dest.display()
        );
        fs::rename(&self.tmp, &self.dest).map_err(|e| BalerError::CommitFailed {
            tmp: self.tmp.clone(),
            dest: self.dest.clone(),
            source: e,
        })?;

        self.committed = true;
        Ok(())
    }
}

impl Drop for DiskWriteHandle {
    fn drop(&mut self) {
        // An uncommitted handle releases the lock without publishing
        if !self.committed {
            self.writer.take();
            let _ = fs::remove_file(&self.tmp);
        }
    }
}
