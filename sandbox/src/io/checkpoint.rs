//! Shadow-file checkpoints for in-place manifest rewrites.
//!
//! Processed lines are appended to `<manifest>-tmp` as each window finishes.
//! The manifest itself is only touched by [`Checkpoint::commit`], which
//! renames the shadow over it. A crash leaves the original intact and a stray
//! shadow that the next run discards.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};

const SHADOW_SUFFIX: &str = "-tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    manifest: PathBuf,
    shadow: PathBuf,
}

impl Checkpoint {
    pub fn for_manifest(manifest: impl Into<PathBuf>) -> Self {
        let manifest = manifest.into();
        let mut shadow = OsString::from(manifest.as_os_str());
        shadow.push(SHADOW_SUFFIX);
        Self {
            manifest,
            shadow: PathBuf::from(shadow),
        }
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    pub fn shadow(&self) -> &Path {
        &self.shadow
    }

    /// Remove a shadow left by an interrupted run. Returns whether one existed.
    pub fn discard(&self) -> Result<bool> {
        match fs::remove_file(&self.shadow) {
            Ok(()) => {
                info!(shadow = %self.shadow.display(), "discarded stale checkpoint");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::io("remove checkpoint", &self.shadow, err)),
        }
    }

    /// Durably append finished lines, one per entry.
    pub fn append_lines(&self, lines: &[String]) -> Result<()> {
        let file = self.open_shadow()?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writer
                .write_all(line.as_bytes())
                .and_then(|()| writer.write_all(b"\n"))
                .map_err(|err| Error::io("write checkpoint", &self.shadow, err))?;
        }
        let file = writer
            .into_inner()
            .map_err(|err| Error::io("flush checkpoint", &self.shadow, err.into_error()))?;
        file.sync_data()
            .map_err(|err| Error::io("sync checkpoint", &self.shadow, err))?;
        debug!(lines = lines.len(), shadow = %self.shadow.display(), "checkpoint appended");
        Ok(())
    }

    /// Number of lines written to the shadow so far.
    pub fn committed_lines(&self) -> Result<usize> {
        let file = match File::open(&self.shadow) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(Error::io("open checkpoint", &self.shadow, err)),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|err| Error::io("read checkpoint", &self.shadow, err))?;
            if read == 0 {
                return Ok(count);
            }
            count += 1;
        }
    }

    /// Copy any unprocessed manifest lines after the shadow's, then replace
    /// the manifest with the shadow.
    pub fn commit(&self) -> Result<()> {
        let done = self.committed_lines()?;
        let original = File::open(&self.manifest)
            .map_err(|err| Error::io("open manifest", &self.manifest, err))?;
        let mut reader = BufReader::new(original);
        let mut writer = BufWriter::new(self.open_shadow()?);

        let mut buf = Vec::new();
        let mut index = 0;
        let mut copied = 0;
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|err| Error::io("read manifest", &self.manifest, err))?;
            if read == 0 {
                break;
            }
            if index >= done {
                writer
                    .write_all(&buf)
                    .map_err(|err| Error::io("write checkpoint", &self.shadow, err))?;
                copied += 1;
            }
            index += 1;
        }
        let file = writer
            .into_inner()
            .map_err(|err| Error::io("flush checkpoint", &self.shadow, err.into_error()))?;
        file.sync_all()
            .map_err(|err| Error::io("sync checkpoint", &self.shadow, err))?;
        drop(file);

        fs::rename(&self.shadow, &self.manifest)
            .map_err(|err| Error::io("replace manifest", &self.manifest, err))?;
        info!(manifest = %self.manifest.display(), rewritten = done, copied, "manifest committed");
        Ok(())
    }

    fn open_shadow(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shadow)
            .map_err(|err| Error::io("open checkpoint", &self.shadow, err))
    }
}
