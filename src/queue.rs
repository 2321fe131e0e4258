use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::content::{ContentItem, ContentKind};
use crate::error::{PipelineError, Result};

/// The JSON-array backlog of one channel.
///
/// Raw values are kept so fields this crate does not model survive a rewrite.
pub struct WorkQueue {
    path: PathBuf,
    kind: ContentKind,
    entries: Vec<Value>,
}

impl WorkQueue {
    pub fn load(path: &Path, kind: ContentKind) -> Result<Self> {
        let entries = read_entries(path)?;
        info!("Loaded {} queued item(s) from {}", entries.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First entry that decodes as this channel's item kind.
    pub fn head(&self) -> Option<ContentItem> {
        for (i, raw) in self.entries.iter().enumerate() {
            match ContentItem::from_value(self.kind, raw) {
                Ok(item) => return Some(item),
                Err(e) => warn!("Skipping undecodable queue entry #{}: {}", i, e),
            }
        }
        None
    }

    /// Removes the first entry whose identifying key equals `key`.
    ///
    /// The file is re-read under the lock so concurrent edits made since
    /// `load` are kept, and rewritten through a rename. Returns the number
    /// of entries left.
    pub fn remove(&self, key: &str) -> Result<usize> {
        let _lock = QueueLock::acquire(&self.path)?;
        let mut entries = read_entries(&self.path)?;
        let position = entries.iter().position(|raw| {
            ContentItem::from_value(self.kind, raw)
                .map(|item| item.unique_key() == key)
                .unwrap_or(false)
        });
        let Some(idx) = position else {
            return Err(PipelineError::Queue(format!(
                "item '{}' is no longer in {}",
                key.replace('\u{1f}', " / "),
                self.path.display()
            )));
        };
        entries.remove(idx);
        write_atomic(&self.path, &entries)?;
        info!(
            "Removed published item from {} ({} remaining)",
            self.path.display(),
            entries.len()
        );
        Ok(entries.len())
    }
}

fn read_entries(path: &Path) -> Result<Vec<Value>> {
    let data = fs::read_to_string(path).map_err(|e| {
        PipelineError::Queue(format!("cannot read {}: {}", path.display(), e))
    })?;
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(&data)? {
        Value::Array(items) => Ok(items),
        _ => Err(PipelineError::Queue(format!(
            "{} must contain a JSON array",
            path.display()
        ))),
    }
}

fn write_atomic(path: &Path, entries: &[Value]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut w, entries)?;
        w.write_all(b"\n")?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
    debug!("Rewrote {}", path.display());
    Ok(())
}

/// Advisory lock: a sibling `.lock` file created exclusively.
struct QueueLock {
    path: PathBuf,
}

impl QueueLock {
    fn acquire(queue: &Path) -> Result<Self> {
        let mut name = queue.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::Queue(format!(
                "{} is locked by another run (delete {} if it is stale)",
                queue.display(),
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove queue lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
pub fn create(path: &Path, entries: &[Value]) -> Result<()> {
    write_atomic(path, entries)
}
