use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const TASKS_KEY: &str = "studyhub_notes";
pub const MISSED_KEY: &str = "studyhub_missed";

/// Flat key-value persistence. Each key holds one JSON document.
pub trait Storage {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        info!(data_dir = %data_dir.display(), "opened storage");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            debug!(file = %path.display(), "storage key absent");
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        Ok(Some(text))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        debug!(file = %path.display(), bytes = value.len(), "writing storage key atomically");

        let mut temp = NamedTempFile::new_in(&self.data_dir)
            .with_context(|| format!("unable to stage write in {}", self.data_dir.display()))?;
        temp.write_all(value.as_bytes())?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
        Ok(())
    }
}

/// Parses a stored JSON array, reporting the position of malformed input.
pub fn decode_list<T>(key: &str, text: &str) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<T>>(text).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow!("invalid JSON in '{key}' at line {line}, column {column}: {err}")
    })
}

pub fn encode_list<T>(items: &[T]) -> Result<String>
where
    T: serde::Serialize,
{
    let text = serde_json::to_string_pretty(items)?;
    Ok(format!("{text}\n"))
}

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::{Result, anyhow};

    use super::Storage;

    /// In-process storage shared between clones. Counts writes so callers can
    /// verify when nothing was persisted.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStorage {
        values: Arc<Mutex<HashMap<String, String>>>,
        writes: Arc<AtomicUsize>,
        fail_writes: bool,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }

        /// A storage whose writes always fail, for exercising the best-effort path.
        pub fn failing() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }

        pub fn with_value(key: &str, value: &str) -> Self {
            let storage = Self::default();
            if let Ok(mut guard) = storage.values.lock() {
                guard.insert(key.to_string(), value.to_string());
            }
            storage
        }

        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::Relaxed)
        }

        pub fn value(&self, key: &str) -> Option<String> {
            self.values
                .lock()
                .ok()
                .and_then(|guard| guard.get(key).cloned())
        }
    }

    impl Storage for MemoryStorage {
        fn read(&self, key: &str) -> Result<Option<String>> {
            let guard = self
                .values
                .lock()
                .map_err(|_| anyhow!("memory storage lock poisoned"))?;
            Ok(guard.get(key).cloned())
        }

        fn write(&self, key: &str, value: &str) -> Result<()> {
            if self.fail_writes {
                return Err(anyhow!("write to '{key}' rejected"));
            }
            let mut guard = self
                .values
                .lock()
                .map_err(|_| anyhow!("memory storage lock poisoned"))?;
            guard.insert(key.to_string(), value.to_string());
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}
