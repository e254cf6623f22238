//! Authoritative on-disk device registry.
//!
//! Loads `phones.json` once at startup and holds every record in memory.
//! Dynamic fields (health, discovered models, breaker state) are written
//! back through a narrow allow-set; the registry never grows or shrinks
//! after load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

/// Fields the engine is permitted to mutate on a device record.
const DYNAMIC_KEYS: &[&str] = &[
    "healthy",
    "reason",
    "inflight",
    "models",
    "last_ok_at",
    "last_error_at",
    "open_until",
];

fn key_for(entry: &Value) -> Option<String> {
    if let Some(serial) = entry.get("serial").and_then(Value::as_str) {
        if !serial.is_empty() {
            return Some(serial.to_string());
        }
    }
    let host = entry.get("host").and_then(Value::as_str)?;
    let port = entry.get("port").and_then(Value::as_i64).unwrap_or(11434);
    Some(format!("{host}:{port}"))
}

struct Inner {
    data: Vec<Value>,
    index: HashMap<String, usize>,
    dirty: bool,
}

/// JSON-array-backed device registry with atomic, crash-safe flush.
pub struct DeviceRegistry {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    /// Loads the registry from `path`. A missing file, unreadable JSON, or a
    /// top-level value that isn't an array is a fatal configuration error.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let data: Value = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        let data = match data {
            Value::Array(items) => items,
            _ => anyhow::bail!("{} must contain a JSON array", path.display()),
        };
        if data.is_empty() {
            anyhow::bail!("{} contains zero devices", path.display());
        }
        let index = Self::build_index(&data);
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                data,
                index,
                dirty: false,
            }),
        })
    }

    fn build_index(data: &[Value]) -> HashMap<String, usize> {
        let mut index = HashMap::new();
        for (i, entry) in data.iter().enumerate() {
            if let Some(k) = key_for(entry) {
                index.entry(k).or_insert(i);
            }
        }
        index
    }

    /// Read-only view of every record, in file order.
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn get_by_key(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(key).map(|&i| inner.data[i].clone())
    }

    /// Merges only allow-listed fields into the record at `key`. A no-op if
    /// `key` is unknown: the registry never adds records.
    pub fn update_dynamic(&self, key: &str, fields: &[(&str, Value)]) {
        let mut inner = self.inner.lock().unwrap();
        let Some(&idx) = inner.index.get(key) else {
            return;
        };
        let mut changed = false;
        for (field, value) in fields {
            if !DYNAMIC_KEYS.contains(field) {
                continue;
            }
            let entry = inner.data[idx].as_object_mut().expect("device record is an object");
            if entry.get(*field) != Some(value) {
                entry.insert(field.to_string(), value.clone());
                changed = true;
            }
        }
        if changed {
            inner.dirty = true;
        }
    }

    pub fn mark_ok(&self, key: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        self.update_dynamic(
            key,
            &[
                ("last_ok_at", Value::String(now)),
                ("last_error_at", Value::Null),
            ],
        );
    }

    pub fn mark_error(&self, key: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        self.update_dynamic(key, &[("last_error_at", Value::String(now))]);
    }

    /// Atomically rewrites the file if anything changed since the last flush.
    /// Write failures are returned to the caller but leave `dirty` set so a
    /// later flush can retry.
    pub fn flush_if_dirty(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.dirty {
            return Ok(());
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile_path(dir);
        let body = serde_json::to_string_pretty(&inner.data)? + "\n";
        let write_result = std::fs::write(&tmp, body).and_then(|_| std::fs::rename(&tmp, &self.path));
        match write_result {
            Ok(()) => {
                inner.dirty = false;
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                tmp.clear();
                Err(anyhow::anyhow!("flushing {}: {e}", self.path.display()))
            }
        }
    }
}

fn tempfile_path(dir: &Path) -> PathBuf {
    let nonce = uuid::Uuid::new_v4();
    dir.join(format!("phones.{nonce}.json.tmp"))
}
