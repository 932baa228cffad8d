//! Durable JSON document store.
//!
//! One document holds every collection. Writes go to a sibling temp file which
//! is fsynced and renamed over the target, so a concurrent reader (the backup
//! tool) only ever observes a complete document.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::UserRecord,
    error_controller::{ErrorRecord, FixRecord},
    errors::Error,
    otp::OtpRecord,
    settings::Settings,
    Result,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub otp_records: Vec<OtpRecord>,
    #[serde(default)]
    pub error_logs: Vec<ErrorRecord>,
    #[serde(default)]
    pub fix_history: Vec<FixRecord>,
    #[serde(default)]
    pub settings: Settings,
}

impl Document {
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// Lenient decode: missing collections default to empty and entries that no
    /// longer match the schema are dropped. Returns the number of dropped entries.
    ///
    /// Settings fields that are missing or unreadable take their value from
    /// `defaults`. Fails only if `value` is not a JSON object.
    pub fn from_value(value: Value, defaults: &Settings) -> Result<(Self, usize)> {
        let Value::Object(mut map) = value else {
            return Err(Error::InvalidInput(
                "document root is not an object".to_string(),
            ));
        };

        let mut dropped = 0usize;
        let users = take_collection(&mut map, "users", &mut dropped);
        let otp_records = take_collection(&mut map, "otp_records", &mut dropped);
        let error_logs = take_collection(&mut map, "error_logs", &mut dropped);
        let fix_history = take_collection(&mut map, "fix_history", &mut dropped);
        let settings = match map.remove("settings") {
            Some(v) => overlay_settings(defaults, v).unwrap_or_else(|e| {
                tracing::warn!("settings unreadable ({e}); using defaults");
                dropped += 1;
                defaults.clone()
            }),
            None => defaults.clone(),
        };

        Ok((
            Self {
                users,
                otp_records,
                error_logs,
                fix_history,
                settings,
            },
            dropped,
        ))
    }
}

/// Legacy settings keys and their current names.
const RENAMED_SETTINGS: &[(&str, &str)] = &[
    ("ugly_mode", "hostile_mode"),
    ("otp_expiry_minutes", "otp_ttl_minutes"),
    ("access_expiry_days", "access_ttl_days"),
];

/// Persisted fields win over `defaults`; absent ones keep the default value.
fn overlay_settings(defaults: &Settings, persisted: Value) -> serde_json::Result<Settings> {
    let Value::Object(mut fields) = persisted else {
        return serde_json::from_value(persisted);
    };
    for (legacy, current) in RENAMED_SETTINGS {
        if let Some(v) = fields.remove(*legacy) {
            fields.entry(current.to_string()).or_insert(v);
        }
    }
    let mut merged = serde_json::to_value(defaults)?;
    if let Value::Object(base) = &mut merged {
        base.extend(fields);
    }
    serde_json::from_value(merged)
}

fn take_collection<T: DeserializeOwned>(
    map: &mut serde_json::Map<String, Value>,
    key: &str,
    dropped: &mut usize,
) -> Vec<T> {
    let Some(Value::Array(items)) = map.remove(key) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<T>(item) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::debug!("dropping malformed {key} entry: {e}");
                *dropped += 1;
            }
        }
    }
    out
}

/// What `load` had to do to produce a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    /// Existing document read; `dropped` entries did not match the schema.
    Loaded { dropped: usize },
    /// No document existed; a default one was written.
    Initialized,
    /// The document was unreadable and has been replaced with a default one.
    Replaced { reason: String },
}

#[derive(Debug)]
pub struct Loaded {
    pub document: Document,
    pub status: LoadStatus,
}

#[derive(Clone, Debug)]
pub struct PersistenceStore {
    path: PathBuf,
    defaults: Settings,
}

impl PersistenceStore {
    /// `defaults` seeds the settings of a freshly initialized document.
    pub fn new(path: impl Into<PathBuf>, defaults: Settings) -> Self {
        Self {
            path: path.into(),
            defaults,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_document(&self) -> Document {
        Document::with_settings(self.defaults.clone())
    }

    /// Read the document, initializing or replacing it when absent or corrupt.
    ///
    /// Errors mean the caller must run on `default_document()` and retry
    /// persistence later: `Error::CorruptStore` if a corrupt document could
    /// not be replaced, `Error::Io` for any other read/write failure.
    pub fn load(&self) -> Result<Loaded> {
        if !self.path.exists() {
            let document = self.default_document();
            self.save(&document)?;
            tracing::info!(path = %self.path.display(), "initialized new store");
            return Ok(Loaded {
                document,
                status: LoadStatus::Initialized,
            });
        }

        let raw = fs::read_to_string(&self.path)?;
        let parsed = serde_json::from_str::<Value>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|v| Document::from_value(v, &self.defaults).map_err(|e| e.to_string()));

        match parsed {
            Ok((document, dropped)) => {
                if dropped > 0 {
                    tracing::warn!(dropped, "store had entries not matching the schema");
                }
                Ok(Loaded {
                    document,
                    status: LoadStatus::Loaded { dropped },
                })
            }
            Err(reason) => {
                tracing::error!(path = %self.path.display(), "store is corrupt: {reason}");
                self.quarantine_corrupt();

                let document = self.default_document();
                if let Err(e) = self.save(&document) {
                    return Err(Error::CorruptStore {
                        path: self.path.clone(),
                        reason: format!("{reason}; replacement failed: {e}"),
                    });
                }
                Ok(Loaded {
                    document,
                    status: LoadStatus::Replaced { reason },
                })
            }
        }
    }

    /// Atomically replace the persisted document.
    pub fn save(&self, document: &Document) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        self.ensure_parent_dir()?;

        let tmp = self.sibling(".tmp");
        let res = write_synced(&tmp, &bytes).and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Check that the store location accepts writes, without touching the document.
    pub fn probe(&self) -> Result<()> {
        self.ensure_parent_dir()?;
        let probe = self.sibling(".probe");
        write_synced(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    /// Read a document without ever writing (for tools running next to the bot).
    ///
    /// Returns `Ok(None)` if the file does not exist.
    pub fn read_only(path: &Path) -> Result<Option<Document>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)?;
        let (document, _) =
            Document::from_value(value, &Settings::default()).map_err(|e| Error::CorruptStore {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Some(document))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "store".to_string());
        self.path.with_file_name(format!(".{name}{suffix}"))
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn quarantine_corrupt(&self) {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let target = self.sibling(&format!(".corrupt-{stamp}"));
        match fs::rename(&self.path, &target) {
            Ok(()) => tracing::warn!(to = %target.display(), "moved corrupt store aside"),
            Err(e) => tracing::warn!("could not move corrupt store aside: {e}"),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
