//! Encrypted store snapshots with a checksummed manifest.
//!
//! A backup file holds `{ iv, data, timestamp }` where `data` is the
//! AES-256-CBC ciphertext of `{ metadata, database }`. `manifest.json` lists
//! the retained backups, oldest first.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use warden_core::{
    crypto::{self, EncryptionKey},
    domain::Timestamp,
    store::{Document, PersistenceStore},
};

pub const MANIFEST: &str = "manifest.json";
const EXTENSION: &str = "ubk";
const SYSTEM: &str = "warden";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    pub timestamp: Timestamp,
    pub system: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub metadata: Metadata,
    /// `None` when the store did not exist at backup time.
    pub database: Option<Document>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    iv: String,
    data: String,
    timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub size: u64,
    pub timestamp: Timestamp,
    /// SHA-256 hex of the backup file bytes.
    pub checksum: String,
}

pub struct Archiver {
    dir: PathBuf,
    key: EncryptionKey,
    retention: usize,
}

impl Archiver {
    pub fn new(dir: impl Into<PathBuf>, key: EncryptionKey, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            key,
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `store_path` (read-only), record it in the manifest and apply retention.
    pub fn create(&self, store_path: &Path, now: Timestamp) -> anyhow::Result<ManifestEntry> {
        let database = PersistenceStore::read_only(store_path)
            .with_context(|| format!("reading store {}", store_path.display()))?;
        if database.is_none() {
            tracing::warn!(path = %store_path.display(), "store not found; backing up an empty snapshot");
        }

        let payload = Payload {
            metadata: Metadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: now,
                system: SYSTEM.to_string(),
            },
            database,
        };
        let sealed = crypto::encrypt_text(&serde_json::to_string(&payload)?, &self.key)?;
        let (iv, data) = sealed
            .split_once(':')
            .ok_or_else(|| anyhow!("unexpected cipher output"))?;
        let envelope = Envelope {
            iv: iv.to_string(),
            data: data.to_string(),
            timestamp: now,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let filename = self.free_filename(now);
        let path = self.dir.join(&filename);
        write_atomic(&path, &bytes)?;

        let entry = ManifestEntry {
            filename,
            size: bytes.len() as u64,
            timestamp: now,
            checksum: checksum(&bytes),
        };

        let mut manifest = self.list()?;
        manifest.push(entry.clone());
        while manifest.len() > self.retention {
            let old = manifest.remove(0);
            let old_path = self.dir.join(&old.filename);
            match fs::remove_file(&old_path) {
                Ok(()) => tracing::info!(file = %old.filename, "evicted old backup"),
                Err(e) => tracing::warn!(file = %old.filename, "could not delete old backup: {e}"),
            }
        }
        self.write_manifest(&manifest)?;

        tracing::info!(file = %entry.filename, size = entry.size, "backup created");
        Ok(entry)
    }

    /// Recompute the file checksum and compare it with the manifest entry.
    pub fn verify(&self, file: &Path) -> anyhow::Result<bool> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("not a file path: {}", file.display()))?;
        let path = if file.exists() {
            file.to_path_buf()
        } else {
            self.dir.join(&name)
        };

        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let actual = checksum(&bytes);

        let manifest = self.list()?;
        let Some(entry) = manifest.iter().find(|e| e.filename == name) else {
            tracing::warn!(file = %name, "backup not listed in manifest");
            return Ok(false);
        };
        Ok(entry.checksum == actual)
    }

    /// Decrypt a backup file.
    pub fn open(&self, file: &Path) -> anyhow::Result<Payload> {
        let raw = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        let envelope: Envelope = serde_json::from_str(&raw).context("not a backup envelope")?;
        let json = crypto::decrypt_text(&format!("{}:{}", envelope.iv, envelope.data), &self.key)
            .context("decrypting backup (wrong key?)")?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn list(&self) -> anyhow::Result<Vec<ManifestEntry>> {
        let path = self.dir.join(MANIFEST);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn write_manifest(&self, manifest: &[ManifestEntry]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.dir.join(MANIFEST), &bytes)
    }

    fn free_filename(&self, now: Timestamp) -> String {
        let stem = format!("backup_{}", now.format("%Y-%m-%d_%H-%M-%S"));
        let mut name = format!("{stem}.{EXTENSION}");
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{stem}_{n}.{EXTENSION}");
            n += 1;
        }
        name
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let Some(name) = path.file_name() else {
        bail!("not a file path: {}", path.display());
    };
    let tmp = path.with_file_name(format!(".{}.tmp", name.to_string_lossy()));
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use warden_core::{
        domain::{UserId, UserRecord, UserStatus},
        settings::Settings,
    };

    fn seeded_store(dir: &Path) -> PathBuf {
        let path = dir.join("users_db.json");
        let store = PersistenceStore::new(&path, Settings::default());
        let mut doc = store.default_document();
        doc.users.push(UserRecord {
            id: UserId(7),
            display_name: "seven".to_string(),
            status: UserStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
        });
        store.save(&doc).unwrap();
        path
    }

    #[test]
    fn create_verify_and_open_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let before = fs::read(&store).unwrap();

        let archiver = Archiver::new(tmp.path().join("backups"), EncryptionKey::derive("k"), 30);
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let entry = archiver.create(&store, at).unwrap();
        assert_eq!(entry.filename, "backup_2026-03-04_05-06-07.ubk");

        let file = archiver.dir().join(&entry.filename);
        assert!(archiver.verify(&file).unwrap());
        assert_eq!(fs::metadata(&file).unwrap().len(), entry.size);

        let payload = archiver.open(&file).unwrap();
        assert_eq!(payload.metadata.system, "warden");
        assert_eq!(payload.database.unwrap().users[0].id, UserId(7));

        // The store itself is never touched.
        assert_eq!(fs::read(&store).unwrap(), before);
    }

    #[test]
    fn tampered_backup_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let archiver = Archiver::new(tmp.path().join("backups"), EncryptionKey::derive("k"), 30);
        let entry = archiver.create(&store, Utc::now()).unwrap();

        let file = archiver.dir().join(&entry.filename);
        let mut bytes = fs::read(&file).unwrap();
        bytes.push(b'\n');
        fs::write(&file, bytes).unwrap();
        assert!(!archiver.verify(&file).unwrap());
    }

    #[test]
    fn wrong_key_cannot_open() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let dir = tmp.path().join("backups");
        let entry = Archiver::new(&dir, EncryptionKey::derive("right"), 30)
            .create(&store, Utc::now())
            .unwrap();

        let other = Archiver::new(&dir, EncryptionKey::derive("wrong"), 30);
        // CBC without authentication can occasionally unpad garbage, but it will not parse.
        assert!(other.open(&dir.join(entry.filename)).is_err());
    }

    #[test]
    fn retention_keeps_newest_and_deletes_evicted_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let archiver = Archiver::new(tmp.path().join("backups"), EncryptionKey::derive("k"), 2);

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let names: Vec<String> = (0..3)
            .map(|i| {
                archiver
                    .create(&store, start + Duration::seconds(i))
                    .unwrap()
                    .filename
            })
            .collect();

        let listed: Vec<String> = archiver.list().unwrap().into_iter().map(|e| e.filename).collect();
        assert_eq!(listed, names[1..].to_vec());
        assert!(!archiver.dir().join(&names[0]).exists());
    }

    #[test]
    fn same_second_backups_get_distinct_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let archiver = Archiver::new(tmp.path().join("backups"), EncryptionKey::derive("k"), 30);
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let a = archiver.create(&store, at).unwrap();
        let b = archiver.create(&store, at).unwrap();
        assert_ne!(a.filename, b.filename);
        assert_eq!(b.filename, "backup_2026-01-01_00-00-00_1.ubk");
    }

    #[test]
    fn missing_store_backs_up_empty_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(tmp.path().join("backups"), EncryptionKey::derive("k"), 30);
        let entry = archiver
            .create(&tmp.path().join("absent.json"), Utc::now())
            .unwrap();
        let payload = archiver.open(&archiver.dir().join(entry.filename)).unwrap();
        assert!(payload.database.is_none());
    }
}
