//! `warden-backup`: encrypted, checksummed snapshots of the warden store.
//!
//! Usage:
//!   warden-backup [create]       create a backup, then verify it
//!   warden-backup verify <file>  check a backup against the manifest
//!   warden-backup inspect <file> decrypt a backup and summarize it
//!   warden-backup list           show retained backups
//!
//! Reads the same environment (`.env`) as the bot. The store is only ever read.

mod archive;

use std::path::Path;

use anyhow::bail;
use chrono::Utc;

use warden_core::{config::Config, stats::StoreStats};

use archive::Archiver;

fn main() -> anyhow::Result<()> {
    warden_core::logging::init("warden-backup")?;
    let cfg = Config::load()?;
    let archiver = Archiver::new(&cfg.backup_dir, cfg.encryption_key.clone(), cfg.backup_retention);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["create"] => {
            let entry = archiver.create(&cfg.store_path, Utc::now())?;
            let file = archiver.dir().join(&entry.filename);
            println!("Backup created: {}", file.display());
            println!("Size: {:.2} KB", entry.size as f64 / 1024.0);
            println!("Checksum: {}...", short(&entry.checksum, 16));
            println!("Total backups: {}", archiver.list()?.len());
            if !archiver.verify(&file)? {
                bail!("backup verification failed for {}", file.display());
            }
            println!("Integrity verified.");
        }
        ["verify", file] => {
            if archiver.verify(Path::new(file))? {
                println!("Backup integrity verified.");
            } else {
                bail!("backup verification failed for {file}");
            }
        }
        ["inspect", file] => {
            let payload = archiver.open(Path::new(file))?;
            println!(
                "{} {} backup taken {}",
                payload.metadata.system,
                payload.metadata.version,
                payload.metadata.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            match payload.database {
                Some(doc) => {
                    let stats = StoreStats::collect(&doc, Utc::now());
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                None => println!("(no store existed at backup time)"),
            }
        }
        ["list"] => {
            let entries = archiver.list()?;
            if entries.is_empty() {
                println!("No backups in {}", archiver.dir().display());
            }
            for e in entries {
                println!(
                    "{}  {:>8} B  {}  {}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.size,
                    short(&e.checksum, 12),
                    e.filename
                );
            }
        }
        other => bail!(
            "unknown arguments {other:?}; usage: warden-backup [create | verify <file> | inspect <file> | list]"
        ),
    }
    Ok(())
}

fn short(s: &str, n: usize) -> &str {
    s.get(..n).unwrap_or(s)
}
