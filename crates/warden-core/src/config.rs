use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    crypto::EncryptionKey,
    domain::UserId,
    settings::{Settings, DEFAULT_ACCESS_TTL_DAYS, DEFAULT_MAX_OTP_ATTEMPTS, DEFAULT_OTP_TTL_MINUTES},
    Result,
};

pub const DEFAULT_ERROR_LOG_CAP: usize = 1000;
pub const DEFAULT_ERROR_RETENTION_DAYS: u32 = 7;

/// Typed configuration, read from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Transport
    pub telegram_bot_token: String,
    pub owner_id: Option<UserId>,

    // Store
    pub store_path: PathBuf,
    pub encryption_key: EncryptionKey,

    /// Seeds the settings of a freshly initialized document only.
    pub default_settings: Settings,

    // Error history bounds
    pub error_log_cap: usize,
    pub error_retention_days: u32,

    // Background sweeps
    pub maintenance_interval: Duration,
    pub expiry_sweep_interval: Duration,

    // Backup utility
    pub backup_dir: PathBuf,
    pub backup_retention: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let owner_id = env_i64("WARDEN_OWNER_ID").map(UserId);

        let store_path = env_path("WARDEN_STORE_PATH").unwrap_or_else(|| "users_db.json".into());

        let encryption_key = match (
            env_str("WARDEN_ENCRYPTION_KEY").and_then(non_empty),
            env_str("WARDEN_ENCRYPTION_SECRET").and_then(non_empty),
        ) {
            (Some(hex_key), _) => EncryptionKey::from_hex(&hex_key)?,
            (None, Some(secret)) => EncryptionKey::derive(&secret),
            (None, None) => {
                tracing::warn!(
                    "no WARDEN_ENCRYPTION_KEY or WARDEN_ENCRYPTION_SECRET set; \
                     using a per-process key (ciphertexts will not survive a restart)"
                );
                EncryptionKey::generate()
            }
        };

        let default_settings = Settings {
            auto_fix: env_bool("WARDEN_AUTO_FIX").unwrap_or(true),
            otp_ttl_minutes: env_u32("WARDEN_OTP_TTL_MINUTES")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_OTP_TTL_MINUTES),
            max_otp_attempts: env_u32("WARDEN_MAX_OTP_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_OTP_ATTEMPTS),
            access_ttl_days: env_u32("WARDEN_ACCESS_TTL_DAYS")
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_ACCESS_TTL_DAYS),
            hostile_mode: env_bool("WARDEN_HOSTILE_MODE").unwrap_or(false),
            encryption_mode: env_bool("WARDEN_ENCRYPTION_MODE").unwrap_or(false),
        };

        let error_log_cap = env_usize("WARDEN_ERROR_LOG_CAP")
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_ERROR_LOG_CAP);
        let error_retention_days =
            env_u32("WARDEN_ERROR_RETENTION_DAYS").unwrap_or(DEFAULT_ERROR_RETENTION_DAYS);

        let maintenance_interval =
            Duration::from_secs(env_u64("WARDEN_MAINTENANCE_INTERVAL_SECS").unwrap_or(300).max(1));
        let expiry_sweep_interval = Duration::from_secs(
            env_u64("WARDEN_EXPIRY_SWEEP_INTERVAL_SECS")
                .unwrap_or(3600)
                .max(1),
        );

        let backup_dir = env_path("WARDEN_BACKUP_DIR").unwrap_or_else(|| "backups".into());
        let backup_retention = env_usize("WARDEN_BACKUP_RETENTION")
            .filter(|v| *v > 0)
            .unwrap_or(30);

        Ok(Self {
            telegram_bot_token,
            owner_id,
            store_path,
            encryption_key,
            default_settings,
            error_log_cap,
            error_retention_days,
            maintenance_interval,
            expiry_sweep_interval,
            backup_dir,
            backup_retention,
        })
    }

    /// Defaults without touching the environment; used by tests and embedders.
    pub fn defaults(store_path: impl Into<PathBuf>) -> Self {
        Self {
            telegram_bot_token: String::new(),
            owner_id: None,
            store_path: store_path.into(),
            encryption_key: EncryptionKey::generate(),
            default_settings: Settings::default(),
            error_log_cap: DEFAULT_ERROR_LOG_CAP,
            error_retention_days: DEFAULT_ERROR_RETENTION_DAYS,
            maintenance_interval: Duration::from_secs(300),
            expiry_sweep_interval: Duration::from_secs(3600),
            backup_dir: "backups".into(),
            backup_retention: 30,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
