use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

pub const DEFAULT_OTP_TTL_MINUTES: u32 = 10;
pub const DEFAULT_MAX_OTP_ATTEMPTS: u32 = 3;
pub const DEFAULT_ACCESS_TTL_DAYS: u32 = 30;

/// Process-wide policy knobs, persisted with the document.
///
/// Field aliases accept documents written by the legacy bot (`ugly_mode`,
/// `otp_expiry_minutes`, `access_expiry_days`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auto_fix: bool,
    #[serde(alias = "otp_expiry_minutes")]
    pub otp_ttl_minutes: u32,
    pub max_otp_attempts: u32,
    #[serde(alias = "access_expiry_days")]
    pub access_ttl_days: u32,
    #[serde(alias = "ugly_mode")]
    pub hostile_mode: bool,
    pub encryption_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_fix: true,
            otp_ttl_minutes: DEFAULT_OTP_TTL_MINUTES,
            max_otp_attempts: DEFAULT_MAX_OTP_ATTEMPTS,
            access_ttl_days: DEFAULT_ACCESS_TTL_DAYS,
            hostile_mode: false,
            encryption_mode: false,
        }
    }
}

/// Partial update applied through `AccessGate::update_settings`.
#[derive(Clone, Debug, Default)]
pub struct SettingsUpdate {
    pub auto_fix: Option<bool>,
    pub otp_ttl_minutes: Option<u32>,
    pub max_otp_attempts: Option<u32>,
    pub access_ttl_days: Option<u32>,
    pub hostile_mode: Option<bool>,
    pub encryption_mode: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.auto_fix.is_none()
            && self.otp_ttl_minutes.is_none()
            && self.max_otp_attempts.is_none()
            && self.access_ttl_days.is_none()
            && self.hostile_mode.is_none()
            && self.encryption_mode.is_none()
    }

    /// Validate every field first, then apply; a rejected update leaves `settings` untouched.
    pub fn apply(&self, settings: &mut Settings) -> Result<()> {
        for (name, value) in [
            ("otp_ttl_minutes", self.otp_ttl_minutes),
            ("max_otp_attempts", self.max_otp_attempts),
            ("access_ttl_days", self.access_ttl_days),
        ] {
            if value == Some(0) {
                return Err(Error::InvalidInput(format!("{name} must be > 0")));
            }
        }

        if let Some(v) = self.auto_fix {
            settings.auto_fix = v;
        }
        if let Some(v) = self.otp_ttl_minutes {
            settings.otp_ttl_minutes = v;
        }
        if let Some(v) = self.max_otp_attempts {
            settings.max_otp_attempts = v;
        }
        if let Some(v) = self.access_ttl_days {
            settings.access_ttl_days = v;
        }
        if let Some(v) = self.hostile_mode {
            settings.hostile_mode = v;
        }
        if let Some(v) = self.encryption_mode {
            settings.encryption_mode = v;
        }
        Ok(())
    }
}
