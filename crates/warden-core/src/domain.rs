use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock instant used for every persisted timestamp.
pub type Timestamp = DateTime<Utc>;

/// Caller identity as delivered by the transport (Telegram user/chat id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Active,
    Expired,
    Revoked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default)]
    pub display_name: String,
    pub status: UserStatus,
    pub created_at: Timestamp,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

impl UserRecord {
    /// Known, active and not past its expiry.
    pub fn is_trusted_at(&self, now: Timestamp) -> bool {
        self.status == UserStatus::Active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Who may redeem an OTP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpOwner {
    User(UserId),
    /// Wildcard: any identity may present the code.
    Any,
}

impl OtpOwner {
    pub fn admits(&self, identity: UserId) -> bool {
        match self {
            OtpOwner::Any => true,
            OtpOwner::User(owner) => *owner == identity,
        }
    }
}

impl From<UserId> for OtpOwner {
    fn from(id: UserId) -> Self {
        OtpOwner::User(id)
    }
}

/// Triage level of a recorded fault. Never used for control flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Error taxonomy key. Unknown strings round-trip through `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    Network,
    DbLoad,
    DbSave,
    OtpExpired,
    AccessDenied,
    Encryption,
    Decryption,
    Unknown,
    AutoFixExhausted,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Network => "NETWORK_ERROR",
            ErrorCode::DbLoad => "DB_LOAD_ERROR",
            ErrorCode::DbSave => "DB_SAVE_ERROR",
            ErrorCode::OtpExpired => "OTP_EXPIRED",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::Encryption => "ENCRYPTION_ERROR",
            ErrorCode::Decryption => "DECRYPTION_ERROR",
            ErrorCode::Unknown => "UNKNOWN_ERROR",
            ErrorCode::AutoFixExhausted => "AUTO_FIX_EXHAUSTED",
            ErrorCode::Other(s) => s,
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        match s {
            "NETWORK_ERROR" => ErrorCode::Network,
            "DB_LOAD_ERROR" => ErrorCode::DbLoad,
            "DB_SAVE_ERROR" => ErrorCode::DbSave,
            "OTP_EXPIRED" => ErrorCode::OtpExpired,
            "ACCESS_DENIED" => ErrorCode::AccessDenied,
            "ENCRYPTION_ERROR" => ErrorCode::Encryption,
            "DECRYPTION_ERROR" => ErrorCode::Decryption,
            "UNKNOWN_ERROR" => ErrorCode::Unknown,
            "AUTO_FIX_EXHAUSTED" => ErrorCode::AutoFixExhausted,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(s: String) -> Self {
        ErrorCode::from(s.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn error_code_round_trips_known_and_custom_keys() {
        assert_eq!(ErrorCode::from("DB_SAVE_ERROR"), ErrorCode::DbSave);
        assert_eq!(
            ErrorCode::from("POLLING_ERROR"),
            ErrorCode::Other("POLLING_ERROR".to_string())
        );

        let json = serde_json::to_string(&ErrorCode::AccessDenied).unwrap();
        assert_eq!(json, "\"ACCESS_DENIED\"");
        let back: ErrorCode = serde_json::from_str("\"POLLING_ERROR\"").unwrap();
        assert_eq!(back.as_str(), "POLLING_ERROR");
    }

    #[test]
    fn otp_owner_wildcard_admits_everyone() {
        assert!(OtpOwner::Any.admits(UserId(7)));
        assert!(OtpOwner::User(UserId(7)).admits(UserId(7)));
        assert!(!OtpOwner::User(UserId(7)).admits(UserId(8)));
        assert_eq!(serde_json::to_string(&OtpOwner::Any).unwrap(), "\"any\"");
        assert_eq!(
            serde_json::to_string(&OtpOwner::User(UserId(42))).unwrap(),
            "{\"user\":42}"
        );
    }

    #[test]
    fn user_trust_depends_on_status_and_expiry() {
        let now = Utc::now();
        let mut u = UserRecord {
            id: UserId(1),
            display_name: "a".to_string(),
            status: UserStatus::Active,
            created_at: now,
            expires_at: None,
        };
        assert!(u.is_trusted_at(now));

        u.expires_at = Some(now - Duration::seconds(1));
        assert!(!u.is_trusted_at(now));

        u.expires_at = Some(now + Duration::days(1));
        u.status = UserStatus::Revoked;
        assert!(!u.is_trusted_at(now));
    }
}
