//! Read-only store statistics (for `/status` and operators).

use chrono::Duration;
use serde::Serialize;

use crate::{
    domain::{ErrorCode, Timestamp, UserStatus},
    store::Document,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_users: usize,
    pub active_users: usize,
    pub otp_records: usize,
    pub live_otps: usize,
    pub error_logs: usize,
    pub unresolved_errors: usize,
    pub security_errors: usize,
    pub errors_last_24h: usize,
    pub total_records: usize,
}

impl StoreStats {
    pub fn collect(doc: &Document, now: Timestamp) -> Self {
        let day_ago = now - Duration::hours(24);

        let active_users = doc
            .users
            .iter()
            .filter(|u| u.status == UserStatus::Active && u.is_trusted_at(now))
            .count();
        let live_otps = doc
            .otp_records
            .iter()
            .filter(|r| !r.consumed && r.expires_at >= now)
            .count();

        let mut unresolved_errors = 0;
        let mut security_errors = 0;
        let mut errors_last_24h = 0;
        for e in &doc.error_logs {
            if !e.resolved {
                unresolved_errors += 1;
            }
            if e.code == ErrorCode::AccessDenied {
                security_errors += 1;
            }
            if e.timestamp > day_ago {
                errors_last_24h += 1;
            }
        }

        Self {
            total_users: doc.users.len(),
            active_users,
            otp_records: doc.otp_records.len(),
            live_otps,
            error_logs: doc.error_logs.len(),
            unresolved_errors,
            security_errors,
            errors_last_24h,
            total_records: doc.users.len() + doc.otp_records.len() + doc.error_logs.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{OtpOwner, Severity, UserId, UserRecord},
        error_controller::ErrorRecord,
        otp::OtpRecord,
    };
    use chrono::Utc;

    fn error(id: u64, code: ErrorCode, at: Timestamp, resolved: bool) -> ErrorRecord {
        ErrorRecord {
            id,
            code,
            message: "x".to_string(),
            severity: Severity::High,
            timestamp: at,
            resolved,
            fix_applied: None,
            resolved_at: None,
            identity: None,
        }
    }

    #[test]
    fn counts_users_codes_and_errors() {
        let now = Utc::now();
        let mut doc = Document::default();
        doc.users = vec![
            UserRecord {
                id: UserId(1),
                display_name: "a".into(),
                status: UserStatus::Active,
                created_at: now,
                expires_at: Some(now + Duration::days(1)),
            },
            UserRecord {
                id: UserId(2),
                display_name: "b".into(),
                status: UserStatus::Active,
                created_at: now,
                // Past expiry but not yet swept.
                expires_at: Some(now - Duration::days(1)),
            },
            UserRecord {
                id: UserId(3),
                display_name: "c".into(),
                status: UserStatus::Revoked,
                created_at: now,
                expires_at: None,
            },
        ];
        doc.otp_records = vec![
            OtpRecord {
                id: 1,
                code: "123456".into(),
                owner: OtpOwner::Any,
                purpose: "ACCESS".into(),
                generated_at: now,
                expires_at: now + Duration::minutes(5),
                consumed: false,
                attempts: 0,
                max_attempts: 3,
            },
            OtpRecord {
                id: 2,
                code: "654321".into(),
                owner: OtpOwner::Any,
                purpose: "ACCESS".into(),
                generated_at: now,
                expires_at: now + Duration::minutes(5),
                consumed: true,
                attempts: 1,
                max_attempts: 3,
            },
        ];
        doc.error_logs = vec![
            error(1, ErrorCode::AccessDenied, now - Duration::hours(30), false),
            error(2, ErrorCode::AccessDenied, now, false),
            error(3, ErrorCode::DbSave, now, true),
        ];

        let stats = StoreStats::collect(&doc, now);
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.otp_records, 2);
        assert_eq!(stats.live_otps, 1);
        assert_eq!(stats.error_logs, 3);
        assert_eq!(stats.unresolved_errors, 2);
        assert_eq!(stats.security_errors, 2);
        assert_eq!(stats.errors_last_24h, 2);
        assert_eq!(stats.total_records, 8);
    }

    #[test]
    fn empty_document_is_all_zero() {
        assert_eq!(
            StoreStats::collect(&Document::default(), Utc::now()),
            StoreStats::default()
        );
    }
}
