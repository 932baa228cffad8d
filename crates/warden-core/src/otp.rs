//! One-time code lifecycle.
//!
//! Records live in an append-only arena (`records`, mirrored to the durable
//! `otp_records` collection). The live index maps a code to its arena slot and
//! is the only thing sweeps prune.
//!
//! Per record: `Active -> Consumed | Exhausted | Expired`. Every attempt that
//! gets past the expiry check costs one unit of the attempt budget, including
//! attempts made by the wrong identity.

use std::collections::HashMap;

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{OtpOwner, Timestamp, UserId},
    settings::{Settings, DEFAULT_MAX_OTP_ATTEMPTS},
};

pub const CODE_MIN: u32 = 100_000;
pub const CODE_MAX: u32 = 999_999;

pub const PURPOSE_ACCESS: &str = "ACCESS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRecord {
    pub id: u64,
    pub code: String,
    pub owner: OtpOwner,
    pub purpose: String,
    pub generated_at: Timestamp,
    pub expires_at: Timestamp,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_OTP_ATTEMPTS
}

impl OtpRecord {
    fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    fn is_live_at(&self, now: Timestamp) -> bool {
        !self.consumed && !self.is_expired_at(now)
    }

    /// Spend one attempt; the record is consumed once the budget is used up.
    fn register_attempt(&mut self) {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
        }
        if self.attempts >= self.max_attempts {
            self.consumed = true;
        }
    }

    fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// TTL and attempt budget applied to newly issued codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub max_attempts: u32,
}

impl OtpPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ttl: Duration::minutes(i64::from(settings.otp_ttl_minutes)),
            max_attempts: settings.max_otp_attempts.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyReason {
    Valid,
    NotFound,
    AlreadyConsumed,
    Expired,
    IdentityMismatch,
    AttemptsExhausted,
}

impl VerifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyReason::Valid => "valid",
            VerifyReason::NotFound => "not found",
            VerifyReason::AlreadyConsumed => "already used",
            VerifyReason::Expired => "expired",
            VerifyReason::IdentityMismatch => "issued to a different user",
            VerifyReason::AttemptsExhausted => "too many attempts",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub reason: VerifyReason,
    pub purpose: Option<String>,
    pub attempts_remaining: u32,
}

impl VerifyOutcome {
    fn fail(reason: VerifyReason, record: Option<&OtpRecord>) -> Self {
        Self {
            valid: false,
            reason,
            purpose: record.map(|r| r.purpose.clone()),
            attempts_remaining: record.map(OtpRecord::remaining).unwrap_or(0),
        }
    }
}

#[derive(Debug)]
pub struct OtpManager {
    records: Vec<OtpRecord>,
    live: HashMap<String, usize>,
    next_id: u64,
}

impl Default for OtpManager {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            live: HashMap::new(),
            next_id: 1,
        }
    }
}

impl OtpManager {
    /// Rebuild the manager from durable records, indexing codes still live at `now`.
    pub fn from_records(records: Vec<OtpRecord>, now: Timestamp) -> Self {
        let next_id = records.iter().map(|r| r.id).max().map_or(1, |m| m + 1);
        let mut mgr = Self {
            records,
            live: HashMap::new(),
            next_id,
        };
        mgr.rebuild_index(now);
        mgr
    }

    pub fn records(&self) -> &[OtpRecord] {
        &self.records
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn lookup(&self, code: &str) -> Option<&OtpRecord> {
        self.live.get(code).map(|&idx| &self.records[idx])
    }

    /// Drop and recompute the live index from the durable records.
    pub fn rebuild_index(&mut self, now: Timestamp) {
        self.live.clear();
        for (idx, rec) in self.records.iter().enumerate() {
            if rec.is_live_at(now) {
                self.live.insert(rec.code.clone(), idx);
            }
        }
    }

    pub fn generate(
        &mut self,
        owner: OtpOwner,
        purpose: &str,
        policy: OtpPolicy,
        now: Timestamp,
    ) -> IssuedOtp {
        self.generate_with(&mut rand::thread_rng(), owner, purpose, policy, now)
    }

    pub fn generate_with<R: Rng>(
        &mut self,
        rng: &mut R,
        owner: OtpOwner,
        purpose: &str,
        policy: OtpPolicy,
        now: Timestamp,
    ) -> IssuedOtp {
        let code = loop {
            let candidate = rng.gen_range(CODE_MIN..=CODE_MAX).to_string();
            match self.live.get(&candidate) {
                None => break candidate,
                // A stale index entry does not block reuse.
                Some(&idx) if !self.records[idx].is_live_at(now) => {
                    self.live.remove(&candidate);
                    break candidate;
                }
                Some(_) => continue,
            }
        };

        let expires_at = now + policy.ttl;
        let id = self.next_id;
        self.next_id += 1;

        self.records.push(OtpRecord {
            id,
            code: code.clone(),
            owner,
            purpose: purpose.to_string(),
            generated_at: now,
            expires_at,
            consumed: false,
            attempts: 0,
            max_attempts: policy.max_attempts.max(1),
        });
        self.live.insert(code.clone(), self.records.len() - 1);

        IssuedOtp { code, expires_at }
    }

    /// Check `code` for `identity`. Never fails; every rejection carries a reason.
    pub fn verify(&mut self, code: &str, identity: UserId, now: Timestamp) -> VerifyOutcome {
        let Some(&idx) = self.live.get(code) else {
            return VerifyOutcome::fail(VerifyReason::NotFound, None);
        };
        let rec = &mut self.records[idx];

        if rec.consumed {
            let reason = if rec.attempts >= rec.max_attempts {
                VerifyReason::AttemptsExhausted
            } else {
                VerifyReason::AlreadyConsumed
            };
            return VerifyOutcome::fail(reason, Some(&*rec));
        }

        if rec.is_expired_at(now) {
            return VerifyOutcome::fail(VerifyReason::Expired, Some(&*rec));
        }

        if !rec.owner.admits(identity) {
            rec.register_attempt();
            return VerifyOutcome::fail(VerifyReason::IdentityMismatch, Some(&*rec));
        }

        if rec.attempts >= rec.max_attempts {
            rec.consumed = true;
            return VerifyOutcome::fail(VerifyReason::AttemptsExhausted, Some(&*rec));
        }

        rec.register_attempt();
        VerifyOutcome {
            valid: true,
            reason: VerifyReason::Valid,
            purpose: Some(rec.purpose.clone()),
            attempts_remaining: rec.remaining(),
        }
    }

    /// Mark a live code used up. Returns false if the code is not live.
    pub fn consume(&mut self, code: &str) -> bool {
        let Some(&idx) = self.live.get(code) else {
            return false;
        };
        let rec = &mut self.records[idx];
        let was_open = !rec.consumed;
        rec.consumed = true;
        was_open
    }

    /// Consume every outstanding code issued to `identity`.
    pub fn invalidate_for(&mut self, identity: UserId) -> usize {
        let mut n = 0usize;
        for &idx in self.live.values() {
            let rec = &mut self.records[idx];
            if !rec.consumed && rec.owner == OtpOwner::User(identity) {
                rec.consumed = true;
                n += 1;
            }
        }
        n
    }

    /// Remove expired or consumed codes from the live index. Durable records are kept.
    pub fn sweep_expired(&mut self, now: Timestamp) -> usize {
        let records = &self.records;
        let before = self.live.len();
        self.live.retain(|_, idx| records[*idx].is_live_at(now));
        before - self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::{rngs::StdRng, SeedableRng};

    fn policy() -> OtpPolicy {
        OtpPolicy {
            ttl: Duration::minutes(10),
            max_attempts: 3,
        }
    }

    #[test]
    fn issued_codes_are_six_digits_with_ttl() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        for _ in 0..200 {
            let issued = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);
            assert_eq!(issued.code.len(), 6);
            let n: u32 = issued.code.parse().unwrap();
            assert!((CODE_MIN..=CODE_MAX).contains(&n));
            assert_eq!(issued.expires_at, now + Duration::minutes(10));
        }
        assert_eq!(mgr.live_count(), 200);
        assert_eq!(mgr.records().len(), 200);
    }

    #[test]
    fn colliding_code_is_regenerated() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();

        let first = mgr.generate_with(
            &mut StdRng::seed_from_u64(7),
            UserId(1).into(),
            PURPOSE_ACCESS,
            policy(),
            now,
        );
        // Same seed: the first draw collides with the live code and must be redrawn.
        let second = mgr.generate_with(
            &mut StdRng::seed_from_u64(7),
            UserId(1).into(),
            PURPOSE_ACCESS,
            policy(),
            now,
        );
        assert_ne!(first.code, second.code);
        assert_eq!(mgr.live_count(), 2);
    }

    #[test]
    fn unknown_code_is_not_found() {
        let mut mgr = OtpManager::default();
        let out = mgr.verify("123456", UserId(1), Utc::now());
        assert!(!out.valid);
        assert_eq!(out.reason, VerifyReason::NotFound);
    }

    #[test]
    fn identity_42_scenario_ends_in_exhaustion() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let issued = mgr.generate(UserId(42).into(), PURPOSE_ACCESS, policy(), now);

        let first = mgr.verify(&issued.code, UserId(42), now);
        assert!(first.valid);
        assert_eq!(first.attempts_remaining, 2);

        let second = mgr.verify(&issued.code, UserId(7), now);
        assert_eq!(second.reason, VerifyReason::IdentityMismatch);
        let third = mgr.verify(&issued.code, UserId(7), now);
        assert_eq!(third.reason, VerifyReason::IdentityMismatch);

        // Budget spent: even the rightful owner is refused now.
        let fourth = mgr.verify(&issued.code, UserId(42), now);
        assert!(!fourth.valid);
        assert_eq!(fourth.reason, VerifyReason::AttemptsExhausted);

        let rec = mgr.lookup(&issued.code).unwrap();
        assert_eq!(rec.attempts, 3);
        assert!(rec.consumed);
    }

    #[test]
    fn expiry_wins_over_remaining_attempts_and_identity() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let issued = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);

        let later = issued.expires_at + Duration::seconds(1);
        assert_eq!(
            mgr.verify(&issued.code, UserId(1), later).reason,
            VerifyReason::Expired
        );
        assert_eq!(
            mgr.verify(&issued.code, UserId(2), later).reason,
            VerifyReason::Expired
        );
        // Expired checks do not spend attempts.
        assert_eq!(mgr.lookup(&issued.code).unwrap().attempts, 0);
    }

    #[test]
    fn attempts_never_exceed_budget() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let issued = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);

        for i in 0..20 {
            let who = if i % 2 == 0 { UserId(1) } else { UserId(2) };
            let _ = mgr.verify(&issued.code, who, now);
            let rec = mgr.lookup(&issued.code).unwrap();
            assert!(rec.attempts <= rec.max_attempts);
            if rec.attempts == rec.max_attempts {
                assert!(rec.consumed);
            }
        }
    }

    #[test]
    fn wildcard_codes_accept_any_identity() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let issued = mgr.generate(OtpOwner::Any, "BUYER", policy(), now);
        let out = mgr.verify(&issued.code, UserId(999), now);
        assert!(out.valid);
        assert_eq!(out.purpose.as_deref(), Some("BUYER"));
    }

    #[test]
    fn invalidated_codes_report_already_consumed() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let issued = mgr.generate(UserId(5).into(), PURPOSE_ACCESS, policy(), now);
        let other = mgr.generate(UserId(6).into(), PURPOSE_ACCESS, policy(), now);

        assert_eq!(mgr.invalidate_for(UserId(5)), 1);
        assert_eq!(
            mgr.verify(&issued.code, UserId(5), now).reason,
            VerifyReason::AlreadyConsumed
        );
        assert!(mgr.verify(&other.code, UserId(6), now).valid);
    }

    #[test]
    fn sweep_prunes_index_only_and_is_idempotent() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let short = OtpPolicy {
            ttl: Duration::minutes(1),
            max_attempts: 3,
        };
        let a = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, short, now);
        let _b = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);
        let c = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);
        assert!(mgr.consume(&c.code));

        let later = now + Duration::minutes(5);
        assert_eq!(mgr.sweep_expired(later), 2);
        let live_after_first: Vec<_> = {
            let mut v: Vec<_> = mgr.live.keys().cloned().collect();
            v.sort();
            v
        };
        assert_eq!(mgr.sweep_expired(later), 0);
        let mut live_after_second: Vec<_> = mgr.live.keys().cloned().collect();
        live_after_second.sort();
        assert_eq!(live_after_first, live_after_second);

        assert_eq!(mgr.records().len(), 3);
        assert_eq!(
            mgr.verify(&a.code, UserId(1), later).reason,
            VerifyReason::NotFound
        );
    }

    #[test]
    fn rebuild_from_records_restores_live_codes() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        let kept = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);
        let used = mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);
        mgr.consume(&used.code);

        let restored = OtpManager::from_records(mgr.records().to_vec(), now);
        assert_eq!(restored.live_count(), 1);
        assert!(restored.lookup(&kept.code).is_some());
        assert_eq!(restored.next_id, 3);
    }

    #[test]
    fn fresh_manager_numbers_records_from_one() {
        let now = Utc::now();
        let mut mgr = OtpManager::default();
        mgr.generate(UserId(1).into(), PURPOSE_ACCESS, policy(), now);
        assert_eq!(mgr.records()[0].id, 1);
    }
}
