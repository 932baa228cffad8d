//! Self-healing error controller.
//!
//! Faults are appended to a bounded log. When auto-fix is on, the candidate
//! fixes for the fault's code are tried in order, synchronously, before
//! `add_error` returns; the first success resolves the record. Every fix
//! attempt lands in the fix audit trail.

use std::collections::VecDeque;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    config::DEFAULT_ERROR_LOG_CAP,
    domain::{ErrorCode, Severity, Timestamp, UserId},
};

pub const RECENT_WINDOW: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: u64,
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub fix_applied: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<Timestamp>,
    #[serde(default)]
    pub identity: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRecord {
    pub error_id: u64,
    pub fix_name: String,
    pub timestamp: Timestamp,
    pub success: bool,
}

/// A fault to record. Severity defaults to `Medium`.
#[derive(Clone, Debug)]
pub struct NewError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub identity: Option<UserId>,
}

impl NewError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity: Severity::default(),
            identity: None,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn identity(mut self, identity: UserId) -> Self {
        self.identity = Some(identity);
        self
    }
}

// ============== Fix table ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryTarget {
    Network,
    Store,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Transport,
    Crypto,
    Core,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Transport => "transport",
            Module::Crypto => "crypto",
            Module::Core => "core",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixAction {
    /// Probe the target up to `attempts` times; succeeds on the first healthy probe.
    Retry { target: RetryTarget, attempts: u32 },
    /// Write the pending document again, up to `attempts` times. Succeeds only
    /// once the in-memory state is on disk.
    RewriteStore { attempts: u32 },
    /// Issue a fresh short-lived code to the identity the fault concerns.
    ReissueCredential,
    /// Drop and rebuild transient in-memory indices.
    ClearCaches,
    /// Ask the host to reset a module.
    ResetModule { module: Module },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fix {
    pub name: &'static str,
    pub action: FixAction,
}

const NETWORK_FIXES: &[Fix] = &[
    Fix {
        name: "Retry Connection",
        action: FixAction::Retry {
            target: RetryTarget::Network,
            attempts: 3,
        },
    },
    Fix {
        name: "Reset Transport",
        action: FixAction::ResetModule {
            module: Module::Transport,
        },
    },
];

const DB_LOAD_FIXES: &[Fix] = &[
    Fix {
        name: "Reconnect Store",
        action: FixAction::Retry {
            target: RetryTarget::Store,
            attempts: 3,
        },
    },
    Fix {
        name: "Clear Cache",
        action: FixAction::ClearCaches,
    },
];

const DB_SAVE_FIXES: &[Fix] = &[Fix {
    name: "Retry Store Write",
    action: FixAction::RewriteStore { attempts: 3 },
}];

const OTP_EXPIRED_FIXES: &[Fix] = &[Fix {
    name: "Generate New OTP",
    action: FixAction::ReissueCredential,
}];

const ENCRYPTION_FIXES: &[Fix] = &[Fix {
    name: "Reset Crypto Module",
    action: FixAction::ResetModule {
        module: Module::Crypto,
    },
}];

const UNKNOWN_FIXES: &[Fix] = &[
    Fix {
        name: "Restart Module",
        action: FixAction::ResetModule {
            module: Module::Core,
        },
    },
    Fix {
        name: "Clear Cache",
        action: FixAction::ClearCaches,
    },
];

/// Ordered candidate fixes for a code. Codes without an entry use the
/// `UNKNOWN_ERROR` list; an empty list means manual intervention only.
pub fn candidate_fixes(code: &ErrorCode) -> &'static [Fix] {
    match code {
        ErrorCode::Network => NETWORK_FIXES,
        ErrorCode::DbLoad => DB_LOAD_FIXES,
        ErrorCode::DbSave => DB_SAVE_FIXES,
        ErrorCode::OtpExpired => OTP_EXPIRED_FIXES,
        ErrorCode::Encryption => ENCRYPTION_FIXES,
        // Denied callers and escalations are for a human to look at. Decryption
        // fails on malformed input, which no reset repairs.
        ErrorCode::AccessDenied | ErrorCode::AutoFixExhausted | ErrorCode::Decryption => &[],
        ErrorCode::Unknown | ErrorCode::Other(_) => UNKNOWN_FIXES,
    }
}

/// Side effects fix actions may perform. Implemented by the gate over its state.
pub trait FixEnv {
    fn probe(&mut self, target: RetryTarget) -> bool;
    fn rewrite_store(&mut self) -> bool;
    fn reissue_credential(&mut self, identity: UserId) -> bool;
    fn clear_caches(&mut self) -> bool;
    fn reset_module(&mut self, module: Module) -> bool;
}

fn apply_fix(action: FixAction, error: &ErrorRecord, env: &mut dyn FixEnv) -> bool {
    match action {
        FixAction::Retry { target, attempts } => (0..attempts).any(|_| env.probe(target)),
        FixAction::RewriteStore { attempts } => (0..attempts).any(|_| env.rewrite_store()),
        FixAction::ReissueCredential => error
            .identity
            .map_or(false, |identity| env.reissue_credential(identity)),
        FixAction::ClearCaches => env.clear_caches(),
        FixAction::ResetModule { module } => env.reset_module(module),
    }
}

// ============== Controller ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    /// Up to the last `RECENT_WINDOW` records, oldest first.
    pub recent: Vec<ErrorRecord>,
    pub auto_fix_successes: usize,
    pub auto_fix_failures: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoFixSummary {
    pub attempted: usize,
    pub fixed: usize,
}

#[derive(Debug)]
pub struct ErrorController {
    log: VecDeque<ErrorRecord>,
    fixes: VecDeque<FixRecord>,
    next_id: u64,
    cap: usize,
    auto_fix: bool,

    // Maintained incrementally so `report()` stays O(recent window).
    resolved: usize,
    fix_successes: usize,
    fix_failures: usize,
}

impl Default for ErrorController {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_CAP, true)
    }
}

impl ErrorController {
    pub fn new(cap: usize, auto_fix: bool) -> Self {
        Self {
            log: VecDeque::new(),
            fixes: VecDeque::new(),
            next_id: 1,
            cap: cap.max(1),
            auto_fix,
            resolved: 0,
            fix_successes: 0,
            fix_failures: 0,
        }
    }

    /// Restore from persisted history; the count cap is applied immediately.
    pub fn from_records(
        mut errors: Vec<ErrorRecord>,
        fixes: Vec<FixRecord>,
        cap: usize,
        auto_fix: bool,
    ) -> Self {
        let mut ctl = Self::new(cap, auto_fix);
        errors.sort_by_key(|e| e.id);
        ctl.next_id = errors.iter().map(|e| e.id).max().map_or(1, |m| m + 1);
        for rec in errors {
            ctl.push_error(rec);
        }
        for fix in fixes {
            ctl.push_fix(fix);
        }
        ctl
    }

    pub fn auto_fix_enabled(&self) -> bool {
        self.auto_fix
    }

    pub fn set_auto_fix(&mut self, enabled: bool) {
        self.auto_fix = enabled;
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.log.iter()
    }

    pub fn fix_history(&self) -> impl Iterator<Item = &FixRecord> {
        self.fixes.iter()
    }

    pub fn get(&self, id: u64) -> Option<&ErrorRecord> {
        self.position(id).map(|pos| &self.log[pos])
    }

    /// Record a fault and, if enabled, remediate it before returning.
    pub fn add_error(&mut self, new: NewError, now: Timestamp, env: &mut dyn FixEnv) -> ErrorRecord {
        let id = self.append(new, now);

        if self.auto_fix {
            let code = self.log.back().map(|r| r.code.clone());
            let has_candidates = code.as_ref().map_or(false, |c| !candidate_fixes(c).is_empty());
            if has_candidates && !self.remediate(id, now, env) {
                let code = code.unwrap_or(ErrorCode::Unknown);
                tracing::error!(error_id = id, %code, "auto-fix exhausted; needs manual intervention");
                self.append(
                    NewError::new(
                        ErrorCode::AutoFixExhausted,
                        format!("no automatic fix succeeded for error #{id} ({code})"),
                    )
                    .severity(Severity::Critical),
                    now,
                );
            }
        }

        match self.get(id) {
            Some(rec) => rec.clone(),
            // Only reachable with a cap of 1 and an escalation evicting the record.
            None => ErrorRecord {
                id,
                code: ErrorCode::Unknown,
                message: String::new(),
                severity: Severity::default(),
                timestamp: now,
                resolved: false,
                fix_applied: None,
                resolved_at: None,
                identity: None,
            },
        }
    }

    /// Retry remediation for every unresolved record that has candidate fixes.
    pub fn run_auto_fix(&mut self, now: Timestamp, env: &mut dyn FixEnv) -> AutoFixSummary {
        let pending: Vec<u64> = self
            .log
            .iter()
            .filter(|r| !r.resolved && !candidate_fixes(&r.code).is_empty())
            .map(|r| r.id)
            .collect();

        let mut summary = AutoFixSummary::default();
        for id in pending {
            summary.attempted += 1;
            if self.remediate(id, now, env) {
                summary.fixed += 1;
            }
        }
        summary
    }

    pub fn report(&self) -> ErrorReport {
        let mut recent: Vec<ErrorRecord> =
            self.log.iter().rev().take(RECENT_WINDOW).cloned().collect();
        recent.reverse();

        ErrorReport {
            total: self.log.len(),
            resolved: self.resolved,
            unresolved: self.log.len() - self.resolved,
            recent,
            auto_fix_successes: self.fix_successes,
            auto_fix_failures: self.fix_failures,
        }
    }

    /// Drop error and fix records older than `max_age_days`. Returns (errors, fixes) removed.
    pub fn prune_old(&mut self, max_age_days: u32, now: Timestamp) -> (usize, usize) {
        let cutoff = now - Duration::days(i64::from(max_age_days));

        let errors_before = self.log.len();
        let mut resolved_removed = 0usize;
        self.log.retain(|r| {
            let keep = r.timestamp > cutoff;
            if !keep && r.resolved {
                resolved_removed += 1;
            }
            keep
        });
        self.resolved -= resolved_removed;

        let fixes_before = self.fixes.len();
        let (mut ok_removed, mut failed_removed) = (0usize, 0usize);
        self.fixes.retain(|f| {
            let keep = f.timestamp > cutoff;
            if !keep {
                if f.success {
                    ok_removed += 1;
                } else {
                    failed_removed += 1;
                }
            }
            keep
        });
        self.fix_successes -= ok_removed;
        self.fix_failures -= failed_removed;

        (
            errors_before - self.log.len(),
            fixes_before - self.fixes.len(),
        )
    }

    /// Forget all error and fix history. Ids keep increasing.
    pub fn clear(&mut self) {
        self.log.clear();
        self.fixes.clear();
        self.resolved = 0;
        self.fix_successes = 0;
        self.fix_failures = 0;
    }

    fn append(&mut self, new: NewError, now: Timestamp) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        tracing::debug!(error_id = id, code = %new.code, severity = %new.severity, "{}", new.message);
        self.push_error(ErrorRecord {
            id,
            code: new.code,
            message: new.message,
            severity: new.severity,
            timestamp: now,
            resolved: false,
            fix_applied: None,
            resolved_at: None,
            identity: new.identity,
        });
        id
    }

    fn push_error(&mut self, rec: ErrorRecord) {
        if rec.resolved {
            self.resolved += 1;
        }
        self.log.push_back(rec);
        while self.log.len() > self.cap {
            if let Some(evicted) = self.log.pop_front() {
                if evicted.resolved {
                    self.resolved -= 1;
                }
            }
        }
    }

    fn push_fix(&mut self, fix: FixRecord) {
        if fix.success {
            self.fix_successes += 1;
        } else {
            self.fix_failures += 1;
        }
        self.fixes.push_back(fix);
        while self.fixes.len() > self.cap {
            if let Some(evicted) = self.fixes.pop_front() {
                if evicted.success {
                    self.fix_successes -= 1;
                } else {
                    self.fix_failures -= 1;
                }
            }
        }
    }

    fn remediate(&mut self, id: u64, now: Timestamp, env: &mut dyn FixEnv) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let snapshot = self.log[pos].clone();
        if snapshot.resolved {
            return true;
        }

        for fix in candidate_fixes(&snapshot.code) {
            let success = apply_fix(fix.action, &snapshot, env);
            self.push_fix(FixRecord {
                error_id: id,
                fix_name: fix.name.to_string(),
                timestamp: now,
                success,
            });

            if success {
                // The log is untouched while fixes run, so `pos` still points at the record.
                let rec = &mut self.log[pos];
                rec.resolved = true;
                rec.fix_applied = Some(fix.name.to_string());
                rec.resolved_at = Some(now);
                self.resolved += 1;
                tracing::info!(error_id = id, code = %snapshot.code, "auto-fix applied: {}", fix.name);
                return true;
            }
            tracing::debug!(error_id = id, "fix failed: {}", fix.name);
        }
        false
    }

    /// Ids increase along the log, so lookup is a binary search.
    fn position(&self, id: u64) -> Option<usize> {
        self.log.binary_search_by_key(&id, |r| r.id).ok()
    }
}
