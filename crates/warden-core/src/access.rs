//! Access gate: the single entry point the transport talks to.
//!
//! All mutable state (users, codes, error history, settings, the dirty flag)
//! lives in one `GateState` behind a tokio mutex. Every operation takes the
//! lock, mutates, writes the whole document once and releases, so sweeps and
//! foreground calls never interleave inside a read-modify-write.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Duration;

use crate::{
    config::Config,
    crypto::{self, EncryptionKey},
    domain::{ErrorCode, OtpOwner, Severity, Timestamp, UserId, UserRecord, UserStatus},
    error_controller::{
        AutoFixSummary, ErrorController, ErrorRecord, ErrorReport, FixEnv, Module, NewError,
        RetryTarget,
    },
    errors::Error,
    otp::{IssuedOtp, OtpManager, OtpPolicy, VerifyOutcome, VerifyReason, PURPOSE_ACCESS},
    ports::{Clock, ConnectivityProbe, EventSink, GateEvent, NullSink, SystemClock},
    settings::{Settings, SettingsUpdate},
    stats::StoreStats,
    store::{Document, LoadStatus, PersistenceStore},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Trusted,
    Untrusted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    /// No record for the identity.
    Unknown,
    Expired,
    Revoked,
    /// Hostile mode is on; only the owner gets through.
    Lockdown,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unknown => "unknown identity",
            DenyReason::Expired => "access expired",
            DenyReason::Revoked => "access revoked",
            DenyReason::Lockdown => "lockdown",
        }
    }
}

/// Marker telling the presentation layer to answer defensively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostileToken {
    pub reason: DenyReason,
    /// The `ACCESS_DENIED` record written for this classification.
    pub error_id: u64,
    /// Classification time on the gate's clock.
    pub at: Timestamp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub mode: AccessMode,
    pub user: Option<UserRecord>,
    pub hostile: Option<HostileToken>,
}

impl Classification {
    pub fn is_trusted(&self) -> bool {
        self.mode == AccessMode::Trusted
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Redemption {
    pub outcome: VerifyOutcome,
    /// Set when the code was valid and access was granted.
    pub user: Option<UserRecord>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub otps_swept: usize,
    pub errors_pruned: usize,
    pub fixes_pruned: usize,
}

/// Host-side collaborators. `Default` gives a silent, wall-clock gate.
#[derive(Clone)]
pub struct GateDeps {
    pub events: Arc<dyn EventSink>,
    pub probe: Option<Arc<dyn ConnectivityProbe>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for GateDeps {
    fn default() -> Self {
        Self {
            events: Arc::new(NullSink),
            probe: None,
            clock: Arc::new(SystemClock),
        }
    }
}

struct Host {
    deps: GateDeps,
    owner_id: Option<UserId>,
    key: EncryptionKey,
    error_retention_days: u32,
}

struct GateState {
    store: PersistenceStore,
    settings: Settings,
    users: BTreeMap<UserId, UserRecord>,
    otp: OtpManager,
    errors: ErrorController,
    /// Last save failed; the next operation writes again.
    dirty: bool,
}

pub struct AccessGate {
    host: Host,
    state: tokio::sync::Mutex<GateState>,
}

impl AccessGate {
    /// Load the store and build the gate. Never fails: store problems are
    /// recorded as errors and the gate runs on defaults until a write succeeds.
    pub fn open(cfg: &Config, deps: GateDeps) -> Self {
        let host = Host {
            deps,
            owner_id: cfg.owner_id,
            key: cfg.encryption_key.clone(),
            error_retention_days: cfg.error_retention_days,
        };
        let now = host.deps.clock.now();
        let store = PersistenceStore::new(&cfg.store_path, cfg.default_settings.clone());

        let (document, load_fault) = match store.load() {
            Ok(loaded) => {
                let fault = match loaded.status {
                    LoadStatus::Replaced { reason } => Some(
                        NewError::new(ErrorCode::DbLoad, format!("store replaced: {reason}"))
                            .severity(Severity::High),
                    ),
                    LoadStatus::Loaded { .. } | LoadStatus::Initialized => None,
                };
                (loaded.document, fault)
            }
            Err(e @ Error::CorruptStore { .. }) => {
                let fault = NewError::new(ErrorCode::DbLoad, e.to_string()).severity(Severity::Critical);
                (store.default_document(), Some(fault))
            }
            Err(e) => {
                let fault = NewError::new(ErrorCode::DbLoad, e.to_string()).severity(Severity::High);
                (store.default_document(), Some(fault))
            }
        };

        let Document {
            users,
            otp_records,
            error_logs,
            fix_history,
            settings,
        } = document;

        let mut state = GateState {
            store,
            users: users.into_iter().map(|u| (u.id, u)).collect(),
            otp: OtpManager::from_records(otp_records, now),
            errors: ErrorController::from_records(
                error_logs,
                fix_history,
                cfg.error_log_cap,
                settings.auto_fix,
            ),
            settings,
            dirty: false,
        };

        if let Some(fault) = load_fault {
            tracing::error!("store load problem: {}", fault.message);
            state.record(&host, fault, now);
            state.dirty = true;
            state.commit(&host, now);
        }

        tracing::info!(
            users = state.users.len(),
            live_otps = state.otp.live_count(),
            errors = state.errors.report().total,
            "access gate ready"
        );

        Self {
            host,
            state: tokio::sync::Mutex::new(state),
        }
    }

    pub fn owner_id(&self) -> Option<UserId> {
        self.host.owner_id
    }

    pub fn is_owner(&self, identity: UserId) -> bool {
        self.host.owner_id == Some(identity)
    }

    fn now(&self) -> Timestamp {
        self.host.deps.clock.now()
    }

    // ============== Access ==============

    pub async fn classify(&self, identity: UserId) -> Classification {
        let now = self.now();
        let mut st = self.state.lock().await;
        let user = st.users.get(&identity).cloned();

        if self.is_owner(identity) {
            return Classification {
                mode: AccessMode::Trusted,
                user,
                hostile: None,
            };
        }

        let denial = if st.settings.hostile_mode {
            Some(DenyReason::Lockdown)
        } else {
            match &user {
                None => Some(DenyReason::Unknown),
                Some(u) if u.status == UserStatus::Revoked => Some(DenyReason::Revoked),
                Some(u) if !u.is_trusted_at(now) => Some(DenyReason::Expired),
                Some(_) => None,
            }
        };

        let Some(reason) = denial else {
            st.retry_if_dirty(&self.host, now);
            return Classification {
                mode: AccessMode::Trusted,
                user,
                hostile: None,
            };
        };

        tracing::warn!(%identity, reason = reason.as_str(), "access denied");
        let rec = st.record(
            &self.host,
            NewError::new(
                ErrorCode::AccessDenied,
                format!("access denied for {identity}: {}", reason.as_str()),
            )
            .severity(Severity::High)
            .identity(identity),
            now,
        );
        st.commit(&self.host, now);

        Classification {
            mode: AccessMode::Untrusted,
            user,
            hostile: Some(HostileToken {
                reason,
                error_id: rec.id,
                at: now,
            }),
        }
    }

    /// Create or extend a user's access to `now + days`.
    pub async fn grant_access(
        &self,
        identity: UserId,
        days: u32,
        display_name: Option<String>,
    ) -> Result<UserRecord> {
        if days == 0 {
            return Err(Error::InvalidInput("access must last at least one day".to_string()));
        }
        let now = self.now();
        let mut st = self.state.lock().await;
        let user = st.grant(identity, days, display_name, now);
        tracing::info!(%identity, days, "access granted");
        st.commit(&self.host, now);
        Ok(user)
    }

    /// Revoke access and invalidate the identity's outstanding codes.
    /// Returns false for an unknown identity.
    pub async fn revoke_access(&self, identity: UserId) -> bool {
        let now = self.now();
        let mut st = self.state.lock().await;
        let Some(user) = st.users.get_mut(&identity) else {
            return false;
        };
        user.status = UserStatus::Revoked;
        user.expires_at = Some(now);
        let invalidated = st.otp.invalidate_for(identity);
        tracing::info!(%identity, invalidated, "access revoked");
        st.commit(&self.host, now);
        true
    }

    pub async fn users(&self) -> Vec<UserRecord> {
        let st = self.state.lock().await;
        st.users.values().cloned().collect()
    }

    /// Mark ACTIVE users past their expiry as EXPIRED. Returns who changed.
    pub async fn expiry_sweep(&self) -> Vec<UserId> {
        let now = self.now();
        let mut st = self.state.lock().await;

        let mut expired = Vec::new();
        for user in st.users.values_mut() {
            if user.status == UserStatus::Active && user.expires_at.is_some_and(|exp| exp <= now) {
                user.status = UserStatus::Expired;
                expired.push(user.id);
            }
        }

        if expired.is_empty() {
            st.retry_if_dirty(&self.host, now);
            return expired;
        }

        tracing::info!(count = expired.len(), "access expired");
        st.commit(&self.host, now);
        drop(st);

        let delivered = self.host.deps.events.emit(GateEvent::AccessExpired {
            identities: expired.clone(),
        });
        if !delivered {
            tracing::warn!("access-expired notification not delivered");
        }
        expired
    }

    // ============== OTP ==============

    pub async fn generate_otp(&self, owner: OtpOwner, purpose: &str) -> IssuedOtp {
        let now = self.now();
        let mut st = self.state.lock().await;
        let policy = OtpPolicy::from_settings(&st.settings);
        let issued = st.otp.generate(owner, purpose, policy, now);
        tracing::info!(?owner, purpose, "otp issued");
        st.commit(&self.host, now);
        issued
    }

    pub async fn verify_otp(&self, code: &str, identity: UserId) -> VerifyOutcome {
        let now = self.now();
        let mut st = self.state.lock().await;
        let outcome = st.verify(&self.host, code, identity, now);
        st.commit(&self.host, now);
        outcome
    }

    /// Verify an invitation code and, if valid, consume it and grant access for
    /// the configured access TTL. Only `ACCESS` codes open to any identity
    /// (the ones the owner hands out) are redeemable.
    pub async fn redeem_access_code(
        &self,
        code: &str,
        identity: UserId,
        display_name: Option<String>,
    ) -> Redemption {
        let now = self.now();
        let mut st = self.state.lock().await;

        let invitation = st.otp.lookup(code).is_some_and(|rec| rec.owner == OtpOwner::Any);
        let outcome = st.verify(&self.host, code, identity, now);
        let user = if outcome.valid
            && invitation
            && outcome.purpose.as_deref() == Some(PURPOSE_ACCESS)
        {
            st.otp.consume(code);
            let days = st.settings.access_ttl_days;
            let user = st.grant(identity, days, display_name, now);
            tracing::info!(%identity, days, "access code redeemed");
            Some(user)
        } else {
            None
        };

        st.commit(&self.host, now);
        Redemption { outcome, user }
    }

    // ============== Errors ==============

    pub async fn add_error(&self, new: NewError) -> ErrorRecord {
        let now = self.now();
        let mut st = self.state.lock().await;
        let rec = st.record(&self.host, new, now);
        st.commit(&self.host, now);
        rec
    }

    pub async fn error_report(&self) -> ErrorReport {
        let st = self.state.lock().await;
        st.errors.report()
    }

    pub async fn run_auto_fix(&self) -> AutoFixSummary {
        let now = self.now();
        let mut st = self.state.lock().await;
        let summary = st.with_remedies(&self.host, now, |errors, env| errors.run_auto_fix(now, env));
        tracing::info!(attempted = summary.attempted, fixed = summary.fixed, "auto-fix run");
        st.commit(&self.host, now);
        summary
    }

    pub async fn clear_errors(&self) {
        let now = self.now();
        let mut st = self.state.lock().await;
        st.errors.clear();
        tracing::info!("error history cleared");
        st.commit(&self.host, now);
    }

    // ============== Text pass-through ==============

    /// Encrypt when encryption mode is on; otherwise return the input unchanged.
    pub async fn encrypt_text(&self, text: &str) -> Result<String> {
        self.transform(text, ErrorCode::Encryption, crypto::encrypt_text).await
    }

    /// Decrypt when encryption mode is on; otherwise return the input unchanged.
    pub async fn decrypt_text(&self, text: &str) -> Result<String> {
        self.transform(text, ErrorCode::Decryption, crypto::decrypt_text).await
    }

    async fn transform(
        &self,
        text: &str,
        code: ErrorCode,
        op: fn(&str, &EncryptionKey) -> Result<String>,
    ) -> Result<String> {
        let now = self.now();
        let mut st = self.state.lock().await;
        if !st.settings.encryption_mode {
            return Ok(text.to_string());
        }

        match op(text, &self.host.key) {
            Ok(out) => Ok(out),
            Err(e) => {
                st.record(&self.host, NewError::new(code, e.to_string()), now);
                st.commit(&self.host, now);
                Err(e)
            }
        }
    }

    // ============== Settings & housekeeping ==============

    pub async fn settings(&self) -> Settings {
        self.state.lock().await.settings.clone()
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<Settings> {
        if update.is_empty() {
            return Ok(self.settings().await);
        }
        let now = self.now();
        let mut st = self.state.lock().await;
        update.apply(&mut st.settings)?;
        let auto_fix = st.settings.auto_fix;
        st.errors.set_auto_fix(auto_fix);
        tracing::info!(settings = ?st.settings, "settings updated");
        st.commit(&self.host, now);
        Ok(st.settings.clone())
    }

    pub async fn stats(&self) -> StoreStats {
        let now = self.now();
        let st = self.state.lock().await;
        StoreStats::collect(&st.snapshot(), now)
    }

    /// OTP index sweep, age-based error pruning and a flush.
    pub async fn maintenance_sweep(&self) -> MaintenanceSummary {
        let now = self.now();
        let mut st = self.state.lock().await;
        let otps_swept = st.otp.sweep_expired(now);
        let (errors_pruned, fixes_pruned) =
            st.errors.prune_old(self.host.error_retention_days, now);
        st.commit(&self.host, now);

        let summary = MaintenanceSummary {
            otps_swept,
            errors_pruned,
            fixes_pruned,
        };
        tracing::debug!(?summary, "maintenance sweep");
        summary
    }

    /// Write the current state. Used at shutdown.
    pub async fn flush(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let document = st.snapshot();
        st.store.save(&document)?;
        st.dirty = false;
        Ok(())
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }
}

impl GateState {
    fn snapshot(&self) -> Document {
        Document {
            users: self.users.values().cloned().collect(),
            otp_records: self.otp.records().to_vec(),
            error_logs: self.errors.errors().cloned().collect(),
            fix_history: self.errors.fix_history().cloned().collect(),
            settings: self.settings.clone(),
        }
    }

    /// Persist the whole document. A failed write is recorded (without saving
    /// again) and leaves the state dirty for the next operation.
    fn commit(&mut self, host: &Host, now: Timestamp) {
        match self.store.save(&self.snapshot()) {
            Ok(()) => self.dirty = false,
            Err(e) => {
                tracing::error!("store write failed: {e}");
                self.dirty = true;
                self.record(
                    host,
                    NewError::new(ErrorCode::DbSave, e.to_string()).severity(Severity::High),
                    now,
                );
                if !self.dirty {
                    // The rewrite fix landed the state; write once more to keep the fault record.
                    if let Err(e) = self.store.save(&self.snapshot()) {
                        tracing::warn!("store write failed again: {e}");
                        self.dirty = true;
                    }
                }
            }
        }
    }

    fn retry_if_dirty(&mut self, host: &Host, now: Timestamp) {
        if self.dirty {
            self.commit(host, now);
        }
    }

    fn record(&mut self, host: &Host, new: NewError, now: Timestamp) -> ErrorRecord {
        self.with_remedies(host, now, |errors, env| errors.add_error(new, now, env))
    }

    /// Split-borrow the state so the controller can run fixes against the rest of it.
    fn with_remedies<T>(
        &mut self,
        host: &Host,
        now: Timestamp,
        f: impl FnOnce(&mut ErrorController, &mut dyn FixEnv) -> T,
    ) -> T {
        let pending = self.dirty.then(|| self.snapshot());
        let GateState {
            store,
            settings,
            otp,
            errors,
            dirty,
            ..
        } = self;
        let mut env = Remedies {
            store,
            pending,
            dirty,
            otp,
            policy: OtpPolicy::from_settings(settings),
            events: &*host.deps.events,
            probe: host.deps.probe.as_deref(),
            now,
        };
        f(errors, &mut env)
    }

    fn verify(&mut self, host: &Host, code: &str, identity: UserId, now: Timestamp) -> VerifyOutcome {
        let outcome = self.otp.verify(code, identity, now);
        if outcome.reason == VerifyReason::Expired {
            self.record(
                host,
                NewError::new(ErrorCode::OtpExpired, "expired code presented")
                    .severity(Severity::Low)
                    .identity(identity),
                now,
            );
        }
        tracing::debug!(%identity, reason = outcome.reason.as_str(), "otp verify");
        outcome
    }

    fn grant(
        &mut self,
        identity: UserId,
        days: u32,
        display_name: Option<String>,
        now: Timestamp,
    ) -> UserRecord {
        let expires_at = now + Duration::days(i64::from(days));
        let user = self.users.entry(identity).or_insert_with(|| UserRecord {
            id: identity,
            display_name: String::new(),
            status: UserStatus::Active,
            created_at: now,
            expires_at: None,
        });
        user.status = UserStatus::Active;
        user.expires_at = Some(expires_at);
        if let Some(name) = display_name.filter(|n| !n.trim().is_empty()) {
            user.display_name = name;
        }
        user.clone()
    }
}

/// Fix actions executed against the gate's own state.
struct Remedies<'a> {
    store: &'a PersistenceStore,
    /// The unsaved document, if the last write failed.
    pending: Option<Document>,
    dirty: &'a mut bool,
    otp: &'a mut OtpManager,
    policy: OtpPolicy,
    events: &'a dyn EventSink,
    probe: Option<&'a dyn ConnectivityProbe>,
    now: Timestamp,
}

impl FixEnv for Remedies<'_> {
    fn probe(&mut self, target: RetryTarget) -> bool {
        match target {
            RetryTarget::Store => self.store.probe().is_ok(),
            RetryTarget::Network => self.probe.is_some_and(|p| p.check()),
        }
    }

    fn rewrite_store(&mut self) -> bool {
        let Some(document) = &self.pending else {
            // Nothing unsaved.
            return true;
        };
        match self.store.save(document) {
            Ok(()) => {
                *self.dirty = false;
                self.pending = None;
                true
            }
            Err(e) => {
                tracing::debug!("store rewrite failed: {e}");
                false
            }
        }
    }

    fn reissue_credential(&mut self, identity: UserId) -> bool {
        let issued = self
            .otp
            .generate(identity.into(), PURPOSE_ACCESS, self.policy, self.now);
        self.events.emit(GateEvent::CredentialReissued {
            identity,
            code: issued.code,
            expires_at: issued.expires_at,
        })
    }

    fn clear_caches(&mut self) -> bool {
        self.otp.rebuild_index(self.now);
        true
    }

    fn reset_module(&mut self, module: Module) -> bool {
        tracing::warn!(module = module.as_str(), "requesting module reset");
        self.events.emit(GateEvent::ModuleReset { module })
    }
}
