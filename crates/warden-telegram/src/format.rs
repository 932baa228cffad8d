//! Telegram HTML rendering of gate results.

use warden_core::{
    access::HostileToken,
    domain::{Timestamp, UserId, UserRecord, UserStatus},
    error_controller::ErrorReport,
    otp::{IssuedOtp, VerifyOutcome},
    settings::Settings,
    stats::StoreStats,
};

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn format_ts(ts: Timestamp) -> String {
    ts.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn on_off(v: bool) -> &'static str {
    if v {
        "ON"
    } else {
        "OFF"
    }
}

pub fn hostile(identity: UserId, token: HostileToken) -> String {
    format!(
        "🦠 <b>ACCESS DENIED</b> 🦠\n\n\
👤 User ID: <code>{identity}</code>\n\
🕒 Time: {}\n\
Reason: {}\n\
Incident: #{}\n\n\
🔒 System locked.",
        format_ts(token.at),
        token.reason.as_str(),
        token.error_id,
    )
}

pub fn issued_otp(issued: &IssuedOtp, purpose: &str) -> String {
    format!(
        "🔐 <b>OTP GENERATED</b>\n\n\
OTP: <code>{}</code>\n\
Purpose: {}\n\
Expires: {}\n\n\
⚠️ Do not share this code.",
        issued.code,
        escape_html(purpose),
        format_ts(issued.expires_at),
    )
}

pub fn verify_outcome(code: &str, outcome: &VerifyOutcome) -> String {
    if outcome.valid {
        format!(
            "✅ <b>OTP VERIFIED</b>\n\nOTP <code>{}</code> is valid.\nAttempts left: {}",
            escape_html(code),
            outcome.attempts_remaining
        )
    } else {
        format!(
            "❌ <b>OTP INVALID</b>\n\nReason: {}\nRequest a new code with /otp",
            outcome.reason.as_str()
        )
    }
}

pub fn error_report(report: &ErrorReport) -> String {
    let mut out = format!(
        "⚠️ <b>ERROR CONTROLLER REPORT</b>\n\n\
Total: {}\n\
Resolved: {}\n\
Unresolved: {}\n\
Auto-fix success: {}\n\
Auto-fix failed: {}\n",
        report.total,
        report.resolved,
        report.unresolved,
        report.auto_fix_successes,
        report.auto_fix_failures,
    );

    if !report.recent.is_empty() {
        out.push_str("\n📋 <b>Recent:</b>\n");
        for e in &report.recent {
            let mark = if e.resolved { "✅" } else { "❌" };
            out.push_str(&format!(
                "#{} [{}] {}: {} {mark}\n",
                e.id,
                e.severity,
                e.code,
                escape_html(&e.message)
            ));
        }
    }
    out
}

pub fn store_stats(stats: &StoreStats) -> String {
    format!(
        "📊 <b>STATUS</b>\n\n\
👥 Users: {} ({} active)\n\
🔐 OTP records: {} ({} live)\n\
⚠️ Errors: {} ({} unresolved, {} security, {} in 24h)\n\
🗃 Total records: {}",
        stats.total_users,
        stats.active_users,
        stats.otp_records,
        stats.live_otps,
        stats.error_logs,
        stats.unresolved_errors,
        stats.security_errors,
        stats.errors_last_24h,
        stats.total_records,
    )
}

pub fn settings(s: &Settings) -> String {
    format!(
        "⚙️ <b>SETTINGS</b>\n\n\
auto_fix: {}\n\
otp_ttl_minutes: {}\n\
max_otp_attempts: {}\n\
access_ttl_days: {}\n\
hostile_mode: {}\n\
encryption_mode: {}\n\n\
Change with <code>/settings &lt;key&gt; &lt;value&gt;</code>",
        on_off(s.auto_fix),
        s.otp_ttl_minutes,
        s.max_otp_attempts,
        s.access_ttl_days,
        on_off(s.hostile_mode),
        on_off(s.encryption_mode),
    )
}

pub fn user_line(u: &UserRecord) -> String {
    let status = match u.status {
        UserStatus::Active => "ACTIVE",
        UserStatus::Expired => "EXPIRED",
        UserStatus::Revoked => "REVOKED",
    };
    let name = if u.display_name.is_empty() {
        "-".to_string()
    } else {
        escape_html(&u.display_name)
    };
    let until = u
        .expires_at
        .map(format_ts)
        .unwrap_or_else(|| "never".to_string());
    format!("<code>{}</code> {name} {status} until {until}", u.id)
}

pub fn users(list: &[UserRecord]) -> String {
    if list.is_empty() {
        return "👥 No users yet.".to_string();
    }
    let mut out = format!("👥 <b>USERS</b> ({})\n\n", list.len());
    for u in list {
        out.push_str(&user_line(u));
        out.push('\n');
    }
    out
}
