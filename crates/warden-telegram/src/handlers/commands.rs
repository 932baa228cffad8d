use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
};

use warden_core::{
    access::AccessGate,
    domain::{OtpOwner, UserId},
    otp::PURPOSE_ACCESS,
    settings::SettingsUpdate,
};

use crate::{format, format::escape_html, health::LinkMonitor, router::AppState};

/// Purpose tag of codes users issue for themselves.
const PURPOSE_USER: &str = "USER_ACCESS";

/// Purposes only the owner may issue.
const RESERVED_PURPOSES: &[&str] = &[PURPOSE_ACCESS];

pub(crate) fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

#[derive(Clone, Debug)]
pub(crate) struct Caller {
    pub id: UserId,
    pub name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Keyboard {
    MainMenu { owner: bool },
    ErrorActions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Reply {
    pub html: String,
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    fn text(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            keyboard: None,
        }
    }

    fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

const OWNER_ONLY: &str = "⛔ Owner only.";

/// Run one command for `caller` and build the reply.
///
/// Everything except `/redeem` goes through classification first; untrusted
/// callers get the hostile reply.
pub(crate) async fn execute(gate: &AccessGate, caller: &Caller, cmd: &str, arg: &str) -> Reply {
    if cmd == "redeem" {
        return redeem(gate, caller, arg).await;
    }

    let verdict = gate.classify(caller.id).await;
    if let Some(token) = verdict.hostile {
        return Reply::text(format::hostile(caller.id, token));
    }
    let owner = gate.is_owner(caller.id);

    match cmd {
        "start" | "help" => {
            let settings = gate.settings().await;
            let name = caller.name.as_deref().unwrap_or("there");
            let mode = if settings.encryption_mode {
                "ENCRYPTED"
            } else {
                "NORMAL"
            };
            let mut body = format!(
                "✨ <b>Welcome, {}</b> ✨\n\n\
🆔 ID: <code>{}</code>\n\
📊 Status: ✅ VERIFIED\n\
⚡ Mode: {mode}\n\n\
<b>📋 Commands:</b>\n\
/menu - Main menu\n\
/otp [purpose] - Generate a one-time code\n\
/verify &lt;code&gt; - Check a code\n\
/encrypt &lt;text&gt;, /decrypt &lt;text&gt;\n\
/error - Error report\n\
/status - Store statistics",
                escape_html(name),
                caller.id
            );
            if owner {
                body.push_str(
                    "\n\n<b>👑 Owner:</b>\n\
/invite - Access code for a new user\n\
/grant &lt;id&gt; [days], /revoke &lt;id&gt;\n\
/users - List users\n\
/autofix, /clearerrors\n\
/settings [key value]",
                );
            }
            Reply::text(body).with_keyboard(Keyboard::MainMenu { owner })
        }

        "menu" => Reply::text("📋 <b>MAIN MENU</b>").with_keyboard(Keyboard::MainMenu { owner }),

        "otp" => {
            let purpose = if arg.is_empty() {
                PURPOSE_USER.to_string()
            } else {
                arg.to_uppercase()
            };
            if RESERVED_PURPOSES.contains(&purpose.as_str()) {
                return Reply::text(format!(
                    "❌ {} codes are issued by the owner with /invite.",
                    escape_html(&purpose)
                ));
            }
            let issued = gate.generate_otp(OtpOwner::User(caller.id), &purpose).await;
            Reply::text(format::issued_otp(&issued, &purpose))
        }

        "verify" => {
            if arg.is_empty() {
                return Reply::text("Usage: /verify &lt;code&gt;");
            }
            let outcome = gate.verify_otp(arg, caller.id).await;
            Reply::text(format::verify_outcome(arg, &outcome))
        }

        "error" | "errors" => {
            let reply = Reply::text(format::error_report(&gate.error_report().await));
            if owner {
                reply.with_keyboard(Keyboard::ErrorActions)
            } else {
                reply
            }
        }

        "encrypt" | "decrypt" => {
            if arg.is_empty() {
                return Reply::text(format!("Usage: /{cmd} &lt;text&gt;"));
            }
            let res = if cmd == "encrypt" {
                gate.encrypt_text(arg).await
            } else {
                gate.decrypt_text(arg).await
            };
            let active = gate.settings().await.encryption_mode;
            match res {
                Ok(out) => Reply::text(format!(
                    "🔐 <b>{}</b>\n\nInput: <code>{}</code>\nOutput: <code>{}</code>\n\nMode: {}",
                    cmd.to_uppercase(),
                    escape_html(arg),
                    escape_html(&out),
                    if active { "Active" } else { "Inactive" }
                )),
                Err(e) => Reply::text(format!("❌ {}", escape_html(&e.to_string()))),
            }
        }

        "status" | "stats" => Reply::text(format::store_stats(&gate.stats().await)),

        "invite" if owner => {
            let issued = gate.generate_otp(OtpOwner::Any, PURPOSE_ACCESS).await;
            Reply::text(format!(
                "{}\n\nThe recipient sends <code>/redeem {}</code>.",
                format::issued_otp(&issued, PURPOSE_ACCESS),
                issued.code
            ))
        }

        "grant" if owner => match parse_grant_args(arg) {
            Ok((id, days)) => {
                let days = match days {
                    Some(d) => d,
                    None => gate.settings().await.access_ttl_days,
                };
                match gate.grant_access(id, days, None).await {
                    Ok(user) => Reply::text(format!("🎫 Granted: {}", format::user_line(&user))),
                    Err(e) => Reply::text(format!("❌ {}", escape_html(&e.to_string()))),
                }
            }
            Err(usage) => Reply::text(usage),
        },

        "revoke" if owner => match arg.trim().parse::<i64>() {
            Ok(id) => {
                if gate.revoke_access(UserId(id)).await {
                    Reply::text(format!("🚫 Access revoked for <code>{id}</code>."))
                } else {
                    Reply::text(format!("No user <code>{id}</code>."))
                }
            }
            Err(_) => Reply::text("Usage: /revoke &lt;user_id&gt;"),
        },

        "users" if owner => Reply::text(format::users(&gate.users().await)),

        "autofix" if owner => {
            let summary = gate.run_auto_fix().await;
            Reply::text(format!(
                "🔧 <b>AUTO FIX RESULTS</b>\n\nErrors tried: {}\nFixed: {}\nRemaining: {}",
                summary.attempted,
                summary.fixed,
                summary.attempted - summary.fixed
            ))
        }

        "clearerrors" if owner => {
            gate.clear_errors().await;
            Reply::text("🗑 Error history cleared.")
        }

        "settings" if owner => {
            if arg.is_empty() {
                return Reply::text(format::settings(&gate.settings().await));
            }
            match parse_settings_update(arg) {
                Ok(update) => match gate.update_settings(update).await {
                    Ok(s) => Reply::text(format::settings(&s)),
                    Err(e) => Reply::text(format!("❌ {}", escape_html(&e.to_string()))),
                },
                Err(usage) => Reply::text(usage),
            }
        }

        "invite" | "grant" | "revoke" | "users" | "autofix" | "clearerrors" | "settings" => {
            Reply::text(OWNER_ONLY)
        }

        _ => Reply::text("Unknown command. Try /help"),
    }
}

async fn redeem(gate: &AccessGate, caller: &Caller, arg: &str) -> Reply {
    if arg.is_empty() {
        return Reply::text("Usage: /redeem &lt;code&gt;");
    }
    let r = gate
        .redeem_access_code(arg, caller.id, caller.name.clone())
        .await;
    match r.user {
        Some(user) => Reply::text(format!(
            "✅ <b>ACCESS GRANTED</b>\n\nValid until: {}\nSend /start to begin.",
            user.expires_at
                .map(format::format_ts)
                .unwrap_or_else(|| "never".to_string())
        )),
        None if r.outcome.valid => Reply::text("❌ This code is not an access code."),
        None => Reply::text(format!("❌ <b>REDEEM FAILED</b>\n\nReason: {}", r.outcome.reason.as_str())),
    }
}

pub(crate) fn parse_grant_args(arg: &str) -> Result<(UserId, Option<u32>), &'static str> {
    const USAGE: &str = "Usage: /grant &lt;user_id&gt; [days]";
    let mut it = arg.split_whitespace();
    let id = it
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(USAGE)?;
    let days = match it.next() {
        Some(s) => Some(s.parse::<u32>().map_err(|_| USAGE)?),
        None => None,
    };
    if it.next().is_some() {
        return Err(USAGE);
    }
    Ok((UserId(id), days))
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_settings_update(arg: &str) -> Result<SettingsUpdate, &'static str> {
    const USAGE: &str = "Usage: /settings &lt;key&gt; &lt;value&gt;\n\
Keys: auto_fix, otp_ttl_minutes, max_otp_attempts, access_ttl_days, hostile_mode, encryption_mode";

    let mut it = arg.split_whitespace();
    let (Some(key), Some(value), None) = (it.next(), it.next(), it.next()) else {
        return Err(USAGE);
    };

    let number = || value.parse::<u32>().map_err(|_| USAGE);
    let flag = || parse_flag(value).ok_or(USAGE);

    let mut update = SettingsUpdate::default();
    match key.to_ascii_lowercase().as_str() {
        "auto_fix" => update.auto_fix = Some(flag()?),
        "otp_ttl_minutes" => update.otp_ttl_minutes = Some(number()?),
        "max_otp_attempts" => update.max_otp_attempts = Some(number()?),
        "access_ttl_days" => update.access_ttl_days = Some(number()?),
        "hostile_mode" => update.hostile_mode = Some(flag()?),
        "encryption_mode" => update.encryption_mode = Some(flag()?),
        _ => return Err(USAGE),
    }
    Ok(update)
}

pub(crate) fn keyboard_markup(kb: Keyboard) -> InlineKeyboardMarkup {
    let button = |label: &str, cmd: &str| InlineKeyboardButton::callback(label, format!("cmd:{cmd}"));
    let rows = match kb {
        Keyboard::MainMenu { owner } => {
            let mut rows = vec![
                vec![button("🔐 Generate OTP", "otp"), button("📊 Status", "status")],
                vec![button("⚠ Error Report", "error")],
            ];
            if owner {
                rows.push(vec![button("🎫 Invite", "invite"), button("👥 Users", "users")]);
                rows.push(vec![button("🔧 Auto Fix", "autofix"), button("⚙ Settings", "settings")]);
            }
            rows
        }
        Keyboard::ErrorActions => vec![vec![
            button("🔧 Run Auto Fix", "autofix"),
            button("🗑 Clear Errors", "clearerrors"),
        ]],
    };
    InlineKeyboardMarkup::new(rows)
}

pub(crate) async fn send_reply(
    bot: &Bot,
    link: &LinkMonitor,
    chat: teloxide::types::ChatId,
    reply: Reply,
) {
    let mut req = bot.send_message(chat, reply.html).parse_mode(ParseMode::Html);
    if let Some(kb) = reply.keyboard {
        req = req.reply_markup(keyboard_markup(kb));
    }
    let res = req.await;
    link.observe(&format!("reply to chat {}", chat.0), &res).await;
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let caller = Caller {
        id: UserId(user.id.0 as i64),
        name: Some(user.first_name.clone()).filter(|n| !n.is_empty()),
    };
    let (cmd, arg) = parse_command(text);
    tracing::debug!(user = %caller.id, cmd = %cmd, "command");

    let reply = execute(&state.gate, &caller, &cmd, &arg).await;
    send_reply(&bot, &state.link, msg.chat.id, reply).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{access::GateDeps, config::Config};

    const OWNER: UserId = UserId(1000);

    fn gate(dir: &std::path::Path) -> AccessGate {
        let mut cfg = Config::defaults(dir.join("db.json"));
        cfg.owner_id = Some(OWNER);
        AccessGate::open(&cfg, GateDeps::default())
    }

    fn caller(id: i64) -> Caller {
        Caller {
            id: UserId(id),
            name: Some("Tester".to_string()),
        }
    }

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(
            parse_command("/Grant@warden_bot 42 7"),
            ("grant".to_string(), "42 7".to_string())
        );
        assert_eq!(parse_command("/start"), ("start".to_string(), String::new()));
    }

    #[test]
    fn grant_args() {
        assert_eq!(parse_grant_args("42"), Ok((UserId(42), None)));
        assert_eq!(parse_grant_args("42 7"), Ok((UserId(42), Some(7))));
        assert!(parse_grant_args("x").is_err());
        assert!(parse_grant_args("42 7 9").is_err());
    }

    #[test]
    fn settings_updates() {
        let u = parse_settings_update("hostile_mode on").unwrap();
        assert_eq!(u.hostile_mode, Some(true));
        let u = parse_settings_update("OTP_TTL_MINUTES 15").unwrap();
        assert_eq!(u.otp_ttl_minutes, Some(15));
        assert!(parse_settings_update("hostile_mode maybe").is_err());
        assert!(parse_settings_update("colour blue").is_err());
        assert!(parse_settings_update("auto_fix").is_err());
    }

    #[tokio::test]
    async fn stranger_gets_hostile_reply_but_can_redeem() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(dir.path());

        let reply = execute(&gate, &caller(5), "start", "").await;
        assert!(reply.html.contains("ACCESS DENIED"));
        assert!(reply.keyboard.is_none());

        let invite = execute(&gate, &caller(OWNER.0), "invite", "").await;
        assert_eq!(gate.stats().await.live_otps, 1);
        let code = invite.html.split("/redeem ").nth(1).unwrap()[..6].to_string();

        let redeemed = execute(&gate, &caller(5), "redeem", &code).await;
        assert!(redeemed.html.contains("ACCESS GRANTED"));

        let welcome = execute(&gate, &caller(5), "start", "").await;
        assert!(welcome.html.contains("VERIFIED"));
        assert_eq!(welcome.keyboard, Some(Keyboard::MainMenu { owner: false }));
    }

    #[tokio::test]
    async fn admin_commands_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(dir.path());
        gate.grant_access(UserId(5), 30, None).await.unwrap();

        let reply = execute(&gate, &caller(5), "grant", "6 10").await;
        assert_eq!(reply.html, OWNER_ONLY);
        assert_eq!(gate.users().await.len(), 1);

        let reply = execute(&gate, &caller(OWNER.0), "grant", "6 10").await;
        assert!(reply.html.starts_with("🎫 Granted"));
        assert_eq!(gate.users().await.len(), 2);

        let reply = execute(&gate, &caller(OWNER.0), "revoke", "6").await;
        assert!(reply.html.contains("revoked"));
    }

    #[tokio::test]
    async fn users_cannot_extend_their_own_access() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(dir.path());
        let granted = gate.grant_access(UserId(5), 1, None).await.unwrap();

        let refused = execute(&gate, &caller(5), "otp", "access").await;
        assert!(refused.html.contains("/invite"));
        assert_eq!(gate.stats().await.live_otps, 0);

        let own = execute(&gate, &caller(5), "otp", "").await;
        let code = own.html.split("<code>").nth(1).unwrap()[..6].to_string();
        let redeemed = execute(&gate, &caller(5), "redeem", &code).await;
        assert!(redeemed.html.contains("not an access code"));

        let user = gate.users().await.pop().unwrap();
        assert_eq!(user.expires_at, granted.expires_at);
    }

    #[tokio::test]
    async fn otp_then_verify_for_self() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(dir.path());

        let reply = execute(&gate, &caller(OWNER.0), "otp", "").await;
        let code = reply.html.split("<code>").nth(1).unwrap()[..6].to_string();

        let ok = execute(&gate, &caller(OWNER.0), "verify", &code).await;
        assert!(ok.html.contains("OTP VERIFIED"));
        let missing = execute(&gate, &caller(OWNER.0), "verify", "000000").await;
        assert!(missing.html.contains("not found"));
    }
}
