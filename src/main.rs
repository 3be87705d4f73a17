mod config;
mod error;
mod gate;
mod notifier;
mod ratelimiter;
mod session;
mod settings;
mod smtp;
mod store;
mod utils;

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use structopt::StructOpt;
use tracing::{info, warn};

use crate::config::Credentials;
use crate::gate::{AuthGate, AuthOutcome, RequestContext};
use crate::notifier::SecurityNotifier;
use crate::ratelimiter::{LockoutPolicy, Standing};
use crate::settings::{Applied, Notifications, SettingsAction, SettingsDocument};
use crate::smtp::{SmtpClient, SmtpConfig};
use crate::store::JsonFileStore;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "settings-guard",
    about = "Brute-force lockout for the settings page, with SMTP security alerts",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// Credentials file (SETTINGS_USER, SETTINGS_PASS, EMAIL_FROM, EMAIL_TO, EMAIL_APP_PASSWORD)
    #[structopt(long = "env-file", default_value = ".env", parse(from_os_str))]
    pub env_file: PathBuf,

    /// Settings document
    #[structopt(long = "settings-file", default_value = "config/settings.json", parse(from_os_str))]
    pub settings_file: PathBuf,

    /// Failed-attempt store
    #[structopt(
        long = "rate-limit-file",
        default_value = "/tmp/parking_settings_ratelimit.json",
        parse(from_os_str)
    )]
    pub rate_limit_file: PathBuf,

    /// Failed attempts before lockout (default: 5)
    #[structopt(long = "max-attempts", default_value = "5")]
    pub max_attempts: u32,

    /// Lockout length in minutes (default: 15)
    #[structopt(long = "lockout-minutes", default_value = "15")]
    pub lockout_minutes: u32,

    /// Delay added to every fresh failure, in seconds (default: 2)
    #[structopt(long = "penalty-secs", default_value = "2")]
    pub penalty_secs: u64,

    /// SMTP server (STARTTLS on submission port)
    #[structopt(long = "smtp-host", default_value = "smtp.gmail.com")]
    pub smtp_host: String,

    #[structopt(long = "smtp-port", default_value = "587")]
    pub smtp_port: u16,

    /// Timeout for connect and each SMTP read, in seconds (default: 10)
    #[structopt(long = "smtp-timeout", default_value = "10")]
    pub smtp_timeout: u64,

    /// EHLO name (default: localhost)
    #[structopt(long = "helo", default_value = "localhost")]
    pub helo: String,

    /// Extra PEM trust anchors for the SMTP server
    #[structopt(long = "smtp-ca-file", parse(from_os_str))]
    pub smtp_ca_file: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log every SMTP exchange
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Check the settings password for a caller and apply the change if accepted
    Attempt {
        /// Caller IP address
        #[structopt(long = "ip")]
        ip: String,

        /// Submitted password (read from stdin when omitted)
        #[structopt(long = "password")]
        password: Option<String>,

        #[structopt(long = "user-agent")]
        user_agent: Option<String>,

        #[structopt(long = "referrer")]
        referrer: Option<String>,

        #[structopt(subcommand)]
        action: ActionCmd,
    },

    /// Show the lockout state of an IP address
    Status {
        #[structopt(long = "ip")]
        ip: String,
    },

    /// Clear the failed attempts of an IP address
    Reset {
        #[structopt(long = "ip")]
        ip: String,
    },

    /// Send a test email with the configured SMTP account
    TestEmail,
}

#[derive(Debug, StructOpt)]
pub enum ActionCmd {
    /// Flip the auto-buyer on or off
    ToggleAutobuyer,

    /// Replace the email notification preferences
    SaveNotifications {
        #[structopt(long = "purchase-success")]
        purchase_success: bool,
        #[structopt(long = "purchase-failed")]
        purchase_failed: bool,
        #[structopt(long = "expiry-reminder")]
        expiry_reminder: bool,
        #[structopt(long = "security-alerts")]
        security_alerts: bool,
    },
}

impl ActionCmd {
    fn to_action(&self) -> SettingsAction {
        match self {
            ActionCmd::ToggleAutobuyer => SettingsAction::ToggleAutobuyer,
            ActionCmd::SaveNotifications {
                purchase_success,
                purchase_failed,
                expiry_reminder,
                security_alerts,
            } => SettingsAction::SaveNotifications(Notifications {
                purchase_success: *purchase_success,
                purchase_failed: *purchase_failed,
                expiry_reminder: *expiry_reminder,
                security_alerts: *security_alerts,
            }),
        }
    }
}

/// Notificateur, si un expéditeur et un destinataire sont configurés
fn build_notifier(opt: &Opt, creds: &Credentials) -> Option<SecurityNotifier<SmtpClient>> {
    let (from, to) = creds.mail_route()?;

    let mut config = SmtpConfig::new(creds.email_app_password.clone().unwrap_or_default());
    config.host = opt.smtp_host.clone();
    config.port = opt.smtp_port;
    config.helo_name = opt.helo.clone();
    config.timeout = Duration::from_secs(opt.smtp_timeout);
    config.ca_file = opt.smtp_ca_file.clone();

    match SmtpClient::with_rustls(config) {
        Ok(client) => Some(SecurityNotifier::new(client, from, to)),
        Err(e) => {
            warn!(error = %e, "SMTP client unavailable, notifications disabled");
            None
        }
    }
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn build_gate<'a>(opt: &Opt, creds: &Credentials) -> Result<AuthGate<'a, JsonFileStore>> {
    let policy = LockoutPolicy::with_minutes(opt.max_attempts, opt.lockout_minutes)
        .context("Invalid --lockout-minutes")?;
    Ok(AuthGate::new(
        JsonFileStore::new(&opt.rate_limit_file),
        policy,
        creds.expected_secret(),
    )
    .with_penalty(Duration::from_secs(opt.penalty_secs)))
}

fn run_attempt(
    opt: &Opt,
    creds: &Credentials,
    ctx: RequestContext,
    password: String,
    action: &ActionCmd,
) -> Result<i32> {
    let mut settings = SettingsDocument::load(&opt.settings_file)?;
    let notifier = build_notifier(opt, creds);

    let mut gate = build_gate(opt, creds)?;
    if let Some(notifier) = &notifier {
        if settings.security_alerts_enabled() {
            gate = gate.with_observer(notifier);
        }
    }

    match gate.authenticate(&ctx, &password) {
        AuthOutcome::Blocked { minutes_remaining } => {
            println!(
                "Too many failed attempts. Try again in {} minute(s).",
                minutes_remaining
            );
            Ok(2)
        }
        AuthOutcome::Rejected { attempts_remaining } if attempts_remaining > 0 => {
            println!("Incorrect password.");
            Ok(1)
        }
        AuthOutcome::Rejected { .. } => {
            println!(
                "Too many failed attempts. Locked out for {} minutes.",
                opt.lockout_minutes
            );
            Ok(1)
        }
        AuthOutcome::Accepted => {
            match settings.apply(action.to_action()) {
                Ok(Applied::NotificationsSaved) => {
                    println!("Email notification settings saved.");
                }
                Ok(Applied::AutobuyerToggled { enabled }) => {
                    println!("Auto-buyer {}.", if enabled { "enabled" } else { "disabled" });
                    if let Some(notifier) = &notifier {
                        notifier.autobuyer_changed(enabled, &ctx.key, Utc::now());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "settings not saved");
                    println!("Failed to save settings.");
                    return Ok(3);
                }
            }
            Ok(0)
        }
    }
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    utils::init_logging(opt.log_file.as_deref(), opt.verbose)?;

    let creds = Credentials::load(&opt.env_file)?;
    if creds.expected_secret().is_none() {
        warn!(env_file = ?opt.env_file, "no settings password configured, every request is accepted");
    }

    match &opt.cmd {
        Command::Attempt {
            ip,
            password,
            user_agent,
            referrer,
            action,
        } => {
            let password = match password {
                Some(p) => p.clone(),
                None => read_password()?,
            };
            let ctx = RequestContext {
                key: ip.clone(),
                user_agent: user_agent.clone(),
                referrer: referrer.clone(),
            };
            let code = run_attempt(&opt, &creds, ctx, password, action)?;
            std::process::exit(code);
        }

        Command::Status { ip } => {
            let gate = build_gate(&opt, &creds)?;
            match gate.standing(ip, Utc::now()) {
                None => println!("{}: no failed attempts", ip),
                Some((record, Standing::Clear)) => println!(
                    "{}: {} failed attempt(s), {} remaining",
                    ip,
                    record.attempts,
                    gate.policy().attempts_remaining(record.attempts)
                ),
                Some((_, Standing::Locked { minutes_remaining })) => {
                    println!("{}: locked out for {} more minute(s)", ip, minutes_remaining)
                }
                Some((_, Standing::Expired)) => {
                    println!("{}: lockout expired, cleared on next attempt", ip)
                }
            }
        }

        Command::Reset { ip } => {
            let gate = build_gate(&opt, &creds)?;
            if gate.reset(ip)? {
                info!(key = %ip, "failed attempts cleared");
                println!("{}: cleared", ip);
            } else {
                println!("{}: no failed attempts", ip);
            }
        }

        Command::TestEmail => {
            let notifier = build_notifier(&opt, &creds)
                .ok_or_else(|| anyhow::anyhow!("EMAIL_FROM and EMAIL_TO must be set in {:?}", opt.env_file))?;
            if notifier.test_message(Utc::now()) {
                println!("Test email sent.");
            } else {
                println!("Test email failed, see logs.");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
