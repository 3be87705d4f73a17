//! Alertes de sécurité par courriel, au mieux : un échec d'envoi est journalisé
//! puis oublié.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::gate::{LockoutEvent, LockoutObserver};
use crate::smtp::{EmailMessage, Mailer};
use crate::utils::html_escape;

pub struct SecurityNotifier<M: Mailer> {
    mailer: M,
    from: String,
    to: String,
}

impl<M: Mailer> SecurityNotifier<M> {
    pub fn new(mailer: M, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            mailer,
            from: from.into(),
            to: to.into(),
        }
    }

    fn deliver(&self, subject: String, html_body: String) -> bool {
        let message = EmailMessage {
            from: self.from.clone(),
            to: self.to.clone(),
            subject,
            html_body,
        };
        match self.mailer.send(&message) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, subject = %message.subject, "notification dropped");
                false
            }
        }
    }

    pub fn lockout_message(&self, event: &LockoutEvent) -> (String, String) {
        let subject = "Security Alert: Settings Login Blocked".to_string();
        let body = format!(
            "<html>\n\
<body style='font-family: Arial, sans-serif; background: #f5f5f5; padding: 20px;'>\n\
<div style='max-width: 500px; margin: 0 auto; background: white; border-radius: 8px; padding: 24px;'>\n\
<h2 style='margin: 0 0 16px; color: #f44336;'>Security Alert</h2>\n\
<p style='margin: 0 0 16px; color: #666;'>Someone has been <strong style='color: #f44336;'>blocked</strong> from the parking settings page after {attempts} failed login attempts.</p>\n\
<table style='width: 100%; font-size: 12px; color: #666; border-collapse: collapse;'>\n\
<tr><td style='padding: 4px 0; color: #999;'>IP Address:</td><td style='padding: 4px 0;'>{ip}</td></tr>\n\
<tr><td style='padding: 4px 0; color: #999;'>Time:</td><td style='padding: 4px 0;'>{time}</td></tr>\n\
<tr><td style='padding: 4px 0; color: #999;'>Lockout:</td><td style='padding: 4px 0;'>{minutes} minutes</td></tr>\n\
<tr><td style='padding: 4px 0; color: #999;'>Referrer:</td><td style='padding: 4px 0;'>{referrer}</td></tr>\n\
<tr><td style='padding: 4px 0; color: #999; vertical-align: top;'>User Agent:</td><td style='padding: 4px 0; word-break: break-all;'>{user_agent}</td></tr>\n\
</table>\n\
</div>\n\
</body>\n\
</html>",
            attempts = event.max_attempts,
            ip = html_escape(&event.key),
            time = display_time(event.at),
            minutes = event.lockout_minutes,
            referrer = html_escape(event.referrer.as_deref().unwrap_or("Direct")),
            user_agent = html_escape(event.user_agent.as_deref().unwrap_or("Unknown")),
        );
        (subject, body)
    }

    /// Avis de changement d'état de l'achat automatique
    pub fn autobuyer_changed(&self, enabled: bool, source: &str, at: DateTime<Utc>) -> bool {
        let (state, color) = if enabled {
            ("ENABLED", "#4caf50")
        } else {
            ("DISABLED", "#f44336")
        };
        let subject = format!("Parking Auto-buyer {}", state);
        let body = format!(
            "<html>\n\
<body style='font-family: Arial, sans-serif; background: #f5f5f5; padding: 20px;'>\n\
<div style='max-width: 400px; margin: 0 auto; background: white; border-radius: 8px; padding: 24px;'>\n\
<h2 style='margin: 0 0 16px; color: #333;'>Auto-buyer Setting Changed</h2>\n\
<p style='margin: 0 0 16px; color: #666;'>The parking permit auto-buyer has been <strong style='color: {color};'>{state}</strong>.</p>\n\
<p style='margin: 0; font-size: 12px; color: #999;'>Changed at: {time}<br>From: {source}</p>\n\
</div>\n\
</body>\n\
</html>",
            time = display_time(at),
            source = html_escape(source),
        );
        self.deliver(subject, body)
    }

    pub fn test_message(&self, at: DateTime<Utc>) -> bool {
        self.deliver(
            "Settings guard test".to_string(),
            format!(
                "<html><body><p>Test message sent at {}.</p></body></html>",
                display_time(at)
            ),
        )
    }
}

impl<M: Mailer> LockoutObserver for SecurityNotifier<M> {
    fn on_lockout(&self, event: &LockoutEvent) {
        let (subject, body) = self.lockout_message(event);
        if self.deliver(subject, body) {
            info!(key = %event.key, "lockout alert sent");
        }
    }
}

fn display_time(at: DateTime<Utc>) -> String {
    at.format("%b %-d, %Y %-I:%M:%S %p UTC").to_string()
}
