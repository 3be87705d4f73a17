//! Contrôle d'accès au point de réglages : verrouillage par IP, pénalité
//! sur échec et alerte au franchissement du seuil.

use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::ratelimiter::{LockoutPolicy, Standing};
use crate::store::{RateLimitRecord, RateLimitStore};
use crate::utils::safe_log_string;

/// Résultat présenté à l'appelant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Rejected { attempts_remaining: u32 },
    Blocked { minutes_remaining: u64 },
}

/// Identité de l'appelant et métadonnées de la requête
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub key: String,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

#[cfg(test)]
impl RequestContext {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }
}

/// Émis une seule fois par verrouillage
#[derive(Debug, Clone)]
pub struct LockoutEvent {
    pub key: String,
    pub at: DateTime<Utc>,
    pub max_attempts: u32,
    pub lockout_minutes: i64,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

pub trait LockoutObserver {
    /// Ne doit pas échouer : les erreurs restent chez l'observateur
    fn on_lockout(&self, event: &LockoutEvent);
}

enum Decision {
    Accepted,
    Blocked(u64),
    Rejected { before: u32, after: u32 },
}

pub struct AuthGate<'a, S: RateLimitStore> {
    store: S,
    policy: LockoutPolicy,
    expected: Option<SecretString>,
    penalty: Duration,
    observer: Option<&'a dyn LockoutObserver>,
}

impl<'a, S: RateLimitStore> AuthGate<'a, S> {
    /// `expected` absent : aucune authentification configurée, tout est accepté
    pub fn new(store: S, policy: LockoutPolicy, expected: Option<SecretString>) -> Self {
        Self {
            store,
            policy,
            expected,
            penalty: Duration::from_secs(2),
            observer: None,
        }
    }

    pub fn with_penalty(mut self, penalty: Duration) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn LockoutObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    pub fn authenticate(&self, ctx: &RequestContext, submitted: &str) -> AuthOutcome {
        self.authenticate_at(ctx, submitted, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        ctx: &RequestContext,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> AuthOutcome {
        let Some(expected) = &self.expected else {
            info!(key = %ctx.key, "no settings password configured, accepting");
            return AuthOutcome::Accepted;
        };

        let decision = self.store.update(|records| {
            // CHECKING
            if let Some(record) = records.get(&ctx.key) {
                if let Some(minutes_remaining) = self.policy.is_blocked(record, now) {
                    return Decision::Blocked(minutes_remaining);
                }
                if self.policy.standing(record, now) == Standing::Expired {
                    debug!(key = %ctx.key, "lockout expired, resetting record");
                    records.remove(&ctx.key);
                }
            }

            // COMPARING
            if submitted == expected.expose_secret() {
                records.remove(&ctx.key);
                return Decision::Accepted;
            }

            let record = records.entry(ctx.key.clone()).or_insert(RateLimitRecord {
                attempts: 0,
                last_attempt: 0,
            });
            let before = record.attempts;
            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt = now.timestamp();
            Decision::Rejected {
                before,
                after: record.attempts,
            }
        });

        let decision = match decision {
            Ok(decision) => decision,
            Err(e) => {
                // Limiteur en échec ouvert : on décide sans historique
                warn!(key = %ctx.key, error = %e, "rate-limit store unavailable");
                if submitted == expected.expose_secret() {
                    Decision::Accepted
                } else {
                    Decision::Rejected {
                        before: 0,
                        after: 1,
                    }
                }
            }
        };

        match decision {
            Decision::Accepted => {
                info!(key = %ctx.key, "settings password accepted");
                AuthOutcome::Accepted
            }
            Decision::Blocked(minutes_remaining) => {
                info!(key = %ctx.key, minutes_remaining, "request rejected, key is locked out");
                AuthOutcome::Blocked { minutes_remaining }
            }
            Decision::Rejected { before, after } => {
                let attempts_remaining = self.policy.attempts_remaining(after);
                warn!(key = %ctx.key, attempts = after, attempts_remaining, "incorrect settings password");

                if self.policy.crosses_threshold(before, after) {
                    self.raise_lockout(ctx, now);
                }

                if !self.penalty.is_zero() {
                    std::thread::sleep(self.penalty);
                }
                AuthOutcome::Rejected { attempts_remaining }
            }
        }
    }

    fn raise_lockout(&self, ctx: &RequestContext, now: DateTime<Utc>) {
        warn!(
            key = %ctx.key,
            user_agent = %safe_log_string(ctx.user_agent.as_deref().unwrap_or("-")),
            "lockout triggered after {} failed attempts",
            self.policy.max_attempts()
        );

        if let Some(observer) = self.observer {
            observer.on_lockout(&LockoutEvent {
                key: ctx.key.clone(),
                at: now,
                max_attempts: self.policy.max_attempts(),
                lockout_minutes: self.policy.window_minutes(),
                user_agent: ctx.user_agent.clone(),
                referrer: ctx.referrer.clone(),
            });
        }
    }

    /// Situation actuelle d'une clé, sans rien modifier
    pub fn standing(&self, key: &str, now: DateTime<Utc>) -> Option<(RateLimitRecord, Standing)> {
        let records = self.store.load();
        records
            .get(key)
            .map(|record| (*record, self.policy.standing(record, now)))
    }

    /// Efface l'enregistrement d'une clé ; vrai s'il existait
    pub fn reset(&self, key: &str) -> Result<bool, crate::error::StoreError> {
        self.store.update(|records| records.remove(key).is_some())
    }
}
