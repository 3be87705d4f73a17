use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};

use crate::store::RateLimitRecord;

/// Situation d'une clé vis-à-vis du verrouillage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    /// Sous le seuil
    Clear,
    /// Verrouillée, minutes restantes arrondies au supérieur
    Locked { minutes_remaining: u64 },
    /// Seuil atteint mais fenêtre écoulée : l'appelant doit effacer l'enregistrement
    Expired,
}

/// Verrouillage après `max_attempts` échecs, pendant `window` à partir du dernier échec.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    max_attempts: u32,
    window: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::new(5, Duration::minutes(15))
    }
}

impl LockoutPolicy {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
        }
    }

    /// Fenêtre donnée en minutes, refusée si nulle ou hors des bornes de `chrono`
    pub fn with_minutes(max_attempts: u32, minutes: u32) -> Result<Self> {
        if minutes == 0 {
            return Err(anyhow!("lockout length must be at least one minute"));
        }
        let window = Duration::try_minutes(i64::from(minutes))
            .ok_or_else(|| anyhow!("lockout length of {} minutes is out of range", minutes))?;
        Ok(Self::new(max_attempts, window))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn window_minutes(&self) -> i64 {
        self.window.num_minutes()
    }

    pub fn standing(&self, record: &RateLimitRecord, now: DateTime<Utc>) -> Standing {
        if record.attempts < self.max_attempts {
            return Standing::Clear;
        }

        let lockout_until = record.last_attempt.saturating_add(self.window.num_seconds());
        let now = now.timestamp();
        if now < lockout_until {
            let secs = (lockout_until - now) as u64;
            Standing::Locked {
                minutes_remaining: secs.div_ceil(60),
            }
        } else {
            Standing::Expired
        }
    }

    /// Minutes restantes si la clé est verrouillée
    pub fn is_blocked(&self, record: &RateLimitRecord, now: DateTime<Utc>) -> Option<u64> {
        match self.standing(record, now) {
            Standing::Locked { minutes_remaining } => Some(minutes_remaining),
            Standing::Clear | Standing::Expired => None,
        }
    }

    pub fn attempts_remaining(&self, attempts: u32) -> u32 {
        self.max_attempts.saturating_sub(attempts)
    }

    /// Vrai seulement au passage de `< max_attempts` à `>= max_attempts`
    pub fn crosses_threshold(&self, before: u32, after: u32) -> bool {
        before < self.max_attempts && after >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(attempts: u32, last_attempt: i64) -> RateLimitRecord {
        RateLimitRecord {
            attempts,
            last_attempt,
        }
    }

    #[test]
    fn below_threshold_is_never_blocked() {
        let policy = LockoutPolicy::default();
        for attempts in 0..5 {
            assert_eq!(policy.is_blocked(&record(attempts, 1000), at(1000)), None);
            assert_eq!(policy.standing(&record(attempts, 1000), at(1000)), Standing::Clear);
        }
    }

    #[test]
    fn at_threshold_blocks_for_full_window() {
        let policy = LockoutPolicy::default();
        assert_eq!(policy.is_blocked(&record(5, 1000), at(1000)), Some(15));
    }

    #[test]
    fn remaining_minutes_round_up_and_decrease() {
        let policy = LockoutPolicy::default();
        let rec = record(5, 0);
        assert_eq!(policy.is_blocked(&rec, at(1)), Some(15));
        assert_eq!(policy.is_blocked(&rec, at(60)), Some(14));
        assert_eq!(policy.is_blocked(&rec, at(61)), Some(14));
        assert_eq!(policy.is_blocked(&rec, at(841)), Some(1));
    }

    #[test]
    fn expiry_boundary() {
        let policy = LockoutPolicy::default();
        let rec = record(5, 0);
        assert_eq!(policy.is_blocked(&rec, at(899)), Some(1));
        assert_eq!(policy.standing(&rec, at(900)), Standing::Expired);
        assert_eq!(policy.is_blocked(&rec, at(900)), None);
        assert_eq!(policy.standing(&rec, at(5000)), Standing::Expired);
    }

    #[test]
    fn above_threshold_still_locked() {
        let policy = LockoutPolicy::new(3, Duration::minutes(1));
        assert_eq!(policy.is_blocked(&record(9, 100), at(130)), Some(1));
    }

    #[test]
    fn threshold_crossing_is_detected_once() {
        let policy = LockoutPolicy::default();
        assert!(!policy.crosses_threshold(3, 4));
        assert!(policy.crosses_threshold(4, 5));
        assert!(policy.crosses_threshold(2, 7));
        assert!(!policy.crosses_threshold(5, 6));
    }

    #[test]
    fn lockout_length_from_minutes() {
        assert!(LockoutPolicy::with_minutes(5, 0).is_err());

        let policy = LockoutPolicy::with_minutes(5, 15).unwrap();
        assert_eq!(policy.window_minutes(), 15);
        assert_eq!(policy.is_blocked(&record(5, 0), at(1)), Some(15));

        let policy = LockoutPolicy::with_minutes(5, u32::MAX).unwrap();
        assert_eq!(policy.window_minutes(), i64::from(u32::MAX));
        assert_eq!(
            policy.is_blocked(&record(5, 1000), at(1000)),
            Some(u64::from(u32::MAX))
        );
    }

    #[test]
    fn attempts_remaining_saturates() {
        let policy = LockoutPolicy::default();
        assert_eq!(policy.attempts_remaining(1), 4);
        assert_eq!(policy.attempts_remaining(5), 0);
        assert_eq!(policy.attempts_remaining(9), 0);
    }
}
