// src/bot/spam.rs - Per-user relay rate limiting

use chrono::{DateTime, Duration, Utc};
use log::warn;
use std::collections::HashMap;

use crate::config::SpamConfig;
use crate::types::{SessionError, SessionResult, UserId};

#[derive(Debug, Clone)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

/// Fixed-window relay counter per user
pub struct SpamGuard {
    config: SpamConfig,
    windows: HashMap<UserId, Window>,
}

impl SpamGuard {
    pub fn new(config: SpamConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Count one relay attempt. Exceeding the limit starts a cooldown and resets the window.
    pub fn check(&mut self, user: UserId, now: DateTime<Utc>) -> SessionResult<()> {
        let window_len = Duration::seconds(self.config.window_seconds as i64);
        let window = self.windows.entry(user).or_insert(Window {
            started_at: now,
            count: 0,
            cooldown_until: None,
        });

        if let Some(until) = window.cooldown_until {
            if now < until {
                let remaining = (until - now).num_milliseconds();
                return Err(SessionError::RateLimited {
                    retry_after_secs: ((remaining + 999) / 1000).max(1) as u64,
                });
            }
            window.cooldown_until = None;
        }

        if now - window.started_at > window_len {
            window.started_at = now;
            window.count = 1;
            return Ok(());
        }

        window.count += 1;
        if window.count > self.config.message_limit {
            window.count = 0;
            window.started_at = now;
            window.cooldown_until = Some(now + Duration::seconds(self.config.cooldown_seconds as i64));
            warn!("User {} exceeded {} relays per window", user, self.config.message_limit);
            return Err(SessionError::RateLimited {
                retry_after_secs: self.config.cooldown_seconds,
            });
        }
        Ok(())
    }

    /// Forget a user entirely, cooldown included
    pub fn reset(&mut self, user: UserId) {
        self.windows.remove(&user);
    }

    /// Drop a user's window once their chat is over, unless they are cooling down.
    /// Stale windows of other users are pruned at the same time.
    pub fn release(&mut self, user: UserId, now: DateTime<Utc>) {
        let window_len = Duration::seconds(self.config.window_seconds as i64);
        self.windows.retain(|id, window| {
            let cooling = window.cooldown_until.map_or(false, |until| now < until);
            if *id == user {
                return cooling;
            }
            cooling || now - window.started_at <= window_len
        });
    }

    #[cfg(test)]
    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SpamGuard {
        SpamGuard::new(SpamConfig {
            message_limit: 3,
            window_seconds: 60,
            cooldown_seconds: 20,
        })
    }

    #[test]
    fn test_limit_triggers_cooldown() {
        let mut guard = guard();
        let user = UserId(1);
        let t0 = Utc::now();

        for _ in 0..3 {
            assert!(guard.check(user, t0).is_ok());
        }
        assert_eq!(
            guard.check(user, t0),
            Err(SessionError::RateLimited { retry_after_secs: 20 })
        );
        assert_eq!(
            guard.check(user, t0 + Duration::seconds(15)),
            Err(SessionError::RateLimited { retry_after_secs: 5 })
        );

        // Cooldown over: a fresh allowance
        let later = t0 + Duration::seconds(21);
        for _ in 0..3 {
            assert!(guard.check(user, later).is_ok());
        }
        assert!(guard.check(user, later).is_err());
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let mut guard = guard();
        let user = UserId(2);
        let t0 = Utc::now();

        for _ in 0..3 {
            guard.check(user, t0).unwrap();
        }
        assert!(guard.check(user, t0 + Duration::seconds(61)).is_ok());
        assert!(guard.check(user, t0 + Duration::seconds(62)).is_ok());
    }

    #[test]
    fn test_users_are_independent() {
        let mut guard = guard();
        let t0 = Utc::now();

        for _ in 0..4 {
            let _ = guard.check(UserId(3), t0);
        }
        assert!(guard.check(UserId(4), t0).is_ok());

        guard.reset(UserId(3));
        assert!(guard.check(UserId(3), t0).is_ok());
    }

    #[test]
    fn test_release_keeps_cooldown_and_prunes_stale_windows() {
        let mut guard = guard();
        let t0 = Utc::now();

        for _ in 0..4 {
            let _ = guard.check(UserId(5), t0);
        }
        guard.check(UserId(6), t0).unwrap();
        assert_eq!(guard.tracked_users(), 2);

        // Ending a chat does not lift a cooldown
        guard.release(UserId(5), t0 + Duration::seconds(1));
        assert_eq!(guard.tracked_users(), 2);
        assert!(guard.check(UserId(5), t0 + Duration::seconds(2)).is_err());

        guard.release(UserId(6), t0 + Duration::seconds(10));
        assert_eq!(guard.tracked_users(), 1);

        // Cooldown and window both over: pruned by anyone's release
        guard.release(UserId(8), t0 + Duration::seconds(90));
        assert_eq!(guard.tracked_users(), 0);
    }
}
