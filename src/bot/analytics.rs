// src/bot/analytics.rs - Usage counters, the concurrency watermark and derived statistics

use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bot::pairing::PairingEngine;
use crate::bot::users::UserDirectory;
use crate::types::ContentKind;

/// Persisted aggregate counters (`stats.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsCounters {
    pub total_users: u64,
    pub total_chats: u64,
    pub messages_sent: u64,
    #[serde(default)]
    pub content_types: BTreeMap<ContentKind, u64>,
    /// Highest waiting + paired user count observed
    pub peak_concurrent_users: u64,
    pub peak_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
}

impl StatsCounters {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_users: 0,
            total_chats: 0,
            messages_sent: 0,
            content_types: BTreeMap::new(),
            peak_concurrent_users: 0,
            peak_time: None,
            start_time: now,
        }
    }
}

/// Point-in-time view of counters plus values derived from live state
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_users: u64,
    pub total_chats: u64,
    pub messages_sent: u64,
    pub content_types: BTreeMap<ContentKind, u64>,
    pub peak_concurrent_users: u64,
    pub peak_time: Option<DateTime<Utc>>,
    pub active_chats: usize,
    pub waiting_users: usize,
    pub waiting_by_gender: BTreeMap<String, usize>,
    pub active_by_gender: BTreeMap<String, usize>,
    pub gender_distribution: BTreeMap<String, usize>,
    pub banned_users: usize,
    pub daily_active_users: usize,
    pub uptime_seconds: i64,
}

pub struct StatsAggregator {
    counters: StatsCounters,
}

impl StatsAggregator {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            counters: StatsCounters::new(now),
        }
    }

    /// Resume persisted counters; uptime restarts with the process
    pub fn from_counters(mut counters: StatsCounters, now: DateTime<Utc>) -> Self {
        counters.start_time = now;
        info!(
            "Restored stats: {} users, {} chats, {} messages",
            counters.total_users, counters.total_chats, counters.messages_sent
        );
        Self { counters }
    }

    pub fn counters(&self) -> &StatsCounters {
        &self.counters
    }

    pub fn record_new_user(&mut self) {
        self.counters.total_users += 1;
    }

    pub fn record_chat_started(&mut self) {
        self.counters.total_chats += 1;
    }

    pub fn record_message(&mut self, kind: ContentKind) {
        self.counters.messages_sent += 1;
        *self.counters.content_types.entry(kind).or_insert(0) += 1;
    }

    /// Raise the watermark if the current load exceeds it. Returns true on a new peak.
    pub fn observe_concurrency(&mut self, waiting: usize, paired: usize, now: DateTime<Utc>) -> bool {
        let current = (waiting + paired) as u64;
        if current > self.counters.peak_concurrent_users {
            self.counters.peak_concurrent_users = current;
            self.counters.peak_time = Some(now);
            true
        } else {
            false
        }
    }

    /// Recomputes distributions by walking every profile
    pub fn snapshot(&self, users: &UserDirectory, pairing: &PairingEngine, now: DateTime<Utc>) -> StatsSnapshot {
        let day_ago = now - Duration::hours(24);

        let mut gender_distribution = BTreeMap::new();
        let mut daily_active_users = 0;
        let mut banned_users = 0;
        for profile in users.iter() {
            let key = profile.gender.map_or("unknown", |g| g.as_str()).to_string();
            *gender_distribution.entry(key).or_insert(0) += 1;
            if profile.last_active_at >= day_ago {
                daily_active_users += 1;
            }
            if profile.banned {
                banned_users += 1;
            }
        }

        let mut active_by_gender = BTreeMap::new();
        for user in pairing.paired_user_ids() {
            let key = users.gender_of(user).map_or("unknown", |g| g.as_str()).to_string();
            *active_by_gender.entry(key).or_insert(0) += 1;
        }

        StatsSnapshot {
            total_users: self.counters.total_users,
            total_chats: self.counters.total_chats,
            messages_sent: self.counters.messages_sent,
            content_types: self.counters.content_types.clone(),
            peak_concurrent_users: self.counters.peak_concurrent_users,
            peak_time: self.counters.peak_time,
            active_chats: pairing.active_chats(),
            waiting_users: pairing.queue().len(),
            waiting_by_gender: pairing.queue().counts_by_gender(users),
            active_by_gender,
            gender_distribution,
            banned_users,
            daily_active_users,
            uptime_seconds: (now - self.counters.start_time).num_seconds(),
        }
    }
}
