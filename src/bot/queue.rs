// src/bot/queue.rs - FIFO waiting queue partitioned by the gender sought

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::bot::users::UserDirectory;
use crate::types::{Target, UserId};

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    user: UserId,
    /// Global arrival order, comparable across partitions
    seq: u64,
}

/// Users seeking a partner, partitioned by the gender they are seeking.
///
/// A user appears in at most one partition at any time.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    partitions: HashMap<Target, VecDeque<QueueEntry>>,
    next_seq: u64,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the user everywhere, then append to the `target` partition
    pub fn enqueue(&mut self, user: UserId, target: Target) {
        self.remove(user);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.partitions
            .entry(target)
            .or_default()
            .push_back(QueueEntry { user, seq });
    }

    /// Remove and return the earliest-arrived waiter across `partitions` that satisfies `predicate`
    pub fn dequeue_first_matching<F>(&mut self, partitions: &[Target], mut predicate: F) -> Option<UserId>
    where
        F: FnMut(UserId) -> bool,
    {
        let mut best: Option<(Target, usize, u64)> = None;

        for target in partitions {
            let Some(queue) = self.partitions.get(target) else {
                continue;
            };
            for (index, entry) in queue.iter().enumerate() {
                if !predicate(entry.user) {
                    continue;
                }
                if best.map_or(true, |(_, _, seq)| entry.seq < seq) {
                    best = Some((*target, index, entry.seq));
                }
                // First hit is the oldest in this partition
                break;
            }
        }

        let (target, index, _) = best?;
        self.partitions
            .get_mut(&target)
            .and_then(|queue| queue.remove(index))
            .map(|entry| entry.user)
    }

    /// No-op if the user is not waiting
    pub fn remove(&mut self, user: UserId) -> bool {
        for queue in self.partitions.values_mut() {
            if let Some(index) = queue.iter().position(|e| e.user == user) {
                queue.remove(index);
                return true;
            }
        }
        false
    }

    pub fn target_of(&self, user: UserId) -> Option<Target> {
        self.partitions
            .iter()
            .find(|(_, queue)| queue.iter().any(|e| e.user == user))
            .map(|(target, _)| *target)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.target_of(user).is_some()
    }

    /// Members of one partition in arrival order
    pub fn partition(&self, target: Target) -> Vec<UserId> {
        self.partitions
            .get(&target)
            .map(|queue| queue.iter().map(|e| e.user).collect())
            .unwrap_or_default()
    }

    pub fn waiting_users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.partitions.values().flat_map(|queue| queue.iter().map(|e| e.user))
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waiting users grouped by their own profile gender, not by the partition key
    pub fn counts_by_gender(&self, users: &UserDirectory) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for user in self.waiting_users() {
            let key = users
                .gender_of(user)
                .map_or("unknown", |g| g.as_str())
                .to_string();
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}
