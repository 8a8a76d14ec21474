// src/bot/pairing.rs - Mutual double-blind matching and the active-chat relation

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;

use crate::bot::queue::WaitingQueue;
use crate::bot::users::UserDirectory;
use crate::types::{MatchOutcome, SessionError, SessionResult, Target, UserId, UserState};

/// Owns the waiting queue and the symmetric active-chat relation.
///
/// Every method must be called with the session lock held; `try_match_or_enqueue`
/// reads the queue and then mutates it, which is only safe as one critical section.
#[derive(Debug, Default)]
pub struct PairingEngine {
    queue: WaitingQueue,
    chats: HashMap<UserId, UserId>,
}

impl PairingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) -> &WaitingQueue {
        &self.queue
    }

    pub fn state_of(&self, user: UserId) -> UserState {
        if let Some(partner) = self.chats.get(&user) {
            UserState::Paired(*partner)
        } else if let Some(target) = self.queue.target_of(user) {
            UserState::Waiting(target)
        } else {
            UserState::Idle
        }
    }

    pub fn partner_of(&self, user: UserId) -> Option<UserId> {
        self.chats.get(&user).copied()
    }

    pub fn is_paired(&self, user: UserId) -> bool {
        self.chats.contains_key(&user)
    }

    pub fn is_waiting(&self, user: UserId) -> bool {
        self.queue.contains(user)
    }

    pub fn active_chats(&self) -> usize {
        self.chats.len() / 2
    }

    pub fn paired_users(&self) -> usize {
        self.chats.len()
    }

    pub fn paired_user_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.chats.keys().copied()
    }

    /// Pair `seeker` with the oldest compatible waiter, or queue the seeker under `target`.
    ///
    /// A waiter W is compatible when W is waiting for someone like the seeker (W sits in the
    /// partition for the seeker's gender, or in `Anyone`) and W's own gender satisfies `target`.
    pub fn try_match_or_enqueue(
        &mut self,
        users: &mut UserDirectory,
        seeker: UserId,
        target: Target,
        now: DateTime<Utc>,
    ) -> SessionResult<MatchOutcome> {
        if users.is_banned(seeker) {
            return Err(SessionError::Banned);
        }
        if self.chats.contains_key(&seeker) {
            return Err(SessionError::AlreadyPaired);
        }

        let seeker_gender = users.gender_of(seeker);
        if target != Target::Anyone && seeker_gender.is_none() {
            return Err(SessionError::GenderNotSet);
        }
        if self.queue.target_of(seeker) == Some(target) {
            return Err(SessionError::AlreadyWaiting);
        }

        // Re-request with a different target: cancel first, then search again
        self.queue.remove(seeker);

        let partitions: Vec<Target> = match seeker_gender {
            Some(gender) => vec![Target::Gender(gender), Target::Anyone],
            None => vec![Target::Anyone],
        };

        let found = {
            let users: &UserDirectory = users;
            self.queue.dequeue_first_matching(&partitions, |candidate| {
                candidate != seeker && !users.is_banned(candidate) && target.accepts(users.gender_of(candidate))
            })
        };

        match found {
            Some(partner) => {
                self.link(users, seeker, partner);
                info!("Paired {} with {} ({})", seeker, partner, target);
                Ok(MatchOutcome::Paired {
                    partner,
                    partner_gender: users.gender_of(partner),
                })
            }
            None => {
                self.queue.enqueue(seeker, target);
                if let Some(profile) = users.get_mut(seeker) {
                    profile.waiting_since = Some(now);
                }
                debug!("User {} waiting in {}", seeker, target);
                Ok(MatchOutcome::Waiting { target })
            }
        }
    }

    fn link(&mut self, users: &mut UserDirectory, a: UserId, b: UserId) {
        self.queue.remove(a);
        self.queue.remove(b);
        self.chats.insert(a, b);
        self.chats.insert(b, a);

        for (user, partner) in [(a, b), (b, a)] {
            if let Some(profile) = users.get_mut(user) {
                profile.partner = Some(partner);
                profile.waiting_since = None;
            }
        }
    }

    /// Dissolve the user's chat. `None` when the user was not paired.
    pub fn end_chat(&mut self, users: &mut UserDirectory, user: UserId) -> Option<UserId> {
        let partner = self.chats.remove(&user)?;
        self.chats.remove(&partner);

        for id in [user, partner] {
            if let Some(profile) = users.get_mut(id) {
                profile.partner = None;
            }
        }

        info!("Chat between {} and {} ended", user, partner);
        Some(partner)
    }

    /// Best-effort removal from the queue
    pub fn cancel(&mut self, users: &mut UserDirectory, user: UserId) -> bool {
        let removed = self.queue.remove(user);
        if removed {
            if let Some(profile) = users.get_mut(user) {
                profile.waiting_since = None;
            }
        }
        removed
    }

    /// Cancel only if the user is still in the same waiting episode that started at `since`
    pub fn expire(&mut self, users: &mut UserDirectory, user: UserId, since: DateTime<Utc>) -> bool {
        let same_episode = users
            .get(user)
            .map_or(false, |p| p.waiting_since == Some(since));
        same_episode && self.cancel(users, user)
    }

    /// Re-create a pair loaded from persisted profiles
    pub(crate) fn restore_pair(&mut self, users: &mut UserDirectory, a: UserId, b: UserId) {
        self.link(users, a, b);
    }

    /// Check the relation/queue/profile invariants, describing the first violation found
    pub fn verify(&self, users: &UserDirectory) -> Result<(), String> {
        for (user, partner) in &self.chats {
            if user == partner {
                return Err(format!("{} is paired with itself", user));
            }
            if self.chats.get(partner) != Some(user) {
                return Err(format!("relation is not symmetric for {} -> {}", user, partner));
            }
            if self.queue.contains(*user) {
                return Err(format!("{} is both waiting and paired", user));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for user in self.queue.waiting_users() {
            if !seen.insert(user) {
                return Err(format!("{} appears twice in the queue", user));
            }
        }

        for profile in users.iter() {
            if profile.partner != self.chats.get(&profile.id).copied() {
                return Err(format!("profile partner of {} disagrees with relation", profile.id));
            }
            if profile.waiting_since.is_some() != self.queue.contains(profile.id) {
                return Err(format!("waiting_since of {} disagrees with queue", profile.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Gender;

    const SEEK_MALE: Target = Target::Gender(Gender::Male);
    const SEEK_FEMALE: Target = Target::Gender(Gender::Female);

    fn directory(members: &[(i64, Option<Gender>)]) -> UserDirectory {
        let mut users = UserDirectory::new(UserId(0));
        let now = Utc::now();
        for (id, gender) in members {
            users.touch(UserId(*id), now);
            if let Some(g) = gender {
                users.set_gender(UserId(*id), *g, now);
            }
        }
        users
    }

    #[test]
    fn test_mutual_match_scenario() {
        // A (male) wants a woman, B (female) wants a man
        let mut users = directory(&[(1, Some(Gender::Male)), (2, Some(Gender::Female))]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        let a = engine.try_match_or_enqueue(&mut users, UserId(1), SEEK_FEMALE, now).unwrap();
        assert_eq!(a, MatchOutcome::Waiting { target: SEEK_FEMALE });
        assert_eq!(engine.queue().partition(SEEK_FEMALE), vec![UserId(1)]);

        let b = engine.try_match_or_enqueue(&mut users, UserId(2), SEEK_MALE, now).unwrap();
        assert_eq!(
            b,
            MatchOutcome::Paired { partner: UserId(1), partner_gender: Some(Gender::Male) }
        );
        assert_eq!(engine.partner_of(UserId(1)), Some(UserId(2)));
        assert_eq!(engine.partner_of(UserId(2)), Some(UserId(1)));
        assert!(engine.queue().is_empty());
        engine.verify(&users).unwrap();
    }

    #[test]
    fn test_one_sided_match_is_rejected() {
        // A (male) wants a woman; C (male) wants a woman too. C must not be paired with A.
        let mut users = directory(&[(1, Some(Gender::Male)), (3, Some(Gender::Male))]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        engine.try_match_or_enqueue(&mut users, UserId(1), SEEK_FEMALE, now).unwrap();
        let c = engine.try_match_or_enqueue(&mut users, UserId(3), SEEK_FEMALE, now).unwrap();

        assert_eq!(c, MatchOutcome::Waiting { target: SEEK_FEMALE });
        assert_eq!(engine.queue().len(), 2);
        engine.verify(&users).unwrap();
    }

    #[test]
    fn test_fifo_fairness() {
        let mut users = directory(&[
            (1, Some(Gender::Female)),
            (2, Some(Gender::Female)),
            (3, Some(Gender::Male)),
        ]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        engine.try_match_or_enqueue(&mut users, UserId(1), SEEK_MALE, now).unwrap();
        engine.try_match_or_enqueue(&mut users, UserId(2), SEEK_MALE, now).unwrap();

        let outcome = engine.try_match_or_enqueue(&mut users, UserId(3), SEEK_FEMALE, now).unwrap();
        assert!(matches!(outcome, MatchOutcome::Paired { partner: UserId(1), .. }));
        assert_eq!(engine.queue().partition(SEEK_MALE), vec![UserId(2)]);
    }

    #[test]
    fn test_anyone_partition_matches_both_ways() {
        let mut users = directory(&[(1, None), (2, Some(Gender::NonBinary))]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, now).unwrap();
        let outcome = engine.try_match_or_enqueue(&mut users, UserId(2), Target::Anyone, now).unwrap();
        assert_eq!(outcome, MatchOutcome::Paired { partner: UserId(1), partner_gender: None });
    }

    #[test]
    fn test_targeted_seeker_does_not_match_unset_gender() {
        let mut users = directory(&[(1, None), (2, Some(Gender::Male))]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, now).unwrap();
        let outcome = engine.try_match_or_enqueue(&mut users, UserId(2), SEEK_FEMALE, now).unwrap();
        assert_eq!(outcome, MatchOutcome::Waiting { target: SEEK_FEMALE });
    }

    #[test]
    fn test_preconditions() {
        let mut users = directory(&[(1, None), (2, None), (3, Some(Gender::Male))]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        assert_eq!(
            engine.try_match_or_enqueue(&mut users, UserId(1), SEEK_MALE, now),
            Err(SessionError::GenderNotSet)
        );

        engine.try_match_or_enqueue(&mut users, UserId(3), SEEK_FEMALE, now).unwrap();
        assert_eq!(
            engine.try_match_or_enqueue(&mut users, UserId(3), SEEK_FEMALE, now),
            Err(SessionError::AlreadyWaiting)
        );

        // A different target re-queues instead of failing
        let outcome = engine.try_match_or_enqueue(&mut users, UserId(3), Target::Anyone, now).unwrap();
        assert_eq!(outcome, MatchOutcome::Waiting { target: Target::Anyone });
        assert_eq!(engine.queue().len(), 1);

        engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, now).unwrap();
        assert_eq!(
            engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, now),
            Err(SessionError::AlreadyPaired)
        );

        users.ban(UserId(2), now);
        assert_eq!(
            engine.try_match_or_enqueue(&mut users, UserId(2), Target::Anyone, now),
            Err(SessionError::Banned)
        );
        engine.verify(&users).unwrap();
    }

    #[test]
    fn test_end_chat_and_cancel() {
        let mut users = directory(&[(1, None), (2, None), (3, None)]);
        let mut engine = PairingEngine::new();
        let now = Utc::now();

        engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, now).unwrap();
        engine.try_match_or_enqueue(&mut users, UserId(2), Target::Anyone, now).unwrap();

        assert_eq!(engine.end_chat(&mut users, UserId(2)), Some(UserId(1)));
        assert_eq!(engine.end_chat(&mut users, UserId(2)), None);
        assert_eq!(engine.end_chat(&mut users, UserId(1)), None);
        assert_eq!(users.get(UserId(1)).unwrap().partner, None);

        engine.try_match_or_enqueue(&mut users, UserId(3), Target::Anyone, now).unwrap();
        assert!(engine.cancel(&mut users, UserId(3)));
        assert!(!engine.cancel(&mut users, UserId(3)));
        assert_eq!(engine.state_of(UserId(3)), UserState::Idle);
        engine.verify(&users).unwrap();
    }

    #[test]
    fn test_expire_only_matches_same_episode() {
        let mut users = directory(&[(1, None)]);
        let mut engine = PairingEngine::new();
        let first = Utc::now();
        let second = first + chrono::Duration::seconds(30);

        engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, first).unwrap();
        engine.cancel(&mut users, UserId(1));
        engine.try_match_or_enqueue(&mut users, UserId(1), Target::Anyone, second).unwrap();

        assert!(!engine.expire(&mut users, UserId(1), first));
        assert!(engine.is_waiting(UserId(1)));
        assert!(engine.expire(&mut users, UserId(1), second));
        assert!(!engine.is_waiting(UserId(1)));
    }
}
