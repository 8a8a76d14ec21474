// src/bot/users.rs - User profiles and pending prompts

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Gender, PendingInput, Role, Target, UserId};

/// Per-user profile record. Never deleted; `banned` is the only way to retire a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub banned: bool,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Set iff the user is in the active-chat relation
    #[serde(default)]
    pub partner: Option<UserId>,
    /// Set iff the user sits in exactly one waiting-queue partition
    #[serde(default)]
    pub waiting_since: Option<DateTime<Utc>>,
    /// What the user searched for last; `/next` without arguments reuses it
    #[serde(default)]
    pub last_target: Option<Target>,
}

impl UserProfile {
    pub fn new(id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            gender: None,
            role: Role::User,
            banned: false,
            joined_at: now,
            last_active_at: now,
            partner: None,
            waiting_since: None,
            last_target: None,
        }
    }
}

/// Owns every profile plus the pending-input side table
pub struct UserDirectory {
    profiles: HashMap<UserId, UserProfile>,
    pending: HashMap<UserId, PendingInput>,
    super_admin: UserId,
}

impl UserDirectory {
    pub fn new(super_admin: UserId) -> Self {
        Self::from_profiles(super_admin, HashMap::new())
    }

    pub fn from_profiles(super_admin: UserId, profiles: HashMap<UserId, UserProfile>) -> Self {
        Self {
            profiles,
            pending: HashMap::new(),
            super_admin,
        }
    }

    /// Returns the profile, creating a default one if absent. The flag tells whether it was created.
    pub fn get_or_create(&mut self, id: UserId, now: DateTime<Utc>) -> (&mut UserProfile, bool) {
        let mut created = false;
        let profile = self.profiles.entry(id).or_insert_with(|| {
            created = true;
            UserProfile::new(id, now)
        });
        if created {
            info!("New user registered: {}", id);
        }
        (profile, created)
    }

    /// Record activity. Returns true when this is the first time the user is seen.
    pub fn touch(&mut self, id: UserId, now: DateTime<Utc>) -> bool {
        let (profile, created) = self.get_or_create(id, now);
        profile.last_active_at = now;
        created
    }

    /// Returns the previous gender and whether the profile was created
    pub fn set_gender(&mut self, id: UserId, gender: Gender, now: DateTime<Utc>) -> (Option<Gender>, bool) {
        let (profile, created) = self.get_or_create(id, now);
        let previous = profile.gender.replace(gender);
        debug!("User {} gender {:?} -> {}", id, previous, gender);
        (previous, created)
    }

    pub fn set_role(&mut self, id: UserId, role: Role, now: DateTime<Utc>) -> bool {
        let (profile, created) = self.get_or_create(id, now);
        profile.role = role;
        created
    }

    /// Fails for the super-admin or an already banned user. Unknown users get a bare profile.
    pub fn ban(&mut self, id: UserId, now: DateTime<Utc>) -> bool {
        if self.is_super_admin(id) {
            return false;
        }
        let (profile, _) = self.get_or_create(id, now);
        if profile.banned {
            return false;
        }
        profile.banned = true;
        self.pending.remove(&id);
        true
    }

    pub fn unban(&mut self, id: UserId) -> bool {
        match self.profiles.get_mut(&id) {
            Some(profile) if profile.banned => {
                profile.banned = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_admin(&self, id: UserId) -> bool {
        self.is_super_admin(id)
            || self.profiles.get(&id).map_or(false, |p| p.role == Role::Admin)
    }

    pub fn is_super_admin(&self, id: UserId) -> bool {
        id == self.super_admin
    }

    pub fn super_admin(&self) -> UserId {
        self.super_admin
    }

    pub fn is_banned(&self, id: UserId) -> bool {
        self.profiles.get(&id).map_or(false, |p| p.banned)
    }

    pub fn gender_of(&self, id: UserId) -> Option<Gender> {
        self.profiles.get(&id).and_then(|p| p.gender)
    }

    pub fn get(&self, id: UserId) -> Option<&UserProfile> {
        self.profiles.get(&id)
    }

    pub fn get_mut(&mut self, id: UserId) -> Option<&mut UserProfile> {
        self.profiles.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &HashMap<UserId, UserProfile> {
        &self.profiles
    }

    pub fn set_pending(&mut self, id: UserId, input: PendingInput) {
        self.pending.insert(id, input);
    }

    /// Consume the pending prompt, if any
    pub fn take_pending(&mut self, id: UserId) -> Option<PendingInput> {
        self.pending.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: UserId = UserId(1);

    #[test]
    fn test_touch_creates_once() {
        let mut users = UserDirectory::new(ROOT);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);

        assert!(users.touch(UserId(10), t0));
        assert!(!users.touch(UserId(10), t1));
        assert_eq!(users.len(), 1);

        let profile = users.get(UserId(10)).unwrap();
        assert_eq!(profile.joined_at, t0);
        assert_eq!(profile.last_active_at, t1);
        assert_eq!(profile.role, Role::User);
    }

    #[test]
    fn test_ban_rules() {
        let mut users = UserDirectory::new(ROOT);
        let now = Utc::now();

        assert!(!users.ban(ROOT, now), "super admin cannot be banned");
        assert!(users.ban(UserId(5), now), "unknown users get a bare banned profile");
        assert!(!users.ban(UserId(5), now), "already banned");
        assert!(users.is_banned(UserId(5)));

        assert!(users.unban(UserId(5)));
        assert!(!users.unban(UserId(5)), "already unbanned");
        assert!(!users.unban(UserId(99)), "unknown user");
    }

    #[test]
    fn test_admin_predicates() {
        let mut users = UserDirectory::new(ROOT);
        let now = Utc::now();

        assert!(users.is_admin(ROOT));
        assert!(users.is_super_admin(ROOT));
        assert!(!users.is_admin(UserId(2)));

        users.set_role(UserId(2), Role::Admin, now);
        assert!(users.is_admin(UserId(2)));
        assert!(!users.is_super_admin(UserId(2)));
    }

    #[test]
    fn test_pending_input_is_consumed() {
        let mut users = UserDirectory::new(ROOT);
        users.set_pending(UserId(3), PendingInput::ReportReason);

        assert_eq!(users.take_pending(UserId(3)), Some(PendingInput::ReportReason));
        assert_eq!(users.take_pending(UserId(3)), None);
    }

    #[test]
    fn test_set_gender_returns_previous() {
        let mut users = UserDirectory::new(ROOT);
        let now = Utc::now();

        let (previous, created) = users.set_gender(UserId(4), Gender::Male, now);
        assert_eq!(previous, None);
        assert!(created);

        let (previous, created) = users.set_gender(UserId(4), Gender::NonBinary, now);
        assert_eq!(previous, Some(Gender::Male));
        assert!(!created);
        assert_eq!(users.gender_of(UserId(4)), Some(Gender::NonBinary));
    }
}
