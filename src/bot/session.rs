// src/bot/session.rs - Single entry point that owns all matchmaking state

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::bot::analytics::{StatsAggregator, StatsCounters, StatsSnapshot};
use crate::bot::moderation::ModerationStore;
use crate::bot::pairing::PairingEngine;
use crate::bot::persistence::{FlushPolicy, PersistHandle, PersistedState, SnapshotSource, StateStore};
use crate::bot::spam::SpamGuard;
use crate::bot::users::{UserDirectory, UserProfile};
use crate::config::{BotConfiguration, SessionConfig, SpamConfig};
use crate::types::{
    Delivery, Gender, MatchOutcome, Notice, Payload, PendingInput, Report, ReportId, Resolution,
    SessionError, SessionResult, Target, UserId, UserState,
};

/// Result of a state change plus the notices it owes to other users.
///
/// Deliveries are performed by the caller after the session lock is released.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch<T> {
    pub value: T,
    pub deliveries: Vec<Delivery>,
}

impl<T> Dispatch<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            deliveries: Vec::new(),
        }
    }

    fn notify(&mut self, to: UserId, notice: Notice) {
        self.deliveries.push(Delivery::notice(to, notice));
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Dispatch<U> {
        Dispatch {
            value: f(self.value),
            deliveries: self.deliveries,
        }
    }
}

/// Admin view of a single user
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub profile: UserProfile,
    pub state: UserState,
    pub is_admin: bool,
    pub is_super_admin: bool,
    pub reports_filed: usize,
    pub reports_against: usize,
}

/// Every piece of mutable state, guarded as one unit by [`SessionFacade`]
pub struct SessionState {
    users: UserDirectory,
    pairing: PairingEngine,
    moderation: ModerationStore,
    stats: StatsAggregator,
    spam: SpamGuard,
    /// Bumped on every change to persisted data
    revision: u64,
    flush_requested: bool,
}

impl SessionState {
    pub fn new(super_admin: UserId, spam: SpamConfig, now: DateTime<Utc>) -> Self {
        Self {
            users: UserDirectory::new(super_admin),
            pairing: PairingEngine::new(),
            moderation: ModerationStore::new(),
            stats: StatsAggregator::new(now),
            spam: SpamGuard::new(spam),
            revision: 0,
            flush_requested: false,
        }
    }

    /// Rebuild from a snapshot. Nobody is waiting after a restart, and a pair survives
    /// only if both profiles still point at each other.
    pub fn from_persisted(
        super_admin: UserId,
        spam: SpamConfig,
        persisted: PersistedState,
        now: DateTime<Utc>,
    ) -> Self {
        let PersistedState { users, stats, reports } = persisted;
        let mut profiles = profile_map(users);

        let mut pairs = Vec::new();
        for profile in profiles.values() {
            if let Some(partner) = profile.partner {
                let mutual = profiles
                    .get(&partner)
                    .map_or(false, |p| p.partner == Some(profile.id));
                if mutual && profile.id < partner {
                    pairs.push((profile.id, partner));
                } else if !mutual {
                    warn!("Dropping dangling chat half {} -> {}", profile.id, partner);
                }
            }
        }

        let reconciled = pairs.len() * 2 != profiles.values().filter(|p| p.partner.is_some()).count();
        let mut dropped_waiters = 0;
        for profile in profiles.values_mut() {
            profile.partner = None;
            if profile.waiting_since.take().is_some() {
                dropped_waiters += 1;
            }
        }
        if dropped_waiters > 0 {
            info!("{} users were waiting before restart; queue starts empty", dropped_waiters);
        }

        let user_count = profiles.len() as u64;
        let mut users = UserDirectory::from_profiles(super_admin, profiles);
        let mut pairing = PairingEngine::new();
        for (a, b) in &pairs {
            pairing.restore_pair(&mut users, *a, *b);
        }

        let stats = match stats {
            Some(counters) => StatsAggregator::from_counters(counters, now),
            None => {
                let mut counters = StatsCounters::new(now);
                counters.total_users = user_count;
                StatsAggregator::from_counters(counters, now)
            }
        };

        info!(
            "Session restored: {} users, {} active chats, {} reports",
            users.len(),
            pairs.len(),
            reports.len()
        );

        let mut state = Self {
            users,
            pairing,
            moderation: ModerationStore::from_reports(reports),
            stats,
            spam: SpamGuard::new(spam),
            revision: 0,
            flush_requested: false,
        };
        if reconciled || dropped_waiters > 0 {
            state.changed();
        }
        state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Persisted data changed and should reach the store soon
    fn changed(&mut self) {
        self.revision += 1;
        self.flush_requested = true;
    }

    /// Persisted data changed, but it can wait for the periodic flush
    fn touched(&mut self) {
        self.revision += 1;
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            users: self.users.profiles().clone(),
            stats: Some(self.stats.counters().clone()),
            reports: self.moderation.reports().to_vec(),
        }
    }

    /// Check the relation, queue and profile invariants
    pub fn verify(&self) -> Result<(), String> {
        self.pairing.verify(&self.users)
    }

    /// Register activity; banned users are turned away here, before anything else
    fn enter(&mut self, user: UserId, now: DateTime<Utc>) -> SessionResult<()> {
        if self.users.touch(user, now) {
            self.stats.record_new_user();
            self.changed();
        } else {
            self.touched();
        }
        if self.users.is_banned(user) {
            return Err(SessionError::Banned);
        }
        Ok(())
    }

    fn require_admin(&self, user: UserId) -> SessionResult<()> {
        if self.users.is_banned(user) {
            return Err(SessionError::Banned);
        }
        if !self.users.is_admin(user) {
            return Err(SessionError::Forbidden);
        }
        Ok(())
    }

    fn observe_concurrency(&mut self, now: DateTime<Utc>) {
        let waiting = self.pairing.queue().len();
        let paired = self.pairing.paired_users();
        if self.stats.observe_concurrency(waiting, paired, now) {
            debug!("New concurrency peak: {}", waiting + paired);
        }
    }

    pub fn touch(&mut self, user: UserId, now: DateTime<Utc>) -> SessionResult<()> {
        self.enter(user, now)
    }

    pub fn request_match(
        &mut self,
        user: UserId,
        target: Target,
        now: DateTime<Utc>,
    ) -> SessionResult<Dispatch<MatchOutcome>> {
        self.enter(user, now)?;
        let outcome = self.pairing.try_match_or_enqueue(&mut self.users, user, target, now)?;
        if let Some(profile) = self.users.get_mut(user) {
            profile.last_target = Some(target);
        }
        self.changed();

        let mut dispatch = Dispatch::new(outcome);
        if let MatchOutcome::Paired { partner, .. } = outcome {
            self.stats.record_chat_started();
            dispatch.notify(
                partner,
                Notice::Matched {
                    partner_gender: self.users.gender_of(user),
                },
            );
        }
        self.observe_concurrency(now);
        Ok(dispatch)
    }

    pub fn cancel_search(&mut self, user: UserId, now: DateTime<Utc>) -> SessionResult<bool> {
        self.enter(user, now)?;
        let cancelled = self.pairing.cancel(&mut self.users, user);
        if cancelled {
            self.changed();
        }
        Ok(cancelled)
    }

    pub fn end_chat(&mut self, user: UserId, now: DateTime<Utc>) -> SessionResult<Dispatch<Option<UserId>>> {
        self.enter(user, now)?;
        let partner = self.pairing.end_chat(&mut self.users, user);

        let mut dispatch = Dispatch::new(partner);
        if let Some(partner) = partner {
            self.changed();
            self.spam.release(user, now);
            self.spam.release(partner, now);
            dispatch.notify(partner, Notice::PartnerLeft);
        }
        Ok(dispatch)
    }

    /// End the current chat (if any) and search again in one step.
    /// Without a target the user's previous search target is reused.
    pub fn next_chat(
        &mut self,
        user: UserId,
        target: Option<Target>,
        now: DateTime<Utc>,
    ) -> SessionResult<Dispatch<MatchOutcome>> {
        self.enter(user, now)?;
        let target = target
            .or_else(|| self.users.get(user).and_then(|profile| profile.last_target))
            .unwrap_or(Target::Anyone);
        if target != Target::Anyone && self.users.gender_of(user).is_none() {
            return Err(SessionError::GenderNotSet);
        }

        let ended = self.end_chat(user, now)?;
        let mut next = self.request_match(user, target, now)?;
        next.deliveries.splice(0..0, ended.deliveries);
        Ok(next)
    }

    /// Forward content to the partner, anonymised
    pub fn relay_content(
        &mut self,
        user: UserId,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> SessionResult<Dispatch<UserId>> {
        self.enter(user, now)?;
        let partner = self.pairing.partner_of(user).ok_or(SessionError::NotPaired)?;
        self.spam.check(user, now)?;
        self.stats.record_message(payload.kind);

        let mut dispatch = Dispatch::new(partner);
        dispatch.deliveries.push(Delivery::Relay { to: partner, payload });
        Ok(dispatch)
    }

    /// File a report against the current partner and alert every other admin
    pub fn report_user(
        &mut self,
        reporter: UserId,
        reason: &str,
        evidence_file_id: Option<String>,
        now: DateTime<Utc>,
    ) -> SessionResult<Dispatch<ReportId>> {
        self.enter(reporter, now)?;
        let reported = self.pairing.partner_of(reporter).ok_or(SessionError::NotPaired)?;

        let reason = reason.trim();
        if reason.is_empty() && evidence_file_id.is_none() {
            return Err(SessionError::InvalidTarget("a report needs a reason".to_string()));
        }

        let id = self
            .moderation
            .file_report(reporter, reported, reason.to_string(), evidence_file_id, now);
        self.changed();

        let mut dispatch = Dispatch::new(id);
        for admin in self.moderation.admins(&self.users) {
            if admin != reporter && !self.users.is_banned(admin) {
                dispatch.notify(admin, Notice::ReportReceived { id });
                let evidence = self.moderation.reports().get(id).and_then(|report| report.evidence(admin));
                dispatch.deliveries.extend(evidence);
            }
        }
        Ok(dispatch)
    }

    pub fn ban(&mut self, admin: UserId, target: UserId, now: DateTime<Utc>) -> SessionResult<Dispatch<bool>> {
        self.enter(admin, now)?;
        self.require_admin(admin)?;
        if target == admin {
            return Err(SessionError::InvalidTarget("cannot ban yourself".to_string()));
        }
        if self.users.is_admin(target) && !self.users.is_super_admin(admin) {
            return Err(SessionError::Forbidden);
        }

        let outcome = self.moderation.ban(&mut self.users, &mut self.pairing, target, now);
        let mut dispatch = Dispatch::new(outcome.applied);
        if outcome.applied {
            self.changed();
            self.spam.reset(target);
            dispatch.notify(target, Notice::Banned);
            if let Some(ex_partner) = outcome.ex_partner {
                self.spam.release(ex_partner, now);
                dispatch.notify(ex_partner, Notice::PartnerRemoved);
            }
            info!("Admin {} banned {}", admin, target);
        }
        Ok(dispatch)
    }

    pub fn unban(&mut self, admin: UserId, target: UserId, now: DateTime<Utc>) -> SessionResult<Dispatch<bool>> {
        self.enter(admin, now)?;
        self.require_admin(admin)?;

        let applied = self.users.unban(target);
        let mut dispatch = Dispatch::new(applied);
        if applied {
            self.changed();
            dispatch.notify(target, Notice::Unbanned);
            info!("Admin {} unbanned {}", admin, target);
        }
        Ok(dispatch)
    }

    pub fn add_admin(&mut self, requester: UserId, target: UserId, now: DateTime<Utc>) -> SessionResult<Dispatch<bool>> {
        self.enter(requester, now)?;
        if !self.users.is_super_admin(requester) {
            return Err(SessionError::Forbidden);
        }

        let applied = self.moderation.add_admin(&mut self.users, target, now);
        let mut dispatch = Dispatch::new(applied);
        if applied {
            self.changed();
            dispatch.notify(target, Notice::Promoted);
        }
        Ok(dispatch)
    }

    pub fn remove_admin(&mut self, requester: UserId, target: UserId, now: DateTime<Utc>) -> SessionResult<Dispatch<bool>> {
        self.enter(requester, now)?;
        if !self.users.is_super_admin(requester) {
            return Err(SessionError::Forbidden);
        }

        let applied = self.moderation.remove_admin(&mut self.users, target, now);
        let mut dispatch = Dispatch::new(applied);
        if applied {
            self.changed();
            dispatch.notify(target, Notice::Demoted);
        }
        Ok(dispatch)
    }

    pub fn resolve_report(
        &mut self,
        admin: UserId,
        id: ReportId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> SessionResult<Dispatch<Report>> {
        self.enter(admin, now)?;
        self.require_admin(admin)?;

        let report = self.moderation.resolve_report(id, resolution, admin, now)?.clone();
        self.changed();
        let mut dispatch = Dispatch::new(report.clone());
        if report.reporter_id != admin {
            dispatch.notify(
                report.reporter_id,
                Notice::ReportClosed {
                    id,
                    status: report.status,
                },
            );
        }
        Ok(dispatch)
    }

    pub fn pending_reports(&self, admin: UserId) -> SessionResult<Vec<Report>> {
        self.require_admin(admin)?;
        Ok(self.moderation.pending_reports().into_iter().cloned().collect())
    }

    pub fn user_info(&self, admin: UserId, target: UserId) -> SessionResult<UserInfo> {
        self.require_admin(admin)?;
        let profile = self
            .users
            .get(target)
            .ok_or_else(|| SessionError::InvalidTarget(format!("unknown user {}", target)))?;

        Ok(UserInfo {
            profile: profile.clone(),
            state: self.pairing.state_of(target),
            is_admin: self.users.is_admin(target),
            is_super_admin: self.users.is_super_admin(target),
            reports_filed: self.moderation.reports_filed_by(target),
            reports_against: self.moderation.reports_against(target),
        })
    }

    /// Returns the previous gender
    pub fn set_gender(&mut self, user: UserId, gender: Gender, now: DateTime<Utc>) -> SessionResult<Option<Gender>> {
        self.enter(user, now)?;
        let (previous, _) = self.users.set_gender(user, gender, now);
        self.changed();
        Ok(previous)
    }

    pub fn set_pending(&mut self, user: UserId, input: PendingInput) {
        self.users.set_pending(user, input);
    }

    pub fn take_pending(&mut self, user: UserId) -> Option<PendingInput> {
        self.users.take_pending(user)
    }

    /// Drop a waiter whose search has run too long, unless they already moved on
    pub fn expire_search(&mut self, user: UserId, since: DateTime<Utc>) -> Dispatch<bool> {
        let expired = self.pairing.expire(&mut self.users, user, since);
        let mut dispatch = Dispatch::new(expired);
        if expired {
            self.changed();
            info!("Search of {} timed out", user);
            dispatch.notify(user, Notice::SearchTimedOut);
        }
        dispatch
    }

    pub fn state_of(&self, user: UserId) -> UserState {
        self.pairing.state_of(user)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.users.is_admin(user) && !self.users.is_banned(user)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> StatsSnapshot {
        self.stats.snapshot(&self.users, &self.pairing, now)
    }
}

#[async_trait]
impl SnapshotSource for Mutex<SessionState> {
    async fn snapshot_since(&self, saved: u64) -> Option<(u64, PersistedState)> {
        let state = self.lock().await;
        (state.revision > saved).then(|| (state.revision, state.snapshot()))
    }
}

fn profile_map(profiles: HashMap<UserId, UserProfile>) -> HashMap<UserId, UserProfile> {
    profiles
        .into_iter()
        .filter(|(id, profile)| {
            if *id != profile.id {
                warn!("Profile stored under {} claims id {}, skipping", id, profile.id);
                return false;
            }
            true
        })
        .collect()
}

/// Cloneable async handle around [`SessionState`].
///
/// Each call is one critical section. A call that changes persisted data only bumps a
/// revision; the flusher snapshots and writes later, outside the caller's path.
#[derive(Clone)]
pub struct SessionFacade {
    state: Arc<Mutex<SessionState>>,
    persister: Option<Arc<PersistHandle>>,
    search_timeout: Option<Duration>,
    delivery_sink: Option<mpsc::Sender<Delivery>>,
}

impl SessionFacade {
    /// Volatile session, nothing is persisted
    pub fn in_memory(super_admin: UserId, config: &SessionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::new(super_admin, config.spam.clone(), Utc::now()))),
            persister: None,
            search_timeout: config.search_timeout_seconds.map(Duration::from_secs),
            delivery_sink: None,
        }
    }

    /// Load state from `store` and keep it updated in the background
    pub async fn open(store: Arc<dyn StateStore>, config: &BotConfiguration) -> Result<Self> {
        let persisted = store
            .load()
            .await
            .with_context(|| format!("Failed to load session state from {}", store.describe()))?;

        let mut state = SessionState::from_persisted(
            UserId(config.super_admin_id),
            config.session.spam.clone(),
            persisted,
            Utc::now(),
        );
        // Reconciliation on load counts as a change
        let reconciled = std::mem::take(&mut state.flush_requested);
        let revision = state.revision();

        let state = Arc::new(Mutex::new(state));
        let persister = PersistHandle::spawn(store, state.clone(), FlushPolicy::from(&config.persistence));
        if reconciled {
            persister.mark_dirty(revision);
        }

        Ok(Self {
            state,
            persister: Some(Arc::new(persister)),
            search_timeout: config.session.search_timeout_seconds.map(Duration::from_secs),
            delivery_sink: None,
        })
    }

    /// Where notices from background work (search timeouts) are sent
    pub fn with_delivery_sink(mut self, sink: mpsc::Sender<Delivery>) -> Self {
        self.delivery_sink = Some(sink);
        self
    }

    pub fn with_search_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.search_timeout = timeout;
        self
    }

    async fn mutate<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut SessionState, DateTime<Utc>) -> T,
    {
        let now = Utc::now();
        let (value, dirty) = {
            let mut state = self.state.lock().await;
            let value = f(&mut *state, now);
            let requested = std::mem::take(&mut state.flush_requested);
            (value, requested.then_some(state.revision))
        };

        if let (Some(persister), Some(revision)) = (&self.persister, dirty) {
            persister.mark_dirty(revision);
        }
        value
    }

    async fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&SessionState, DateTime<Utc>) -> T,
    {
        let state = self.state.lock().await;
        f(&*state, Utc::now())
    }

    pub async fn touch(&self, user: UserId) -> SessionResult<()> {
        self.mutate(|state, now| state.touch(user, now)).await
    }

    pub async fn request_match(&self, user: UserId, target: Target) -> SessionResult<Dispatch<MatchOutcome>> {
        let dispatch = self
            .mutate(|state, now| state.request_match(user, target, now).map(|d| (d, now)))
            .await;
        dispatch.map(|(dispatch, since)| {
            if matches!(dispatch.value, MatchOutcome::Waiting { .. }) {
                self.schedule_timeout(user, since);
            }
            dispatch
        })
    }

    pub async fn cancel_search(&self, user: UserId) -> SessionResult<bool> {
        self.mutate(|state, now| state.cancel_search(user, now)).await
    }

    pub async fn end_chat(&self, user: UserId) -> SessionResult<Dispatch<Option<UserId>>> {
        self.mutate(|state, now| state.end_chat(user, now)).await
    }

    pub async fn next_chat(&self, user: UserId, target: Option<Target>) -> SessionResult<Dispatch<MatchOutcome>> {
        let dispatch = self
            .mutate(|state, now| state.next_chat(user, target, now).map(|d| (d, now)))
            .await;
        dispatch.map(|(dispatch, since)| {
            if matches!(dispatch.value, MatchOutcome::Waiting { .. }) {
                self.schedule_timeout(user, since);
            }
            dispatch
        })
    }

    pub async fn relay_content(&self, user: UserId, payload: Payload) -> SessionResult<Dispatch<UserId>> {
        self.mutate(|state, now| state.relay_content(user, payload, now)).await
    }

    pub async fn report_user(
        &self,
        reporter: UserId,
        reason: &str,
        evidence_file_id: Option<String>,
    ) -> SessionResult<Dispatch<ReportId>> {
        self.mutate(|state, now| state.report_user(reporter, reason, evidence_file_id, now))
            .await
    }

    pub async fn ban(&self, admin: UserId, target: UserId) -> SessionResult<Dispatch<bool>> {
        self.mutate(|state, now| state.ban(admin, target, now)).await
    }

    pub async fn unban(&self, admin: UserId, target: UserId) -> SessionResult<Dispatch<bool>> {
        self.mutate(|state, now| state.unban(admin, target, now)).await
    }

    pub async fn add_admin(&self, requester: UserId, target: UserId) -> SessionResult<Dispatch<bool>> {
        self.mutate(|state, now| state.add_admin(requester, target, now)).await
    }

    pub async fn remove_admin(&self, requester: UserId, target: UserId) -> SessionResult<Dispatch<bool>> {
        self.mutate(|state, now| state.remove_admin(requester, target, now)).await
    }

    pub async fn resolve_report(
        &self,
        admin: UserId,
        id: ReportId,
        resolution: Resolution,
    ) -> SessionResult<Dispatch<Report>> {
        self.mutate(|state, now| state.resolve_report(admin, id, resolution, now))
            .await
    }

    pub async fn pending_reports(&self, admin: UserId) -> SessionResult<Vec<Report>> {
        self.read(|state, _| state.pending_reports(admin)).await
    }

    pub async fn user_info(&self, admin: UserId, target: UserId) -> SessionResult<UserInfo> {
        self.read(|state, _| state.user_info(admin, target)).await
    }

    pub async fn set_gender(&self, user: UserId, gender: Gender) -> SessionResult<Option<Gender>> {
        self.mutate(|state, now| state.set_gender(user, gender, now)).await
    }

    pub async fn set_pending(&self, user: UserId, input: PendingInput) {
        self.state.lock().await.set_pending(user, input);
    }

    pub async fn take_pending(&self, user: UserId) -> Option<PendingInput> {
        self.state.lock().await.take_pending(user)
    }

    pub async fn expire_search(&self, user: UserId, since: DateTime<Utc>) -> Dispatch<bool> {
        self.mutate(|state, _| state.expire_search(user, since)).await
    }

    pub async fn state_of(&self, user: UserId) -> UserState {
        self.read(|state, _| state.state_of(user)).await
    }

    pub async fn is_admin(&self, user: UserId) -> bool {
        self.read(|state, _| state.is_admin(user)).await
    }

    pub async fn get_stats(&self) -> StatsSnapshot {
        self.read(|state, now| state.stats(now)).await
    }

    pub async fn verify(&self) -> Result<(), String> {
        self.read(|state, _| state.verify()).await
    }

    /// Scheduled cancel; never blocks the caller
    fn schedule_timeout(&self, user: UserId, since: DateTime<Utc>) {
        let Some(timeout) = self.search_timeout else {
            return;
        };
        let facade = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let dispatch = facade.expire_search(user, since).await;
            if dispatch.deliveries.is_empty() {
                return;
            }

            match &facade.delivery_sink {
                Some(sink) => {
                    for delivery in dispatch.deliveries {
                        if let Err(e) = sink.send(delivery).await {
                            warn!("Failed to queue timeout notice for {}: {}", user, e);
                        }
                    }
                }
                None => debug!("No delivery sink, timeout notice for {} dropped", user),
            }
        });
    }

    /// Write the current state synchronously
    pub async fn flush(&self) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let snapshot = self.state.lock().await.snapshot();
        persister.save_now(&snapshot).await
    }

    /// Stop background persistence and write the final state
    pub async fn shutdown(&self) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let snapshot = self.state.lock().await.snapshot();
        persister.shutdown(snapshot).await
    }
}
