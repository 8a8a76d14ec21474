// src/bot/moderation.rs - Admin roster, bans and the abuse report ledger

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::bot::pairing::PairingEngine;
use crate::bot::users::UserDirectory;
use crate::types::{
    Report, ReportId, ReportStatus, Resolution, Role, SessionError, SessionResult, UserId,
};

/// What a ban actually changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BanOutcome {
    pub applied: bool,
    /// Partner whose chat was severed by the ban
    pub ex_partner: Option<UserId>,
    pub was_waiting: bool,
}

/// Append-only report ledger plus the admin rules layered on top of [`UserDirectory`].
///
/// The roster itself lives in profile roles, so it survives restarts with the users file.
#[derive(Debug, Default)]
pub struct ModerationStore {
    reports: Vec<Report>,
}

impl ModerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted ledger. Ids are re-stamped from position.
    pub fn from_reports(mut reports: Vec<Report>) -> Self {
        for (index, report) in reports.iter_mut().enumerate() {
            if report.id != index {
                warn!("Report at position {} carried id {}, renumbering", index, report.id);
                report.id = index;
            }
        }
        Self { reports }
    }

    /// Promote to admin. Fails for the super-admin and for existing admins.
    pub fn add_admin(&self, users: &mut UserDirectory, id: UserId, now: DateTime<Utc>) -> bool {
        if users.is_super_admin(id) || users.is_admin(id) {
            return false;
        }
        users.set_role(id, Role::Admin, now);
        info!("User {} promoted to admin", id);
        true
    }

    pub fn remove_admin(&self, users: &mut UserDirectory, id: UserId, now: DateTime<Utc>) -> bool {
        if users.is_super_admin(id) || !users.is_admin(id) {
            return false;
        }
        users.set_role(id, Role::User, now);
        info!("User {} demoted from admin", id);
        true
    }

    /// Super-admin first, then promoted admins in id order
    pub fn admins(&self, users: &UserDirectory) -> Vec<UserId> {
        let mut promoted: Vec<UserId> = users
            .iter()
            .filter(|p| p.role == Role::Admin && !users.is_super_admin(p.id))
            .map(|p| p.id)
            .collect();
        promoted.sort();

        let mut admins = vec![users.super_admin()];
        admins.extend(promoted);
        admins
    }

    /// Ban a user, severing any chat and dropping them from the queue
    pub fn ban(
        &self,
        users: &mut UserDirectory,
        pairing: &mut PairingEngine,
        target: UserId,
        now: DateTime<Utc>,
    ) -> BanOutcome {
        if !users.ban(target, now) {
            return BanOutcome::default();
        }

        let ex_partner = pairing.end_chat(users, target);
        let was_waiting = pairing.cancel(users, target);
        info!(
            "User {} banned (ex_partner: {:?}, was_waiting: {})",
            target, ex_partner, was_waiting
        );

        BanOutcome {
            applied: true,
            ex_partner,
            was_waiting,
        }
    }

    /// Append a pending report. The caller has already checked the pair.
    pub fn file_report(
        &mut self,
        reporter: UserId,
        reported: UserId,
        reason: String,
        evidence_file_id: Option<String>,
        now: DateTime<Utc>,
    ) -> ReportId {
        let id = self.reports.len();
        self.reports.push(Report {
            id,
            reporter_id: reporter,
            reported_id: reported,
            reason,
            evidence_file_id,
            created_at: now,
            status: ReportStatus::Pending,
            resolved_by: None,
            resolved_at: None,
        });
        info!("Report #{} filed by {} against {}", id, reporter, reported);
        id
    }

    /// Close a report. Re-closing overwrites the previous outcome.
    pub fn resolve_report(
        &mut self,
        id: ReportId,
        resolution: Resolution,
        admin: UserId,
        now: DateTime<Utc>,
    ) -> SessionResult<&Report> {
        let report = self
            .reports
            .get_mut(id)
            .ok_or_else(|| SessionError::InvalidTarget(format!("no report #{}", id)))?;

        if report.status != ReportStatus::Pending {
            warn!("Report #{} was already {:?}, overwriting", id, report.status);
        }
        report.status = resolution.into();
        report.resolved_by = Some(admin);
        report.resolved_at = Some(now);
        info!("Report #{} marked {:?} by {}", id, report.status, admin);
        Ok(report)
    }

    pub fn pending_reports(&self) -> Vec<&Report> {
        self.reports
            .iter()
            .filter(|r| r.status == ReportStatus::Pending)
            .collect()
    }

    pub fn reports_filed_by(&self, id: UserId) -> usize {
        self.reports.iter().filter(|r| r.reporter_id == id).count()
    }

    pub fn reports_against(&self, id: UserId) -> usize {
        self.reports.iter().filter(|r| r.reported_id == id).count()
    }

    pub fn reports(&self) -> &[Report] {
        &self.reports
    }
}
