// src/bot/commands.rs - Routes inbound events to session calls

use log::debug;

use crate::bot::replies;
use crate::bot::session::SessionFacade;
use crate::types::{
    AdminAction, ButtonAction, ContentKind, Delivery, InboundEvent, MatchOutcome, Menu, Notice, Payload,
    PendingInput, ReportId, Resolution, SessionError, SessionResult, Target, UserId, UserState,
};

/// Maps inbound events onto session calls and turns the outcome into deliveries
#[derive(Clone)]
pub struct CommandRouter {
    facade: SessionFacade,
}

fn reply(user: UserId, notice: Notice) -> Vec<Delivery> {
    vec![Delivery::notice(user, notice)]
}

fn text(user: UserId, text: String) -> Vec<Delivery> {
    reply(user, Notice::Text { text, menu: Menu::None })
}

/// Caller's own reply first, then whatever the session owes to others
fn with_reply(user: UserId, notice: Notice, others: Vec<Delivery>) -> Vec<Delivery> {
    let mut deliveries = reply(user, notice);
    deliveries.extend(others);
    deliveries
}

fn parse_target(args: &[String]) -> SessionResult<Option<Target>> {
    args.first().map(|arg| arg.parse()).transpose()
}

fn parse_user_id(args: &[String]) -> SessionResult<Option<UserId>> {
    args.first().map(|arg| arg.parse()).transpose()
}

fn parse_report_id(arg: Option<&String>) -> SessionResult<ReportId> {
    let arg = arg.ok_or_else(|| SessionError::InvalidTarget("missing report id".to_string()))?;
    arg.trim()
        .trim_start_matches('#')
        .parse()
        .map_err(|_| SessionError::InvalidTarget(format!("'{}' is not a report id", arg)))
}

fn match_notice(outcome: MatchOutcome) -> Notice {
    match outcome {
        MatchOutcome::Paired { partner_gender, .. } => Notice::Matched { partner_gender },
        MatchOutcome::Waiting { target } => Notice::Waiting { target },
    }
}

impl CommandRouter {
    pub fn new(facade: SessionFacade) -> Self {
        Self { facade }
    }

    /// Handle one event. Session errors become a notice to the sender.
    pub async fn handle(&self, event: InboundEvent) -> Vec<Delivery> {
        let user = event.user();
        let result = match event {
            InboundEvent::Command { name, args, .. } => {
                self.facade.take_pending(user).await;
                self.handle_command(user, &name, &args).await
            }
            InboundEvent::Button { action, .. } => {
                self.facade.take_pending(user).await;
                self.handle_button(user, action).await
            }
            InboundEvent::Content { payload, .. } => self.handle_content(user, payload).await,
        };

        match result {
            Ok(deliveries) => deliveries,
            Err(error) => {
                debug!("Request from {} rejected: {}", user, error);
                reply(user, Notice::Failed(error))
            }
        }
    }

    async fn handle_command(&self, user: UserId, name: &str, args: &[String]) -> SessionResult<Vec<Delivery>> {
        debug!("Command /{} from {}", name, user);

        match name.to_lowercase().as_str() {
            "start" => {
                self.facade.touch(user).await?;
                Ok(reply(user, Notice::Welcome))
            }
            "help" => Ok(reply(user, Notice::Help)),
            "menu" => Ok(reply(user, Notice::MainMenu)),
            "find" | "search" => self.find(user, parse_target(args)?.unwrap_or(Target::Anyone)).await,
            "next" => self.next(user, parse_target(args)?).await,
            "cancel" => self.cancel(user).await,
            "end" | "stop" => self.end(user).await,
            "gender" => match args.first() {
                Some(arg) => self.set_gender(user, arg).await,
                None => Ok(reply(user, Notice::ChooseGender)),
            },
            "report" => {
                if args.is_empty() {
                    self.ask_report_reason(user).await
                } else {
                    self.report(user, &args.join(" "), None).await
                }
            }
            "admin" => {
                self.require_admin(user).await?;
                Ok(reply(user, Notice::AdminPanel))
            }
            "stats" => self.stats(user).await,
            "reports" => self.list_reports(user).await,
            "ban" => self.admin_by_id(user, PendingInput::BanTarget, args).await,
            "unban" => self.admin_by_id(user, PendingInput::UnbanTarget, args).await,
            "addadmin" => self.admin_by_id(user, PendingInput::AddAdmin, args).await,
            "removeadmin" => self.admin_by_id(user, PendingInput::RemoveAdmin, args).await,
            "user" | "lookup" => self.admin_by_id(user, PendingInput::LookupUser, args).await,
            "resolve" => self.resolve(user, parse_report_id(args.first())?, Resolution::Resolved).await,
            "dismiss" => self.resolve(user, parse_report_id(args.first())?, Resolution::Dismissed).await,
            _ => Ok(reply(user, Notice::UnknownCommand)),
        }
    }

    async fn handle_button(&self, user: UserId, action: ButtonAction) -> SessionResult<Vec<Delivery>> {
        debug!("Button {} from {}", action.callback_data(), user);

        match action {
            ButtonAction::FindPartner(target) => self.find(user, target).await,
            ButtonAction::ChooseTarget => Ok(reply(user, Notice::ChooseTarget)),
            ButtonAction::ChooseGender => Ok(reply(user, Notice::ChooseGender)),
            ButtonAction::SetGender(gender) => {
                self.facade.set_gender(user, gender).await?;
                Ok(reply(user, Notice::GenderSaved(gender)))
            }
            ButtonAction::CancelSearch => self.cancel(user).await,
            ButtonAction::EndChat => self.end(user).await,
            ButtonAction::NextChat => self.next(user, None).await,
            ButtonAction::Report => self.ask_report_reason(user).await,
            ButtonAction::MainMenu => Ok(reply(user, Notice::MainMenu)),
            ButtonAction::Help => Ok(reply(user, Notice::Help)),
            ButtonAction::Admin(action) => self.admin_action(user, action).await,
            ButtonAction::ResolveReport(id) => self.resolve(user, id, Resolution::Resolved).await,
            ButtonAction::DismissReport(id) => self.resolve(user, id, Resolution::Dismissed).await,
        }
    }

    /// Answer a pending prompt if there is one, otherwise relay to the partner
    async fn handle_content(&self, user: UserId, payload: Payload) -> SessionResult<Vec<Delivery>> {
        if let Some(input) = self.facade.take_pending(user).await {
            return match input {
                PendingInput::ReportReason => {
                    let reason = payload.text_or_caption().unwrap_or_default().to_string();
                    // Only screenshots count as evidence
                    let evidence = match payload.kind {
                        ContentKind::Photo => payload.file_id.clone(),
                        _ => None,
                    };
                    self.report(user, &reason, evidence).await
                }
                input => {
                    let target: UserId = payload.text.as_deref().unwrap_or_default().parse()?;
                    self.apply_admin_input(user, input, target).await
                }
            };
        }

        match self.facade.relay_content(user, payload).await {
            Ok(dispatch) => Ok(dispatch.deliveries),
            Err(SessionError::NotPaired) => Ok(reply(user, Notice::NotInChat)),
            Err(e) => Err(e),
        }
    }

    async fn find(&self, user: UserId, target: Target) -> SessionResult<Vec<Delivery>> {
        let dispatch = self.facade.request_match(user, target).await?;
        Ok(with_reply(user, match_notice(dispatch.value), dispatch.deliveries))
    }

    async fn next(&self, user: UserId, target: Option<Target>) -> SessionResult<Vec<Delivery>> {
        let dispatch = self.facade.next_chat(user, target).await?;
        Ok(with_reply(user, match_notice(dispatch.value), dispatch.deliveries))
    }

    async fn cancel(&self, user: UserId) -> SessionResult<Vec<Delivery>> {
        if self.facade.cancel_search(user).await? {
            Ok(reply(user, Notice::SearchCancelled))
        } else {
            Ok(reply(user, Notice::NotWaiting))
        }
    }

    async fn end(&self, user: UserId) -> SessionResult<Vec<Delivery>> {
        let dispatch = self.facade.end_chat(user).await?;
        let notice = match dispatch.value {
            Some(_) => Notice::ChatEnded,
            None => Notice::NotInChat,
        };
        Ok(with_reply(user, notice, dispatch.deliveries))
    }

    async fn set_gender(&self, user: UserId, arg: &str) -> SessionResult<Vec<Delivery>> {
        let gender = arg.parse()?;
        self.facade.set_gender(user, gender).await?;
        Ok(reply(user, Notice::GenderSaved(gender)))
    }

    async fn ask_report_reason(&self, user: UserId) -> SessionResult<Vec<Delivery>> {
        if !matches!(self.facade.state_of(user).await, UserState::Paired(_)) {
            return Err(SessionError::NotPaired);
        }
        self.facade.set_pending(user, PendingInput::ReportReason).await;
        Ok(reply(user, Notice::AskReportReason))
    }

    async fn report(&self, user: UserId, reason: &str, evidence: Option<String>) -> SessionResult<Vec<Delivery>> {
        let dispatch = self.facade.report_user(user, reason, evidence).await?;
        Ok(with_reply(user, Notice::ReportFiled(dispatch.value), dispatch.deliveries))
    }

    async fn require_admin(&self, user: UserId) -> SessionResult<()> {
        if self.facade.is_admin(user).await {
            Ok(())
        } else {
            Err(SessionError::Forbidden)
        }
    }

    async fn stats(&self, user: UserId) -> SessionResult<Vec<Delivery>> {
        self.require_admin(user).await?;
        let stats = self.facade.get_stats().await;
        Ok(text(user, replies::stats_text(&stats)))
    }

    async fn list_reports(&self, user: UserId) -> SessionResult<Vec<Delivery>> {
        let reports = self.facade.pending_reports(user).await?;
        if reports.is_empty() {
            return Ok(text(user, "✅ No pending reports.".to_string()));
        }

        let mut deliveries = text(user, format!("📋 {} pending report(s):", reports.len()));
        for report in &reports {
            deliveries.push(Delivery::notice(
                user,
                Notice::Text {
                    text: replies::report_text(report),
                    menu: Menu::ReportReview(report.id),
                },
            ));
            deliveries.extend(report.evidence(user));
        }
        Ok(deliveries)
    }

    async fn resolve(&self, user: UserId, id: ReportId, resolution: Resolution) -> SessionResult<Vec<Delivery>> {
        let dispatch = self.facade.resolve_report(user, id, resolution).await?;
        let verb = match resolution {
            Resolution::Resolved => "resolved",
            Resolution::Dismissed => "dismissed",
        };
        let confirmation = Notice::Text {
            text: format!("Report #{} {}.", id, verb),
            menu: Menu::None,
        };
        Ok(with_reply(user, confirmation, dispatch.deliveries))
    }

    async fn admin_action(&self, user: UserId, action: AdminAction) -> SessionResult<Vec<Delivery>> {
        match action {
            AdminAction::Panel => {
                self.require_admin(user).await?;
                Ok(reply(user, Notice::AdminPanel))
            }
            AdminAction::Stats => self.stats(user).await,
            AdminAction::Reports => self.list_reports(user).await,
            AdminAction::Ban => self.prompt(user, PendingInput::BanTarget).await,
            AdminAction::Unban => self.prompt(user, PendingInput::UnbanTarget).await,
            AdminAction::AddAdmin => self.prompt(user, PendingInput::AddAdmin).await,
            AdminAction::RemoveAdmin => self.prompt(user, PendingInput::RemoveAdmin).await,
            AdminAction::Lookup => self.prompt(user, PendingInput::LookupUser).await,
        }
    }

    /// Ask for a user id; the next message from this admin answers it
    async fn prompt(&self, user: UserId, input: PendingInput) -> SessionResult<Vec<Delivery>> {
        self.require_admin(user).await?;
        self.facade.set_pending(user, input).await;
        Ok(reply(user, Notice::AskUserId(input)))
    }

    async fn admin_by_id(&self, user: UserId, input: PendingInput, args: &[String]) -> SessionResult<Vec<Delivery>> {
        match parse_user_id(args)? {
            Some(target) => self.apply_admin_input(user, input, target).await,
            None => self.prompt(user, input).await,
        }
    }

    async fn apply_admin_input(&self, user: UserId, input: PendingInput, target: UserId) -> SessionResult<Vec<Delivery>> {
        let (applied, deliveries, done, noop) = match input {
            PendingInput::BanTarget => {
                let d = self.facade.ban(user, target).await?;
                (d.value, d.deliveries, "banned", "is already banned or cannot be banned")
            }
            PendingInput::UnbanTarget => {
                let d = self.facade.unban(user, target).await?;
                (d.value, d.deliveries, "unbanned", "is not banned")
            }
            PendingInput::AddAdmin => {
                let d = self.facade.add_admin(user, target).await?;
                (d.value, d.deliveries, "is now an admin", "is already an admin")
            }
            PendingInput::RemoveAdmin => {
                let d = self.facade.remove_admin(user, target).await?;
                (d.value, d.deliveries, "is no longer an admin", "is not a removable admin")
            }
            PendingInput::LookupUser => {
                let info = self.facade.user_info(user, target).await?;
                return Ok(text(user, replies::user_info_text(&info)));
            }
            PendingInput::ReportReason => return Err(SessionError::Forbidden),
        };

        let message = if applied {
            format!("✅ User {} {}.", target, done)
        } else {
            format!("User {} {}.", target, noop)
        };
        Ok(with_reply(user, Notice::Text { text: message, menu: Menu::None }, deliveries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::types::Gender;

    const ROOT: UserId = UserId(1);

    fn router() -> CommandRouter {
        CommandRouter::new(SessionFacade::in_memory(ROOT, &SessionConfig::default()))
    }

    fn command(user: i64, name: &str, args: &[&str]) -> InboundEvent {
        InboundEvent::Command {
            user: UserId(user),
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn content(user: i64, payload: Payload) -> InboundEvent {
        InboundEvent::Content { user: UserId(user), payload }
    }

    fn notices(deliveries: &[Delivery], user: i64) -> Vec<Notice> {
        deliveries
            .iter()
            .filter_map(|d| match d {
                Delivery::Notice { to, notice } if *to == UserId(user) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_find_and_chat() {
        let router = router();

        let first = router.handle(command(2, "find", &[])).await;
        assert_eq!(notices(&first, 2), vec![Notice::Waiting { target: Target::Anyone }]);

        let second = router
            .handle(InboundEvent::Button { user: UserId(3), action: ButtonAction::FindPartner(Target::Anyone) })
            .await;
        assert_eq!(notices(&second, 3), vec![Notice::Matched { partner_gender: None }]);
        assert_eq!(notices(&second, 2), vec![Notice::Matched { partner_gender: None }]);

        let relayed = router.handle(content(2, Payload::media(ContentKind::Sticker, "abc", None))).await;
        assert_eq!(
            relayed,
            vec![Delivery::Relay { to: UserId(3), payload: Payload::media(ContentKind::Sticker, "abc", None) }]
        );

        let ended = router.handle(command(3, "end", &[])).await;
        assert_eq!(notices(&ended, 3), vec![Notice::ChatEnded]);
        assert_eq!(notices(&ended, 2), vec![Notice::PartnerLeft]);

        let lonely = router.handle(content(2, Payload::text("hello?"))).await;
        assert_eq!(notices(&lonely, 2), vec![Notice::NotInChat]);
    }

    #[tokio::test]
    async fn test_gender_and_targeted_search() {
        let router = router();

        let rejected = router.handle(command(2, "find", &["female"])).await;
        assert_eq!(notices(&rejected, 2), vec![Notice::Failed(SessionError::GenderNotSet)]);

        let saved = router.handle(command(2, "gender", &["nonbinary"])).await;
        assert_eq!(notices(&saved, 2), vec![Notice::GenderSaved(Gender::NonBinary)]);

        let waiting = router.handle(command(2, "find", &["female"])).await;
        assert_eq!(
            notices(&waiting, 2),
            vec![Notice::Waiting { target: Target::Gender(Gender::Female) }]
        );

        let invalid = router.handle(command(2, "find", &["robots"])).await;
        assert!(matches!(notices(&invalid, 2)[0], Notice::Failed(SessionError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_report_via_pending_input() {
        let router = router();
        router.handle(command(2, "find", &[])).await;
        router.handle(command(3, "find", &[])).await;

        let prompt = router
            .handle(InboundEvent::Button { user: UserId(2), action: ButtonAction::Report })
            .await;
        assert_eq!(notices(&prompt, 2), vec![Notice::AskReportReason]);

        // The answer is consumed as the reason, not relayed to the partner
        let filed = router.handle(content(2, Payload::text("insults"))).await;
        assert_eq!(notices(&filed, 2), vec![Notice::ReportFiled(0)]);
        assert_eq!(notices(&filed, 1), vec![Notice::ReportReceived { id: 0 }]);
        assert!(notices(&filed, 3).is_empty());

        let listing = router.handle(command(1, "reports", &[])).await;
        assert_eq!(listing.len(), 2);

        let resolved = router
            .handle(InboundEvent::Button { user: ROOT, action: ButtonAction::ResolveReport(0) })
            .await;
        assert_eq!(notices(&resolved, 2).len(), 1);
    }

    #[tokio::test]
    async fn test_admin_ban_by_prompt() {
        let router = router();
        router.handle(command(2, "find", &[])).await;
        router.handle(command(3, "find", &[])).await;

        let denied = router.handle(command(4, "ban", &["2"])).await;
        assert_eq!(notices(&denied, 4), vec![Notice::Failed(SessionError::Forbidden)]);

        let prompt = router
            .handle(InboundEvent::Button { user: ROOT, action: ButtonAction::Admin(AdminAction::Ban) })
            .await;
        assert_eq!(notices(&prompt, 1), vec![Notice::AskUserId(PendingInput::BanTarget)]);

        let banned = router.handle(content(1, Payload::text("2"))).await;
        assert_eq!(notices(&banned, 2), vec![Notice::Banned]);
        assert_eq!(notices(&banned, 3), vec![Notice::PartnerRemoved]);

        let blocked = router.handle(command(2, "start", &[])).await;
        assert_eq!(notices(&blocked, 2), vec![Notice::Failed(SessionError::Banned)]);
    }

    #[tokio::test]
    async fn test_commands_clear_stale_prompt() {
        let router = router();
        router.handle(command(1, "user", &[])).await;
        router.handle(command(1, "help", &[])).await;

        // Not parsed as a user id any more
        let reply = router.handle(content(1, Payload::text("abc"))).await;
        assert_eq!(notices(&reply, 1), vec![Notice::NotInChat]);
    }

    #[tokio::test]
    async fn test_unknown_command_and_non_admin_stats() {
        let router = router();
        let unknown = router.handle(command(2, "dance", &[])).await;
        assert_eq!(notices(&unknown, 2), vec![Notice::UnknownCommand]);

        let stats = router.handle(command(2, "stats", &[])).await;
        assert_eq!(notices(&stats, 2), vec![Notice::Failed(SessionError::Forbidden)]);

        let stats = router.handle(command(1, "stats", &[])).await;
        assert!(matches!(&notices(&stats, 1)[0], Notice::Text { text, .. } if text.contains("Bot statistics")));
    }

    #[tokio::test]
    async fn test_report_evidence_reaches_admins() {
        let router = router();
        router.handle(command(1, "addadmin", &["5"])).await;
        router.handle(command(2, "find", &[])).await;
        router.handle(command(3, "find", &[])).await;

        router.handle(command(2, "report", &[])).await;
        let screenshot = Payload::media(ContentKind::Photo, "shot-1", Some("threats".to_string()));
        let filed = router.handle(content(2, screenshot)).await;

        let evidence_for = |deliveries: &[Delivery], admin: i64| -> Vec<String> {
            deliveries
                .iter()
                .filter_map(|d| match d {
                    Delivery::Relay { to, payload } if *to == UserId(admin) => payload.file_id.clone(),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(evidence_for(&filed, 1), vec!["shot-1".to_string()]);
        assert_eq!(evidence_for(&filed, 5), vec!["shot-1".to_string()]);
        assert!(evidence_for(&filed, 3).is_empty());

        let listing = router.handle(command(5, "reports", &[])).await;
        assert_eq!(listing.len(), 3);
        assert_eq!(evidence_for(&listing, 5), vec!["shot-1".to_string()]);
        assert!(matches!(
            &listing[2],
            Delivery::Relay { payload, .. } if payload.kind == ContentKind::Photo
        ));
    }

    #[tokio::test]
    async fn test_non_photo_media_is_not_evidence() {
        let router = router();
        router.handle(command(2, "find", &[])).await;
        router.handle(command(3, "find", &[])).await;

        router.handle(command(2, "report", &[])).await;
        let clip = Payload::media(ContentKind::Video, "clip-1", Some("spam".to_string()));
        let filed = router.handle(content(2, clip)).await;

        assert_eq!(notices(&filed, 2), vec![Notice::ReportFiled(0)]);
        assert!(filed.iter().all(|d| matches!(d, Delivery::Notice { .. })));
    }

    #[tokio::test]
    async fn test_next_button_keeps_gender_filter() {
        let router = router();
        router.handle(command(2, "gender", &["male"])).await;
        router.handle(command(3, "gender", &["female"])).await;
        router.handle(command(4, "gender", &["male"])).await;

        router.handle(command(2, "find", &["female"])).await;
        let paired = router.handle(command(3, "find", &[])).await;
        assert_eq!(notices(&paired, 2), vec![Notice::Matched { partner_gender: Some(Gender::Female) }]);
        router.handle(command(4, "find", &[])).await;

        // 4 is waiting but is not what 2 asked for
        let next = router
            .handle(InboundEvent::Button { user: UserId(2), action: ButtonAction::NextChat })
            .await;
        assert_eq!(
            notices(&next, 2),
            vec![Notice::Waiting { target: Target::Gender(Gender::Female) }]
        );
        assert_eq!(notices(&next, 3), vec![Notice::PartnerLeft]);

        // An explicit target still wins
        let anyone = router.handle(command(2, "next", &["any"])).await;
        assert!(matches!(notices(&anyone, 2)[0], Notice::Matched { .. }));
    }
}
