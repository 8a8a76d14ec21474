// src/types/mod.rs - Core types shared by the matchmaking engine and platform adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Platform-assigned user identifier, treated as an opaque token by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| SessionError::InvalidTarget(format!("'{}' is not a user id", s.trim())))
    }
}

/// Declared gender of a user. An unset gender is modelled as `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[serde(alias = "nonbinary")]
    NonBinary,
}

impl Gender {
    pub const ALL: [Gender; 3] = [Gender::Male, Gender::Female, Gender::NonBinary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::NonBinary => "non_binary",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Gender::Male => "Man",
            Gender::Female => "Woman",
            Gender::NonBinary => "Non-binary",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Gender::Male => "👨",
            Gender::Female => "👩",
            Gender::NonBinary => "🧑",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = SessionError;

    /// Accepts the canonical names plus legacy spellings such as `nonbinary`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" | "man" => Ok(Gender::Male),
            "female" | "f" | "woman" => Ok(Gender::Female),
            "non_binary" | "nonbinary" | "non-binary" | "nb" => Ok(Gender::NonBinary),
            other => Err(SessionError::InvalidTarget(format!("unknown gender '{}'", other))),
        }
    }
}

/// What a seeker is looking for. Also the key of a waiting-queue partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Anyone,
    Gender(Gender),
}

impl Target {
    /// Whether a user with the given declared gender satisfies this target
    pub fn accepts(&self, gender: Option<Gender>) -> bool {
        match self {
            Target::Anyone => true,
            Target::Gender(wanted) => gender == Some(*wanted),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Anyone => f.write_str("seeking_anyone"),
            Target::Gender(g) => write!(f, "seeking_{}", g),
        }
    }
}

impl FromStr for Target {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "any" | "anyone" | "all" => Ok(Target::Anyone),
            other => other.parse::<Gender>().map(Target::Gender),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Kinds of content that can be relayed between partners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Sticker,
    Photo,
    Voice,
    Video,
    Animation,
    Document,
    Audio,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Sticker => "sticker",
            ContentKind::Photo => "photo",
            ContentKind::Voice => "voice",
            ContentKind::Video => "video",
            ContentKind::Animation => "animation",
            ContentKind::Document => "document",
            ContentKind::Audio => "audio",
        }
    }

    /// Stickers, voice notes and animations carry no caption on relay
    pub fn supports_caption(&self) -> bool {
        matches!(
            self,
            ContentKind::Photo | ContentKind::Video | ContentKind::Document | ContentKind::Audio
        )
    }
}

/// A piece of content sent by one partner, stripped of any sender identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: ContentKind,
    pub text: Option<String>,
    pub file_id: Option<String>,
    pub caption: Option<String>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            file_id: None,
            caption: None,
        }
    }

    pub fn media(kind: ContentKind, file_id: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            kind,
            text: None,
            file_id: Some(file_id.into()),
            caption,
        }
    }

    /// Text content, falling back to the caption for media
    pub fn text_or_caption(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }
}

pub type ReportId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Resolved,
    Dismissed,
}

/// How an admin closes a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    Dismissed,
}

impl From<Resolution> for ReportStatus {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Resolved => ReportStatus::Resolved,
            Resolution::Dismissed => ReportStatus::Dismissed,
        }
    }
}

/// Abuse report filed by one partner against the other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub reporter_id: UserId,
    pub reported_id: UserId,
    pub reason: String,
    pub evidence_file_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub resolved_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Report {
    /// The attached screenshot, addressed to a reviewing admin
    pub fn evidence(&self, to: UserId) -> Option<Delivery> {
        let file_id = self.evidence_file_id.as_ref()?;
        Some(Delivery::Relay {
            to,
            payload: Payload::media(
                ContentKind::Photo,
                file_id.clone(),
                Some(format!("📎 Evidence for report #{}", self.id)),
            ),
        })
    }
}

/// Result of a match request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Paired {
        partner: UserId,
        partner_gender: Option<Gender>,
    },
    Waiting {
        target: Target,
    },
}

/// Where a user currently sits in the `Idle -> Waiting -> Paired -> Idle` cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Idle,
    Waiting(Target),
    Paired(UserId),
}

/// Short-lived expectation that the user's next message is an answer to a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInput {
    BanTarget,
    UnbanTarget,
    AddAdmin,
    RemoveAdmin,
    LookupUser,
    ReportReason,
}

/// Admin panel actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Panel,
    Ban,
    Unban,
    AddAdmin,
    RemoveAdmin,
    Lookup,
    Stats,
    Reports,
}

impl AdminAction {
    fn as_str(&self) -> &'static str {
        match self {
            AdminAction::Panel => "panel",
            AdminAction::Ban => "ban",
            AdminAction::Unban => "unban",
            AdminAction::AddAdmin => "add",
            AdminAction::RemoveAdmin => "remove",
            AdminAction::Lookup => "lookup",
            AdminAction::Stats => "stats",
            AdminAction::Reports => "reports",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "panel" => AdminAction::Panel,
            "ban" => AdminAction::Ban,
            "unban" => AdminAction::Unban,
            "add" => AdminAction::AddAdmin,
            "remove" => AdminAction::RemoveAdmin,
            "lookup" => AdminAction::Lookup,
            "stats" => AdminAction::Stats,
            "reports" => AdminAction::Reports,
            _ => return None,
        })
    }
}

/// Inline button presses, encoded as short callback strings on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    FindPartner(Target),
    ChooseTarget,
    ChooseGender,
    SetGender(Gender),
    CancelSearch,
    EndChat,
    NextChat,
    Report,
    MainMenu,
    Help,
    Admin(AdminAction),
    ResolveReport(ReportId),
    DismissReport(ReportId),
}

impl ButtonAction {
    pub fn callback_data(&self) -> String {
        match self {
            ButtonAction::FindPartner(Target::Anyone) => "find_anyone".to_string(),
            ButtonAction::FindPartner(Target::Gender(g)) => format!("find_{}", g),
            ButtonAction::ChooseTarget => "choose_target".to_string(),
            ButtonAction::ChooseGender => "choose_gender".to_string(),
            ButtonAction::SetGender(g) => format!("gender_{}", g),
            ButtonAction::CancelSearch => "cancel_search".to_string(),
            ButtonAction::EndChat => "end_chat".to_string(),
            ButtonAction::NextChat => "next_chat".to_string(),
            ButtonAction::Report => "report".to_string(),
            ButtonAction::MainMenu => "main_menu".to_string(),
            ButtonAction::Help => "help".to_string(),
            ButtonAction::Admin(action) => format!("admin_{}", action.as_str()),
            ButtonAction::ResolveReport(id) => format!("resolve_{}", id),
            ButtonAction::DismissReport(id) => format!("dismiss_{}", id),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "find_partner" | "find_anyone" => return Some(ButtonAction::FindPartner(Target::Anyone)),
            "choose_target" => return Some(ButtonAction::ChooseTarget),
            "choose_gender" => return Some(ButtonAction::ChooseGender),
            "cancel_search" => return Some(ButtonAction::CancelSearch),
            "end_chat" => return Some(ButtonAction::EndChat),
            "next_chat" => return Some(ButtonAction::NextChat),
            "report" => return Some(ButtonAction::Report),
            "main_menu" => return Some(ButtonAction::MainMenu),
            "help" => return Some(ButtonAction::Help),
            _ => {}
        }

        let (prefix, rest) = data.split_once('_')?;
        match prefix {
            "find" => rest.parse::<Gender>().ok().map(|g| ButtonAction::FindPartner(Target::Gender(g))),
            "gender" => rest.parse::<Gender>().ok().map(ButtonAction::SetGender),
            "admin" => AdminAction::parse(rest).map(ButtonAction::Admin),
            "resolve" => rest.parse::<ReportId>().ok().map(ButtonAction::ResolveReport),
            "dismiss" => rest.parse::<ReportId>().ok().map(ButtonAction::DismissReport),
            _ => None,
        }
    }
}

/// Inbound platform event, resolved once at the adapter boundary
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Command {
        user: UserId,
        name: String,
        args: Vec<String>,
    },
    Button {
        user: UserId,
        action: ButtonAction,
    },
    Content {
        user: UserId,
        payload: Payload,
    },
}

impl InboundEvent {
    pub fn user(&self) -> UserId {
        match self {
            InboundEvent::Command { user, .. }
            | InboundEvent::Button { user, .. }
            | InboundEvent::Content { user, .. } => *user,
        }
    }
}

/// Keyboard attached to an outbound notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Menu {
    None,
    Main,
    TargetPicker,
    GenderPicker,
    Searching,
    InChat,
    AfterChat,
    AdminPanel,
    ReportReview(ReportId),
}

/// Something the engine wants a user to be told
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Welcome,
    Help,
    MainMenu,
    ChooseTarget,
    ChooseGender,
    GenderSaved(Gender),
    Matched { partner_gender: Option<Gender> },
    Waiting { target: Target },
    SearchCancelled,
    NotWaiting,
    SearchTimedOut,
    ChatEnded,
    PartnerLeft,
    PartnerRemoved,
    NotInChat,
    AskReportReason,
    ReportFiled(ReportId),
    ReportReceived { id: ReportId },
    ReportClosed { id: ReportId, status: ReportStatus },
    AskUserId(PendingInput),
    Banned,
    Unbanned,
    Promoted,
    Demoted,
    AdminPanel,
    UnknownCommand,
    Failed(SessionError),
    /// Pre-rendered text with an optional keyboard (admin listings, stats)
    Text { text: String, menu: Menu },
}

/// Outbound instruction produced by the engine and executed by a platform adapter
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Notice { to: UserId, notice: Notice },
    Relay { to: UserId, payload: Payload },
}

impl Delivery {
    pub fn notice(to: UserId, notice: Notice) -> Self {
        Delivery::Notice { to, notice }
    }

    pub fn recipient(&self) -> UserId {
        match self {
            Delivery::Notice { to, .. } | Delivery::Relay { to, .. } => *to,
        }
    }
}

/// Recoverable outcomes of engine operations, reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("already in a chat")]
    AlreadyPaired,

    #[error("already waiting for a partner")]
    AlreadyWaiting,

    #[error("not in a chat")]
    NotPaired,

    #[error("operation not permitted")]
    Forbidden,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("user is banned")]
    Banned,

    #[error("gender must be set before searching for a specific gender")]
    GenderNotSet,

    #[error("sending too fast, try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_normalizes_legacy_spellings() {
        assert_eq!("nonbinary".parse::<Gender>().unwrap(), Gender::NonBinary);
        assert_eq!("Non-Binary".parse::<Gender>().unwrap(), Gender::NonBinary);
        assert_eq!(" FEMALE ".parse::<Gender>().unwrap(), Gender::Female);
        assert!(matches!("robot".parse::<Gender>(), Err(SessionError::InvalidTarget(_))));

        let legacy: Gender = serde_json::from_str("\"nonbinary\"").unwrap();
        assert_eq!(legacy, Gender::NonBinary);
        assert_eq!(serde_json::to_string(&Gender::NonBinary).unwrap(), "\"non_binary\"");
    }

    #[test]
    fn test_target_accepts() {
        assert!(Target::Anyone.accepts(None));
        assert!(Target::Anyone.accepts(Some(Gender::Male)));
        assert!(Target::Gender(Gender::Male).accepts(Some(Gender::Male)));
        assert!(!Target::Gender(Gender::Male).accepts(Some(Gender::Female)));
        assert!(!Target::Gender(Gender::Male).accepts(None));
        assert_eq!("any".parse::<Target>().unwrap(), Target::Anyone);
        assert_eq!(Target::Gender(Gender::Female).to_string(), "seeking_female");
    }

    #[test]
    fn test_button_callback_data_parses_back() {
        let actions = [
            ButtonAction::FindPartner(Target::Anyone),
            ButtonAction::FindPartner(Target::Gender(Gender::NonBinary)),
            ButtonAction::SetGender(Gender::Female),
            ButtonAction::CancelSearch,
            ButtonAction::NextChat,
            ButtonAction::Admin(AdminAction::RemoveAdmin),
            ButtonAction::ResolveReport(12),
            ButtonAction::DismissReport(0),
        ];
        for action in actions {
            assert_eq!(ButtonAction::parse(&action.callback_data()), Some(action));
        }

        // Legacy callback name from the first bot version
        assert_eq!(
            ButtonAction::parse("find_partner"),
            Some(ButtonAction::FindPartner(Target::Anyone))
        );
        assert_eq!(ButtonAction::parse("resolve_x"), None);
        assert_eq!(ButtonAction::parse("bogus"), None);
    }

    #[test]
    fn test_user_id_parsing() {
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
        assert!("abc".parse::<UserId>().is_err());
    }
}
