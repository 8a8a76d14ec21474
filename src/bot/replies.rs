// src/bot/replies.rs - User-facing text and keyboards for every notice

use chrono::{DateTime, Utc};

use crate::bot::analytics::StatsSnapshot;
use crate::bot::session::UserInfo;
use crate::types::{
    AdminAction, ButtonAction, Gender, Menu, Notice, PendingInput, Report, ReportStatus,
    SessionError, Target, UserState,
};

pub type Keyboard = Vec<Vec<(String, ButtonAction)>>;

const HELP_TEXT: &str = "Available commands:\n\
/start - Show the welcome message\n\
/find [male|female|non_binary] - Look for a partner\n\
/cancel - Stop searching\n\
/next - Leave the current chat and find someone new\n\
/end - End the current chat\n\
/gender - Set your gender\n\
/report <reason> - Report your current partner\n\
/help - Show this message\n\n\
You can also use the buttons below the messages.";

/// Text and keyboard for a notice
pub fn render(notice: &Notice) -> (String, Menu) {
    match notice {
        Notice::Welcome => (
            "👋 Welcome to Anonymous Chat!\n\n\
             Find a random partner and talk without revealing who you are.\n\
             1️⃣ Set your gender (optional, needed to search for a specific gender)\n\
             2️⃣ Press 'Find partner'\n\
             3️⃣ Send text, photos, stickers and more. Press 'End chat' when you are done.\n\n\
             🔒 Your identity stays hidden for the whole conversation."
                .to_string(),
            Menu::Main,
        ),
        Notice::Help => (HELP_TEXT.to_string(), Menu::Main),
        Notice::MainMenu => ("🏠 Main menu\n\nChoose an option:".to_string(), Menu::Main),
        Notice::ChooseTarget => ("Who would you like to talk to?".to_string(), Menu::TargetPicker),
        Notice::ChooseGender => ("Select your gender:".to_string(), Menu::GenderPicker),
        Notice::GenderSaved(gender) => (
            format!("{} Gender saved: {}", gender.emoji(), gender.label()),
            Menu::Main,
        ),
        Notice::Matched { partner_gender } => {
            let who = match partner_gender {
                Some(gender) => format!(" ({} {})", gender.emoji(), gender.label()),
                None => String::new(),
            };
            (
                format!(
                    "🎉 You have a partner{}! Start chatting now. Your identity is anonymous.",
                    who
                ),
                Menu::InChat,
            )
        }
        Notice::Waiting { target } => (
            format!(
                "⏳ Looking for {}...\n\nYou can cancel the search at any time.",
                target_label(*target)
            ),
            Menu::Searching,
        ),
        Notice::SearchCancelled => ("❌ Search cancelled. What would you like to do now?".to_string(), Menu::AfterChat),
        Notice::NotWaiting => ("You are not searching right now.".to_string(), Menu::Main),
        Notice::SearchTimedOut => (
            "⌛ Nobody matched your search in time. Try again or widen your search.".to_string(),
            Menu::AfterChat,
        ),
        Notice::ChatEnded => ("❗ Chat ended. Your partner has been notified.".to_string(), Menu::AfterChat),
        Notice::PartnerLeft => ("❗ Your partner ended the chat.".to_string(), Menu::AfterChat),
        Notice::PartnerRemoved => (
            "❗ Your chat was closed because your partner was removed by a moderator.".to_string(),
            Menu::AfterChat,
        ),
        Notice::NotInChat => ("You are not in a conversation right now.".to_string(), Menu::Main),
        Notice::AskReportReason => (
            "📝 Describe what happened. You can also send a screenshot as evidence.".to_string(),
            Menu::None,
        ),
        Notice::ReportFiled(id) => (
            format!("✅ Report #{} sent. A moderator will review it.", id),
            Menu::InChat,
        ),
        Notice::ReportReceived { id } => (
            format!("🚨 New report #{} is waiting for review. Use /reports to see it.", id),
            Menu::None,
        ),
        Notice::ReportClosed { id, status } => (
            format!("📋 Your report #{} was {}.", id, status_label(*status)),
            Menu::None,
        ),
        Notice::AskUserId(input) => (prompt_for(*input).to_string(), Menu::None),
        Notice::Banned => ("⛔ You have been banned from this bot.".to_string(), Menu::None),
        Notice::Unbanned => ("✅ Your ban has been lifted.".to_string(), Menu::Main),
        Notice::Promoted => ("🛡 You are now an administrator. Use /admin to open the panel.".to_string(), Menu::None),
        Notice::Demoted => ("You are no longer an administrator.".to_string(), Menu::None),
        Notice::AdminPanel => ("🛡 Admin panel".to_string(), Menu::AdminPanel),
        Notice::UnknownCommand => ("Unknown command. Send /help to see what I understand.".to_string(), Menu::Main),
        Notice::Failed(error) => (error_text(error), error_menu(error)),
        Notice::Text { text, menu } => (text.clone(), *menu),
    }
}

pub fn error_text(error: &SessionError) -> String {
    match error {
        SessionError::AlreadyPaired => {
            "You are already in a conversation. End it before looking for someone new.".to_string()
        }
        SessionError::AlreadyWaiting => "You are already on the waiting list. Please wait for a partner.".to_string(),
        SessionError::NotPaired => "You are not in a conversation right now.".to_string(),
        SessionError::Forbidden => "⛔ You are not allowed to do that.".to_string(),
        SessionError::InvalidTarget(reason) => format!("⚠️ {}", capitalize(reason)),
        SessionError::Banned => "⛔ You are banned from this bot.".to_string(),
        SessionError::GenderNotSet => "Set your own gender before searching for a specific gender.".to_string(),
        SessionError::RateLimited { retry_after_secs } => {
            format!("🐢 You are sending messages too fast. Wait {}s.", retry_after_secs)
        }
    }
}

fn error_menu(error: &SessionError) -> Menu {
    match error {
        SessionError::AlreadyPaired => Menu::InChat,
        SessionError::AlreadyWaiting => Menu::Searching,
        SessionError::NotPaired => Menu::Main,
        SessionError::GenderNotSet => Menu::GenderPicker,
        _ => Menu::None,
    }
}

fn prompt_for(input: PendingInput) -> &'static str {
    match input {
        PendingInput::BanTarget => "Send the id of the user to ban.",
        PendingInput::UnbanTarget => "Send the id of the user to unban.",
        PendingInput::AddAdmin => "Send the id of the user to promote.",
        PendingInput::RemoveAdmin => "Send the id of the admin to demote.",
        PendingInput::LookupUser => "Send the id of the user to look up.",
        PendingInput::ReportReason => "Describe what happened.",
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn target_label(target: Target) -> String {
    match target {
        Target::Anyone => "anyone".to_string(),
        Target::Gender(gender) => format!("{} {}", gender.emoji(), gender.label().to_lowercase()),
    }
}

fn status_label(status: ReportStatus) -> &'static str {
    match status {
        ReportStatus::Pending => "pending",
        ReportStatus::Resolved => "resolved",
        ReportStatus::Dismissed => "dismissed",
    }
}

fn gender_label(gender: Option<Gender>) -> String {
    gender.map_or_else(|| "not set".to_string(), |g| format!("{} {}", g.emoji(), g.label()))
}

/// Inline keyboard rows for a menu
pub fn buttons(menu: Menu) -> Keyboard {
    let row = |items: &[(&str, ButtonAction)]| -> Vec<(String, ButtonAction)> {
        items.iter().map(|(label, action)| (label.to_string(), *action)).collect()
    };

    match menu {
        Menu::None => Vec::new(),
        Menu::Main => vec![
            row(&[("🔍 Find partner", ButtonAction::FindPartner(Target::Anyone))]),
            row(&[("🎯 Choose who", ButtonAction::ChooseTarget), ("⚧ My gender", ButtonAction::ChooseGender)]),
            row(&[("ℹ️ Help", ButtonAction::Help)]),
        ],
        Menu::TargetPicker => {
            let mut rows: Keyboard = Gender::ALL
                .iter()
                .map(|g| {
                    vec![(
                        format!("{} {}", g.emoji(), g.label()),
                        ButtonAction::FindPartner(Target::Gender(*g)),
                    )]
                })
                .collect();
            rows.push(row(&[("🎲 Anyone", ButtonAction::FindPartner(Target::Anyone))]));
            rows.push(row(&[("🏠 Main menu", ButtonAction::MainMenu)]));
            rows
        }
        Menu::GenderPicker => {
            let mut rows: Keyboard = Gender::ALL
                .iter()
                .map(|g| vec![(format!("{} {}", g.emoji(), g.label()), ButtonAction::SetGender(*g))])
                .collect();
            rows.push(row(&[("🏠 Main menu", ButtonAction::MainMenu)]));
            rows
        }
        Menu::Searching => vec![row(&[("❌ Cancel search", ButtonAction::CancelSearch)])],
        Menu::InChat => vec![
            row(&[("⏭ Next", ButtonAction::NextChat), ("❌ End chat", ButtonAction::EndChat)]),
            row(&[("🚨 Report", ButtonAction::Report)]),
        ],
        Menu::AfterChat => vec![
            row(&[("🔍 Find another partner", ButtonAction::FindPartner(Target::Anyone))]),
            row(&[("🏠 Main menu", ButtonAction::MainMenu)]),
        ],
        Menu::AdminPanel => vec![
            row(&[
                ("📊 Stats", ButtonAction::Admin(AdminAction::Stats)),
                ("📋 Reports", ButtonAction::Admin(AdminAction::Reports)),
            ]),
            row(&[
                ("⛔ Ban", ButtonAction::Admin(AdminAction::Ban)),
                ("✅ Unban", ButtonAction::Admin(AdminAction::Unban)),
            ]),
            row(&[
                ("➕ Add admin", ButtonAction::Admin(AdminAction::AddAdmin)),
                ("➖ Remove admin", ButtonAction::Admin(AdminAction::RemoveAdmin)),
            ]),
            row(&[("🔎 Look up user", ButtonAction::Admin(AdminAction::Lookup))]),
        ],
        Menu::ReportReview(id) => vec![row(&[
            ("✅ Resolve", ButtonAction::ResolveReport(id)),
            ("🗑 Dismiss", ButtonAction::DismissReport(id)),
        ])],
    }
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (days, rest) = (seconds / 86_400, seconds % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let minutes = rest / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, rest % 60)
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M UTC").to_string()
}

pub fn stats_text(stats: &StatsSnapshot) -> String {
    let mut text = String::from("📊 Bot statistics\n\n");
    text.push_str(&format!("👥 Users: {} ({} active in 24h, {} banned)\n", stats.total_users, stats.daily_active_users, stats.banned_users));
    text.push_str(&format!("💬 Active chats: {}\n", stats.active_chats));
    text.push_str(&format!("⏳ Waiting: {}\n", stats.waiting_users));
    text.push_str(&format!("🔁 Chats started: {}\n", stats.total_chats));
    text.push_str(&format!("✉️ Messages relayed: {}\n", stats.messages_sent));

    let peak_time = stats.peak_time.map_or_else(|| "never".to_string(), format_time);
    text.push_str(&format!("📈 Peak: {} users ({})\n", stats.peak_concurrent_users, peak_time));
    text.push_str(&format!("⏱ Uptime: {}\n", format_duration(stats.uptime_seconds)));

    let sections = [
        ("Gender distribution", &stats.gender_distribution),
        ("Waiting by gender", &stats.waiting_by_gender),
        ("Chatting by gender", &stats.active_by_gender),
    ];
    for (title, counts) in sections {
        if counts.is_empty() {
            continue;
        }
        text.push_str(&format!("\n{}:\n", title));
        for (gender, count) in counts {
            text.push_str(&format!("  {}: {}\n", gender, count));
        }
    }

    if !stats.content_types.is_empty() {
        text.push_str("\nContent relayed:\n");
        for (kind, count) in &stats.content_types {
            text.push_str(&format!("  {}: {}\n", kind.as_str(), count));
        }
    }
    text
}

pub fn report_text(report: &Report) -> String {
    let mut text = format!(
        "🚨 Report #{} ({})\nFrom: {}\nAgainst: {}\nFiled: {}\n",
        report.id,
        status_label(report.status),
        report.reporter_id,
        report.reported_id,
        format_time(report.created_at)
    );
    if !report.reason.is_empty() {
        text.push_str(&format!("Reason: {}\n", report.reason));
    }
    if report.evidence_file_id.is_some() {
        text.push_str("📎 Evidence attached (sent as a photo)\n");
    }
    text
}

pub fn user_info_text(info: &UserInfo) -> String {
    let profile = &info.profile;
    let role = if info.is_super_admin {
        "super admin"
    } else if info.is_admin {
        "admin"
    } else {
        "user"
    };
    let state = match info.state {
        UserState::Idle => "idle".to_string(),
        UserState::Waiting(target) => format!("waiting for {}", target_label(target)),
        UserState::Paired(partner) => format!("chatting with {}", partner),
    };

    format!(
        "🔎 User {}\nGender: {}\nRole: {}\nBanned: {}\nState: {}\nJoined: {}\nLast active: {}\nReports filed: {}\nReports received: {}",
        profile.id,
        gender_label(profile.gender),
        role,
        if profile.banned { "yes" } else { "no" },
        state,
        format_time(profile.joined_at),
        format_time(profile.last_active_at),
        info.reports_filed,
        info.reports_against
    )
}
