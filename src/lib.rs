//! # Anonymous Chat Matchmaker
//!
//! A Telegram bot that pairs strangers for one-to-one anonymous conversations.
//!
//! ## Features
//!
//! - **Mutual Matching**: Gender-aware pairing where both sides' preferences must agree
//! - **FIFO Fairness**: The longest-waiting compatible user is always matched first
//! - **Anonymous Relay**: Text and media are re-sent without any sender identity
//! - **Moderation**: Reports with evidence, bans that sever live chats, admin roster
//! - **Durable State**: Profiles, counters and reports survive restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anonmatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BotConfiguration::default();
//!     let facade = SessionFacade::in_memory(UserId(12345), &config.session);
//!
//!     let telegram = TelegramConnection::new(TelegramConfig::from_env(&config.telegram)?);
//!     let bot = ChatBot::new(Box::new(telegram), facade, config.dispatch_workers);
//!
//!     bot.start().await?;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod platforms;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::session::SessionFacade;
    pub use crate::bot::ChatBot;
    pub use crate::config::{BotConfiguration, ConfigurationManager};
    pub use crate::platforms::{
        telegram::{TelegramConfig, TelegramConnection},
        PlatformConnection,
    };
    pub use crate::types::{
        ButtonAction, ContentKind, Delivery, Gender, InboundEvent, Notice, Payload, SessionError, Target, UserId,
    };
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
