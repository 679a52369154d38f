#![forbid(unsafe_code)]

//! Twitch ingestion over IRC, plus the credential plumbing that keeps it authenticated.

pub mod badges;
pub mod credential;
pub mod drops;
pub mod irc;
pub mod oauth;
pub mod parse;
pub mod token;


pub use badges::{BadgeEnricher, TwitchBadgeEnricher};
pub use credential::{CredentialReason, CredentialRegister};
pub use irc::{IrcConfig, IrcReceiver, ReceiverError};
pub use oauth::{RefreshAction, RefreshError, RefreshOutcome, TokenRefresher, spawn_auto_refresh};
pub use token::{FileTokenLoader, TokenFileError, TokenReloader, spawn_token_file_watcher};
