// Auction session client - library root

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod profile;
pub mod retry;

pub use client::SessionClient;
pub use error::{ClientError, RefreshFailure, Result};
pub use events::{LogoutReason, SessionEvent};
