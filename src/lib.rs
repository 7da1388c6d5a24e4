//! Mailsweep - rule-based IMAP mailbox cleanup
//!
//! Rules match messages by envelope data and act on them (move, delete,
//! flag). Runs happen in batch from the CLI or scheduler, and a WebSocket
//! endpoint streams a dry first-match preview to a UI.

pub mod config;
pub mod db;
pub mod mail;
pub mod mailstore;
pub mod pipeline;
pub mod preview;
pub mod rules;
pub mod scheduler;

use std::path::PathBuf;

/// Load `.env` and set up logging; `RUST_LOG` overrides the `info` default
pub fn init_logging() {
    dotenvy::dotenv().ok();

    // Tests may initialise more than once
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Database location under the platform data directory
pub fn default_database_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "mailsweep", "mailsweep")?;
    Some(dirs.data_dir().join("mailsweep.db"))
}
