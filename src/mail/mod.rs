//! # Mailsweep - Mail Module
//!
//! Message model plus the session contract every mailbox backend implements.
//! The IMAP client lives in [`async_imap`]; the in-memory backend lives in
//! [`crate::mailstore`].

pub mod async_imap;
pub mod config;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::rules::Rule;

// Re-export commonly used types
pub use self::async_imap::{AsyncImapClient, ImapConnector};
pub use config::{Account, SecurityType};

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Unified error type for mail operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection timeout after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Mailbox is read-only: {0}")]
    ReadOnly(String),

    #[error("IMAP error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Failures that happen before a session exists
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            MailError::Connection(_)
                | MailError::Authentication(_)
                | MailError::Timeout(_)
                | MailError::Io(_)
        )
    }
}

pub const FLAG_SEEN: &str = "\\Seen";
pub const FLAG_FLAGGED: &str = "\\Flagged";
pub const FLAG_DELETED: &str = "\\Deleted";

/// Email folder representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub delimiter: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<String>,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delimiter: "/".to_string(),
            attributes: Vec::new(),
        }
    }
}

/// Envelope-level view of one message in a selected folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uid: u32,
    /// Position in the folder; only valid until the next expunge.
    pub sequence_number: u32,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub size: u64,
    #[serde(default)]
    pub has_attachment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<Rule>,
}

impl Message {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    pub fn is_read(&self) -> bool {
        self.has_flag(FLAG_SEEN)
    }

    pub fn is_flagged(&self) -> bool {
        self.has_flag(FLAG_FLAGGED)
    }
}

/// Which messages of the selected folder a fetch covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRange {
    All,
    /// The `n` highest sequence numbers; `Latest(0)` means everything.
    Latest(u32),
    Uids(Vec<u32>),
}

/// Message attributes a fetch should retrieve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchFields {
    pub envelope: bool,
    pub flags: bool,
    pub size: bool,
    pub structure: bool,
}

impl FetchFields {
    pub const ALL: FetchFields = FetchFields {
        envelope: true,
        flags: true,
        size: true,
        structure: true,
    };

    /// IMAP fetch item list; UID and INTERNALDATE are always requested.
    pub fn imap_query(&self) -> String {
        let mut items = vec!["UID", "INTERNALDATE"];
        if self.flags {
            items.push("FLAGS");
        }
        if self.envelope {
            items.push("ENVELOPE");
        }
        if self.size {
            items.push("RFC822.SIZE");
        }
        if self.structure {
            items.push("BODYSTRUCTURE");
        }
        format!("({})", items.join(" "))
    }
}

impl Default for FetchFields {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub range: FetchRange,
    pub fields: FetchFields,
}

impl FetchRequest {
    pub fn all() -> Self {
        Self {
            range: FetchRange::All,
            fields: FetchFields::ALL,
        }
    }

    pub fn latest(limit: u32) -> Self {
        let range = if limit == 0 {
            FetchRange::All
        } else {
            FetchRange::Latest(limit)
        };
        Self {
            range,
            fields: FetchFields::ALL,
        }
    }

    pub fn uids(uids: Vec<u32>) -> Self {
        Self {
            range: FetchRange::Uids(uids),
            fields: FetchFields::ALL,
        }
    }
}

/// Server-side date narrowing. `before` is exclusive, `since` inclusive,
/// both at day granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub before: Option<NaiveDate>,
    pub since: Option<NaiveDate>,
}

impl SearchQuery {
    pub fn is_empty(&self) -> bool {
        self.before.is_none() && self.since.is_none()
    }

    pub fn matches(&self, date: &DateTime<Utc>) -> bool {
        let day = date.date_naive();
        if let Some(before) = self.before {
            if day >= before {
                return false;
            }
        }
        if let Some(since) = self.since {
            if day < since {
                return false;
            }
        }
        true
    }
}

/// Messages in arrival order. A failure ends the stream as its last item.
pub type FetchStream<'a> = BoxStream<'a, MailResult<Message>>;

/// One authenticated connection to a mailbox server.
///
/// Folder-scoped operations act on the most recently selected folder and
/// address messages by UID. Sequence numbers reported by a fetch are not
/// stable across `expunge`.
#[async_trait]
pub trait MailboxSession: Send {
    async fn list_folders(&mut self) -> MailResult<Vec<Folder>>;

    /// Select a folder for the following operations and return its message count.
    async fn select_folder(&mut self, name: &str) -> MailResult<u32>;

    async fn fetch<'a>(&'a mut self, request: FetchRequest) -> MailResult<FetchStream<'a>>;

    async fn search(&mut self, query: SearchQuery) -> MailResult<Vec<u32>>;

    /// Add (`add == true`) or remove flags on the given UIDs
    async fn set_flags(&mut self, uids: &[u32], flags: &[String], add: bool) -> MailResult<()>;

    async fn copy(&mut self, uids: &[u32], destination: &str) -> MailResult<()>;

    async fn expunge(&mut self) -> MailResult<()>;

    async fn create_folder(&mut self, name: &str) -> MailResult<()>;

    async fn logout(&mut self) -> MailResult<()>;
}

/// Opens sessions for accounts
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, account: &Account) -> MailResult<Box<dyn MailboxSession>>;
}
