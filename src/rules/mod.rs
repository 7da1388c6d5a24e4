//! Mailbox rules
//!
//! A rule pairs a condition set with one action and a priority. Rules are
//! evaluated against envelope data only; message bodies are never fetched.

pub mod actions;
pub mod conditions;
pub mod engine;

pub use actions::{Action, ActionExecutor, ActionReport, ActionStatus, MoveReport, MoveSaga, MoveStep};
pub use conditions::{Conditions, PatternKind, PredicateSet, SizeThreshold, SizeUnit};
pub use engine::RuleEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mail::Message;

/// How rules compete for messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Every enabled rule runs in list order; a message may be hit by several
    #[default]
    Batch,
    /// Rules sorted by priority; each message goes to its first matching rule
    FirstMatch,
}

/// Folder a rule scans when it names none
pub const DEFAULT_RULE_FOLDER: &str = "INBOX";

fn default_enabled() -> bool {
    true
}

/// Rule stored in the database or loaded from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub conditions: Conditions,
    pub action: Action,
}

/// New rule for insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub account_id: i64,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub folder: Option<String>,
    pub conditions: Conditions,
    pub action: Action,
}

impl NewRule {
    pub fn new(account_id: i64, name: impl Into<String>, conditions: Conditions, action: Action) -> Self {
        Self {
            account_id,
            name: name.into(),
            priority: 0,
            enabled: true,
            folder: None,
            conditions,
            action,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn into_rule(self, id: i64) -> Rule {
        Rule {
            id,
            account_id: self.account_id,
            name: self.name,
            priority: self.priority,
            enabled: self.enabled,
            folder: self.folder,
            conditions: self.conditions,
            action: self.action,
        }
    }
}

impl Rule {
    /// Folder this rule applies to, defaulting to INBOX
    pub fn folder_or_inbox(&self) -> &str {
        match self.folder.as_deref() {
            Some(folder) if !folder.is_empty() => folder,
            _ => DEFAULT_RULE_FOLDER,
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.matches_at(message, Utc::now())
    }

    pub fn matches_at(&self, message: &Message, now: DateTime<Utc>) -> bool {
        self.conditions.evaluate_at(message, now)
    }
}

/// Order rules by priority (highest first), then name, then id
pub fn sort_by_priority(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });
}
