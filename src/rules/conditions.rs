//! Rule condition matching logic

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::mail::{Message, SearchQuery};

/// What a rule tests a message against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conditions {
    /// Every populated predicate must hold
    Predicates(PredicateSet),
    /// Single substring pattern against one envelope field
    Pattern {
        #[serde(default)]
        pattern_type: PatternKind,
        pattern: String,
    },
}

impl Conditions {
    pub fn pattern(kind: PatternKind, pattern: impl Into<String>) -> Self {
        Conditions::Pattern {
            pattern_type: kind,
            pattern: pattern.into(),
        }
    }

    pub fn evaluate(&self, message: &Message) -> bool {
        self.evaluate_at(message, Utc::now())
    }

    pub fn evaluate_at(&self, message: &Message, now: DateTime<Utc>) -> bool {
        match self {
            Conditions::Predicates(set) => set.matches_at(message, now),
            Conditions::Pattern {
                pattern_type,
                pattern,
            } => pattern_type.matches(message, pattern),
        }
    }

    /// Date window a server-side search can narrow candidates to
    pub fn search_window(&self, now: DateTime<Utc>) -> Option<SearchQuery> {
        match self {
            Conditions::Predicates(set) => set.search_window(now),
            Conditions::Pattern { .. } => None,
        }
    }
}

/// Envelope field a pattern rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PatternKind {
    #[default]
    Sender,
    Subject,
    FromDomain,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Sender => "sender",
            PatternKind::Subject => "subject",
            PatternKind::FromDomain => "from_domain",
        }
    }

    /// Case-insensitive substring test
    pub fn matches(&self, message: &Message, pattern: &str) -> bool {
        match self {
            PatternKind::Sender => contains_folded(&message.from, pattern),
            PatternKind::Subject => contains_folded(&message.subject, pattern),
            PatternKind::FromDomain => match message.from.rfind('@') {
                Some(at) => {
                    let domain = &message.from[at + 1..];
                    let domain = domain.strip_suffix('>').unwrap_or(domain);
                    contains_folded(domain, pattern)
                }
                None => false,
            },
        }
    }
}

/// Unrecognized kinds fall back to a sender match
impl From<String> for PatternKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "subject" => PatternKind::Subject,
            "from_domain" => PatternKind::FromDomain,
            _ => PatternKind::Sender,
        }
    }
}

impl From<PatternKind> for String {
    fn from(kind: PatternKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Conjunction of optional predicates. Unset fields, empty strings and
/// zero day counts are ignored; an empty set matches every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredicateSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub older_than_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newer_than_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_unread: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_larger_than: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn days(value: Option<u32>) -> Option<i64> {
    value.filter(|d| *d > 0).map(i64::from)
}

fn equals_folded(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl PredicateSet {
    pub fn matches(&self, message: &Message) -> bool {
        self.matches_at(message, Utc::now())
    }

    pub fn matches_at(&self, message: &Message, now: DateTime<Utc>) -> bool {
        if let Some(from) = present(&self.from) {
            if !equals_folded(&message.from, from) {
                return false;
            }
        }
        if let Some(needle) = present(&self.from_contains) {
            if !contains_folded(&message.from, needle) {
                return false;
            }
        }

        if let Some(to) = present(&self.to) {
            if !message.to.iter().any(|r| equals_folded(r, to)) {
                return false;
            }
        }
        if let Some(needle) = present(&self.to_contains) {
            if !message.to.iter().any(|r| contains_folded(r, needle)) {
                return false;
            }
        }

        if let Some(subject) = present(&self.subject) {
            if !equals_folded(&message.subject, subject) {
                return false;
            }
        }
        if let Some(needle) = present(&self.subject_contains) {
            if !contains_folded(&message.subject, needle) {
                return false;
            }
        }

        if let Some(n) = days(self.older_than_days) {
            if message.date > now - Duration::days(n) {
                return false;
            }
        }
        if let Some(n) = days(self.newer_than_days) {
            if message.date < now - Duration::days(n) {
                return false;
            }
        }

        if let Some(want_read) = self.is_read {
            if message.is_read() != want_read {
                return false;
            }
        }
        if let Some(want_unread) = self.is_unread {
            if message.is_read() == want_unread {
                return false;
            }
        }

        if let Some(want) = self.has_attachment {
            if message.has_attachment != want {
                return false;
            }
        }

        if let Some(raw) = present(&self.size_larger_than) {
            match raw.parse::<SizeThreshold>() {
                Ok(threshold) => {
                    if message.size <= threshold.bytes() {
                        return false;
                    }
                }
                Err(e) => {
                    log::warn!("Ignoring message {}: {}", message.uid, e);
                    return false;
                }
            }
        }

        true
    }

    /// Widest date window containing every message the age predicates accept.
    /// IMAP dates are whole days, so the bounds are rounded outward.
    pub fn search_window(&self, now: DateTime<Utc>) -> Option<SearchQuery> {
        let query = SearchQuery {
            before: days(self.older_than_days)
                .and_then(|n| (now - Duration::days(n)).date_naive().succ_opt()),
            since: days(self.newer_than_days).map(|n| (now - Duration::days(n)).date_naive()),
        };
        if query.is_empty() {
            None
        } else {
            Some(query)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    B,
    KB,
    MB,
    GB,
}

impl SizeUnit {
    pub fn multiplier(&self) -> u64 {
        match self {
            SizeUnit::B => 1,
            SizeUnit::KB => 1024,
            SizeUnit::MB => 1024 * 1024,
            SizeUnit::GB => 1024 * 1024 * 1024,
        }
    }
}

/// Size limit such as `10MB`; a bare number counts bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeThreshold {
    pub value: u64,
    pub unit: SizeUnit,
}

impl SizeThreshold {
    pub fn bytes(&self) -> u64 {
        self.value.saturating_mul(self.unit.multiplier())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid size threshold {0:?}")]
pub struct ParseSizeError(pub String);

impl FromStr for SizeThreshold {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase();
        let (number, unit) = if let Some(n) = normalized.strip_suffix("GB") {
            (n, SizeUnit::GB)
        } else if let Some(n) = normalized.strip_suffix("MB") {
            (n, SizeUnit::MB)
        } else if let Some(n) = normalized.strip_suffix("KB") {
            (n, SizeUnit::KB)
        } else if let Some(n) = normalized.strip_suffix('B') {
            (n, SizeUnit::B)
        } else {
            (normalized.as_str(), SizeUnit::B)
        };

        let value = number
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseSizeError(s.to_string()))?;
        Ok(SizeThreshold { value, unit })
    }
}

impl fmt::Display for SizeThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.value, self.unit)
    }
}
