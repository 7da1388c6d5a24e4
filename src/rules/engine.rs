//! Rule engine - decides which rule claims a message

use chrono::{DateTime, Utc};

use super::{sort_by_priority, Rule};
use crate::mail::Message;

/// First-match evaluation over a fixed, priority-ordered rule list.
///
/// Disabled rules are dropped on construction. Each message is claimed by
/// at most one rule: the first whose conditions hold.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    now: DateTime<Utc>,
}

impl RuleEngine {
    /// Rules are evaluated in the given order
    pub fn new(rules: &[Rule]) -> Self {
        Self {
            rules: rules.iter().filter(|r| r.enabled).cloned().collect(),
            now: Utc::now(),
        }
    }

    /// Rules are re-sorted by priority (highest first), then name
    pub fn by_priority(rules: &[Rule]) -> Self {
        let mut engine = Self::new(rules);
        sort_by_priority(&mut engine.rules);
        engine
    }

    /// Evaluate age predicates against a fixed instant
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Test if a single rule matches a message
    pub fn test_rule(&self, rule: &Rule, message: &Message) -> bool {
        rule.matches_at(message, self.now)
    }

    pub fn first_match(&self, message: &Message) -> Option<&Rule> {
        self.rules.iter().find(|rule| self.test_rule(rule, message))
    }

    /// Annotate the message with its claiming rule and return that rule's id
    pub fn classify(&self, message: &mut Message) -> Option<i64> {
        let rule = self.first_match(message)?.clone();
        let id = rule.id;
        log::debug!("Rule '{}' (ID: {}) matched message {}", rule.name, id, message.uid);
        message.matched_rule = Some(rule);
        Some(id)
    }

    /// Every message one rule matches, ignoring other rules
    pub fn matching<'m>(&self, rule: &Rule, messages: &'m [Message]) -> Vec<&'m Message> {
        messages
            .iter()
            .filter(|message| self.test_rule(rule, message))
            .collect()
    }
}
