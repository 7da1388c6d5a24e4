//! A single in-memory mailbox.

use chrono::{DateTime, Utc};

use crate::mail::{FetchRange, Folder, MailError, MailResult, Message, SearchQuery, FLAG_DELETED};

/// How a flag update combines with a message's existing flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
    Set,
}

/// Message contents for delivery into a mailbox
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub flags: Vec<String>,
    pub size: u64,
    pub has_attachment: bool,
}

impl NewMessage {
    pub fn new(from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Vec::new(),
            subject: subject.into(),
            date: Utc::now(),
            flags: Vec::new(),
            size: 1024,
            has_attachment: false,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    pub fn dated(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn flagged(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn sized(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_attachment(mut self) -> Self {
        self.has_attachment = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredMessage {
    pub uid: u32,
    pub content: NewMessage,
    /// Soft-delete marker; the message stays until expunged.
    pub deleted: bool,
}

impl StoredMessage {
    fn to_message(&self, sequence_number: u32) -> Message {
        Message {
            uid: self.uid,
            sequence_number,
            from: self.content.from.clone(),
            to: self.content.to.clone(),
            subject: self.content.subject.clone(),
            date: self.content.date,
            flags: self.content.flags.clone(),
            size: self.content.size,
            has_attachment: self.content.has_attachment,
            matched_rule: None,
        }
    }

    fn apply_flags(&mut self, op: FlagOp, flags: &[String]) {
        let current = &mut self.content.flags;
        match op {
            FlagOp::Add => {
                for flag in flags {
                    if !current.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
                        current.push(flag.clone());
                    }
                }
            }
            FlagOp::Remove => {
                current.retain(|f| !flags.iter().any(|r| r.eq_ignore_ascii_case(f)));
            }
            FlagOp::Set => {
                *current = flags.to_vec();
            }
        }

        let names_deleted = flags.iter().any(|f| f.eq_ignore_ascii_case(FLAG_DELETED));
        match op {
            FlagOp::Add if names_deleted => self.deleted = true,
            FlagOp::Remove if names_deleted => self.deleted = false,
            FlagOp::Set => self.deleted = names_deleted,
            _ => {}
        }
    }
}

/// Messages of one folder, in arrival order.
#[derive(Debug, Clone)]
pub struct MemoryMailbox {
    name: String,
    messages: Vec<StoredMessage>,
    next_uid: u32,
    read_only: bool,
}

impl MemoryMailbox {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Vec::new(),
            next_uid: 1,
            read_only: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> Folder {
        Folder::new(self.name.clone())
    }

    pub fn next_uid(&self) -> u32 {
        self.next_uid
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Number of messages not marked for deletion
    pub fn count(&self) -> usize {
        self.messages.iter().filter(|m| !m.deleted).count()
    }

    pub fn unseen(&self) -> usize {
        self.visible()
            .filter(|m| !m.content.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen")))
            .count()
    }

    /// Deliver a message, assigning the next UID
    pub fn append(&mut self, message: NewMessage) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        let deleted = message
            .flags
            .iter()
            .any(|f| f.eq_ignore_ascii_case(FLAG_DELETED));
        self.messages.push(StoredMessage {
            uid,
            content: message,
            deleted,
        });
        uid
    }

    fn visible(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.iter().filter(|m| !m.deleted)
    }

    /// Undeleted messages with sequence numbers recomputed for this listing
    pub fn list(&self) -> Vec<Message> {
        self.visible()
            .zip(1u32..)
            .map(|(stored, seq)| stored.to_message(seq))
            .collect()
    }

    pub fn fetch(&self, range: &FetchRange) -> Vec<Message> {
        let listing = self.list();
        match range {
            FetchRange::All => listing,
            FetchRange::Latest(limit) => {
                let skip = listing.len().saturating_sub(*limit as usize);
                listing.into_iter().skip(skip).collect()
            }
            FetchRange::Uids(uids) => listing
                .into_iter()
                .filter(|m| uids.contains(&m.uid))
                .collect(),
        }
    }

    pub fn search(&self, query: &SearchQuery) -> Vec<u32> {
        self.visible()
            .filter(|m| query.matches(&m.content.date))
            .map(|m| m.uid)
            .collect()
    }

    pub fn update_flags(&mut self, uids: &[u32], op: FlagOp, flags: &[String]) -> MailResult<()> {
        if self.read_only {
            return Err(MailError::ReadOnly(self.name.clone()));
        }
        for message in self.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
            message.apply_flags(op, flags);
        }
        Ok(())
    }

    /// A lone mailbox cannot copy: the destination lives elsewhere.
    /// Copies go through [`super::MemoryUser::copy`], which holds both folders.
    pub fn copy_messages(&self, _uids: &[u32], destination: &str) -> MailResult<()> {
        Err(MailError::Protocol(format!(
            "copy from {} to {} must go through the owning user",
            self.name, destination
        )))
    }

    pub(crate) fn copies_of(&self, uids: &[u32]) -> Vec<NewMessage> {
        self.visible()
            .filter(|m| uids.contains(&m.uid))
            .map(|m| {
                let mut content = m.content.clone();
                content.flags.retain(|f| !f.eq_ignore_ascii_case(FLAG_DELETED));
                content
            })
            .collect()
    }

    /// Physically remove messages marked deleted; returns their UIDs
    pub fn expunge(&mut self) -> MailResult<Vec<u32>> {
        if self.read_only {
            return Err(MailError::ReadOnly(self.name.clone()));
        }
        let removed = self
            .messages
            .iter()
            .filter(|m| m.deleted)
            .map(|m| m.uid)
            .collect();
        self.messages.retain(|m| !m.deleted);
        Ok(removed)
    }
}
