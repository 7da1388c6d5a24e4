//! # Mailsweep - In-memory Mail Store
//!
//! Users own folders; folders own messages. Everything a user owns sits
//! behind one read/write lock, so multi-folder operations such as copy see
//! a consistent view. Used for tests and local development in place of a
//! real IMAP server.

mod mailbox;
mod session;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::mail::{FetchRange, Folder, MailError, MailResult, Message, SearchQuery};

pub use mailbox::{FlagOp, MemoryMailbox, NewMessage};
pub use session::{MemoryConnector, MemorySession};

pub const INBOX: &str = "INBOX";

/// Folder counters as reported by STATUS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub messages: usize,
    pub unseen: usize,
    pub next_uid: u32,
}

/// One account's folders
#[derive(Debug)]
pub struct MemoryUser {
    username: String,
    password: String,
    mailboxes: RwLock<BTreeMap<String, MemoryMailbox>>,
    fetch_fault: Mutex<Option<(String, usize)>>,
}

impl MemoryUser {
    fn new(username: &str, password: &str) -> Self {
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert(INBOX.to_string(), MemoryMailbox::new(INBOX));
        Self {
            username: username.to_string(),
            password: password.to_string(),
            mailboxes: RwLock::new(mailboxes),
            fetch_fault: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, MemoryMailbox>> {
        self.mailboxes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, MemoryMailbox>> {
        self.mailboxes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn with_mailbox<T>(&self, name: &str, f: impl FnOnce(&MemoryMailbox) -> T) -> MailResult<T> {
        let mailboxes = self.read();
        let mailbox = mailboxes
            .get(name)
            .ok_or_else(|| MailError::FolderNotFound(name.to_string()))?;
        Ok(f(mailbox))
    }

    fn with_mailbox_mut<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MemoryMailbox) -> MailResult<T>,
    ) -> MailResult<T> {
        let mut mailboxes = self.write();
        let mailbox = mailboxes
            .get_mut(name)
            .ok_or_else(|| MailError::FolderNotFound(name.to_string()))?;
        f(mailbox)
    }

    pub fn list_mailboxes(&self) -> Vec<Folder> {
        self.read().values().map(MemoryMailbox::info).collect()
    }

    pub fn has_mailbox(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn create_mailbox(&self, name: &str) -> MailResult<()> {
        let mut mailboxes = self.write();
        if mailboxes.contains_key(name) {
            return Err(MailError::Protocol(format!("mailbox already exists: {}", name)));
        }
        mailboxes.insert(name.to_string(), MemoryMailbox::new(name));
        Ok(())
    }

    pub fn delete_mailbox(&self, name: &str) -> MailResult<()> {
        if name.eq_ignore_ascii_case(INBOX) {
            return Err(MailError::Protocol("cannot delete INBOX".to_string()));
        }
        self.write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MailError::FolderNotFound(name.to_string()))
    }

    /// Rename keeps messages and the UID counter
    pub fn rename_mailbox(&self, from: &str, to: &str) -> MailResult<()> {
        let mut mailboxes = self.write();
        if mailboxes.contains_key(to) {
            return Err(MailError::Protocol(format!("mailbox already exists: {}", to)));
        }
        let mut mailbox = mailboxes
            .remove(from)
            .ok_or_else(|| MailError::FolderNotFound(from.to_string()))?;
        mailbox.rename(to);
        mailboxes.insert(to.to_string(), mailbox);
        Ok(())
    }

    pub fn set_read_only(&self, name: &str, read_only: bool) -> MailResult<()> {
        self.with_mailbox_mut(name, |mailbox| {
            mailbox.set_read_only(read_only);
            Ok(())
        })
    }

    pub fn status(&self, name: &str) -> MailResult<MailboxStatus> {
        self.with_mailbox(name, |mailbox| MailboxStatus {
            messages: mailbox.count(),
            unseen: mailbox.unseen(),
            next_uid: mailbox.next_uid(),
        })
    }

    pub fn append(&self, name: &str, message: NewMessage) -> MailResult<u32> {
        self.with_mailbox_mut(name, |mailbox| Ok(mailbox.append(message)))
    }

    /// Snapshot of the requested messages
    pub fn fetch(&self, name: &str, range: &FetchRange) -> MailResult<Vec<Message>> {
        self.with_mailbox(name, |mailbox| mailbox.fetch(range))
    }

    pub fn messages(&self, name: &str) -> MailResult<Vec<Message>> {
        self.fetch(name, &FetchRange::All)
    }

    pub fn search(&self, name: &str, query: &SearchQuery) -> MailResult<Vec<u32>> {
        self.with_mailbox(name, |mailbox| mailbox.search(query))
    }

    pub fn update_flags(
        &self,
        name: &str,
        uids: &[u32],
        op: FlagOp,
        flags: &[String],
    ) -> MailResult<()> {
        self.with_mailbox_mut(name, |mailbox| mailbox.update_flags(uids, op, flags))
    }

    /// Copy messages between two folders under a single lock
    pub fn copy(&self, source: &str, uids: &[u32], destination: &str) -> MailResult<()> {
        let mut mailboxes = self.write();
        let copies = mailboxes
            .get(source)
            .ok_or_else(|| MailError::FolderNotFound(source.to_string()))?
            .copies_of(uids);
        let target = mailboxes
            .get_mut(destination)
            .ok_or_else(|| MailError::FolderNotFound(destination.to_string()))?;
        if target.is_read_only() {
            return Err(MailError::ReadOnly(destination.to_string()));
        }
        for message in copies {
            target.append(message);
        }
        Ok(())
    }

    pub fn expunge(&self, name: &str) -> MailResult<Vec<u32>> {
        self.with_mailbox_mut(name, MemoryMailbox::expunge)
    }

    /// Make the next fetch from `folder` fail after `after` messages
    pub fn break_fetch_after(&self, folder: &str, after: usize) {
        *self.fetch_fault.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((folder.to_string(), after));
    }

    pub(crate) fn take_fetch_fault(&self, folder: &str) -> Option<usize> {
        let mut fault = self.fetch_fault.lock().unwrap_or_else(|e| e.into_inner());
        match fault.as_ref() {
            Some((name, after)) if name == folder => {
                let after = *after;
                *fault = None;
                Some(after)
            }
            _ => None,
        }
    }
}

/// Registry of users; cheap to clone and share between connectors.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    users: Arc<RwLock<HashMap<String, Arc<MemoryUser>>>>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with an empty INBOX, replacing any previous one
    pub fn add_user(&self, username: &str, password: &str) -> Arc<MemoryUser> {
        let user = Arc::new(MemoryUser::new(username, password));
        self.users
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), Arc::clone(&user));
        user
    }

    pub fn user(&self, username: &str) -> Option<Arc<MemoryUser>> {
        self.users
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(username)
            .cloned()
    }

    pub fn login(&self, username: &str, password: &str) -> MailResult<Arc<MemoryUser>> {
        match self.user(username) {
            Some(user) if user.password == password => Ok(user),
            _ => Err(MailError::Authentication(format!(
                "invalid credentials for {}",
                username
            ))),
        }
    }

    /// Sessions opened through a connector and not yet dropped
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn session_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_sessions)
    }
}
