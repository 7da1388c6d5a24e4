//! Mailbox sessions backed by [`MemoryBackend`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{FlagOp, MemoryBackend, MemoryUser, INBOX};
use crate::mail::{
    Account, FetchRequest, FetchStream, Folder, MailError, MailResult, MailboxConnector,
    MailboxSession, Message, SearchQuery,
};

/// Messages buffered between the fetch producer and its consumer
const FETCH_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Online,
    Unreachable,
    Stalled,
}

/// Hands out [`MemorySession`]s for accounts whose credentials match a
/// user registered in the backend. The account's host and port are ignored.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    mode: ConnectMode,
}

impl MemoryConnector {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            mode: ConnectMode::Online,
        }
    }

    /// Every connect attempt is refused
    pub fn unreachable(backend: MemoryBackend) -> Self {
        Self {
            backend,
            mode: ConnectMode::Unreachable,
        }
    }

    /// Every connect attempt hangs forever
    pub fn stalled(backend: MemoryBackend) -> Self {
        Self {
            backend,
            mode: ConnectMode::Stalled,
        }
    }
}

#[async_trait]
impl MailboxConnector for MemoryConnector {
    async fn connect(&self, account: &Account) -> MailResult<Box<dyn MailboxSession>> {
        match self.mode {
            ConnectMode::Unreachable => {
                return Err(MailError::Connection(format!(
                    "{}: connection refused",
                    account.address()
                )))
            }
            ConnectMode::Stalled => futures::future::pending::<()>().await,
            ConnectMode::Online => {}
        }

        let user = self.backend.login(&account.username, &account.password)?;
        log::debug!("Memory session opened for {}", account.username);
        Ok(Box::new(MemorySession::new(user, self.backend.session_counter())))
    }
}

/// A logged-in view of one [`MemoryUser`]
pub struct MemorySession {
    user: Arc<MemoryUser>,
    selected: Option<String>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemorySession {
    fn new(user: Arc<MemoryUser>, open_sessions: Arc<AtomicUsize>) -> Self {
        open_sessions.fetch_add(1, Ordering::SeqCst);
        Self {
            user,
            selected: None,
            open_sessions,
        }
    }

    fn selected(&self) -> String {
        self.selected.clone().unwrap_or_else(|| INBOX.to_string())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Feed `messages` through a bounded channel from a producer task
fn spawn_producer(
    messages: Vec<Message>,
    fail_after: Option<usize>,
) -> (mpsc::Receiver<MailResult<Message>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(FETCH_QUEUE_DEPTH);
    let producer = tokio::spawn(async move {
        for (i, message) in messages.into_iter().enumerate() {
            if fail_after == Some(i) {
                let _ = tx
                    .send(Err(MailError::Protocol("connection reset during fetch".to_string())))
                    .await;
                return;
            }
            if tx.send(Ok(message)).await.is_err() {
                log::debug!("Fetch consumer went away, stopping producer");
                return;
            }
        }
    });
    (rx, producer)
}

#[async_trait]
impl MailboxSession for MemorySession {
    async fn list_folders(&mut self) -> MailResult<Vec<Folder>> {
        Ok(self.user.list_mailboxes())
    }

    async fn select_folder(&mut self, name: &str) -> MailResult<u32> {
        let status = self.user.status(name)?;
        self.selected = Some(name.to_string());
        Ok(status.messages as u32)
    }

    async fn fetch<'a>(&'a mut self, request: FetchRequest) -> MailResult<FetchStream<'a>> {
        let folder = self.selected();
        let messages = self.user.fetch(&folder, &request.range)?;
        let fail_after = self.user.take_fetch_fault(&folder);
        let (rx, producer) = spawn_producer(messages, fail_after);

        // The stream ends only once the producer has finished; a producer
        // that dies without reporting surfaces as a final error.
        let state = (rx, Some(producer));
        Ok(stream::unfold(state, |(mut rx, producer)| async move {
            if let Some(item) = rx.recv().await {
                return Some((item, (rx, producer)));
            }
            let producer = match producer {
                Some(producer) => producer,
                None => return None,
            };
            match producer.await {
                Ok(()) => None,
                Err(e) => Some((
                    Err(MailError::Protocol(format!("fetch producer failed: {}", e))),
                    (rx, None),
                )),
            }
        })
        .boxed())
    }

    async fn search(&mut self, query: SearchQuery) -> MailResult<Vec<u32>> {
        self.user.search(&self.selected(), &query)
    }

    async fn set_flags(&mut self, uids: &[u32], flags: &[String], add: bool) -> MailResult<()> {
        let op = if add { FlagOp::Add } else { FlagOp::Remove };
        self.user.update_flags(&self.selected(), uids, op, flags)
    }

    async fn copy(&mut self, uids: &[u32], destination: &str) -> MailResult<()> {
        self.user.copy(&self.selected(), uids, destination)
    }

    async fn expunge(&mut self) -> MailResult<()> {
        let removed = self.user.expunge(&self.selected())?;
        log::debug!("Expunged {} messages", removed.len());
        Ok(())
    }

    async fn create_folder(&mut self, name: &str) -> MailResult<()> {
        self.user.create_mailbox(name)
    }

    async fn logout(&mut self) -> MailResult<()> {
        self.selected = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailstore::NewMessage;

    fn setup(messages: usize) -> (MemoryBackend, Account) {
        let backend = MemoryBackend::new();
        let user = backend.add_user("alice@example.com", "pw");
        for i in 0..messages {
            user.append(INBOX, NewMessage::new("a@example.com", format!("m{}", i)))
                .unwrap();
        }
        let account = Account::new(1, "alice", "localhost", "alice@example.com", "pw", false);
        (backend, account)
    }

    async fn drain(session: &mut dyn MailboxSession, request: FetchRequest) -> Vec<MailResult<Message>> {
        let stream = session.fetch(request).await.unwrap();
        stream.collect().await
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_credentials() {
        let (backend, mut account) = setup(0);
        account.password = "nope".to_string();

        let result = MemoryConnector::new(backend).connect(&account).await;
        assert!(matches!(result, Err(MailError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_fetch_streams_every_message_in_order() {
        let (backend, account) = setup(25);
        let mut session = MemoryConnector::new(backend).connect(&account).await.unwrap();

        assert_eq!(session.select_folder(INBOX).await.unwrap(), 25);
        let items = drain(session.as_mut(), FetchRequest::all()).await;

        let uids: Vec<u32> = items.into_iter().map(|m| m.unwrap().uid).collect();
        assert_eq!(uids, (1..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fetch_error_is_last_item() {
        let (backend, account) = setup(5);
        backend.user("alice@example.com").unwrap().break_fetch_after(INBOX, 2);
        let mut session = MemoryConnector::new(backend).connect(&account).await.unwrap();
        session.select_folder(INBOX).await.unwrap();

        let items = drain(session.as_mut(), FetchRequest::all()).await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(matches!(items[2], Err(MailError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_select_missing_folder() {
        let (backend, account) = setup(0);
        let mut session = MemoryConnector::new(backend).connect(&account).await.unwrap();

        assert!(matches!(
            session.select_folder("Nope").await,
            Err(MailError::FolderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_counter_tracks_drops() {
        let (backend, account) = setup(0);
        let connector = MemoryConnector::new(backend.clone());

        let first = connector.connect(&account).await.unwrap();
        let second = connector.connect(&account).await.unwrap();
        assert_eq!(backend.open_sessions(), 2);

        drop(first);
        drop(second);
        assert_eq!(backend.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_connector() {
        let (backend, account) = setup(0);
        let result = MemoryConnector::unreachable(backend).connect(&account).await;
        assert!(matches!(result, Err(MailError::Connection(_))));
    }

    #[tokio::test]
    async fn test_flags_copy_and_expunge_through_session() {
        let (backend, account) = setup(3);
        let user = backend.user("alice@example.com").unwrap();
        user.create_mailbox("Archive").unwrap();
        let mut session = MemoryConnector::new(backend).connect(&account).await.unwrap();
        session.select_folder(INBOX).await.unwrap();

        session.copy(&[2], "Archive").await.unwrap();
        session
            .set_flags(&[2], &["\\Deleted".to_string()], true)
            .await
            .unwrap();
        session.expunge().await.unwrap();

        assert_eq!(user.status(INBOX).unwrap().messages, 2);
        assert_eq!(user.messages("Archive").unwrap()[0].subject, "m1");
    }
}
