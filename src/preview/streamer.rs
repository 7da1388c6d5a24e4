//! Runs one preview and turns pipeline progress into wire frames

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use super::protocol::{PreviewRequest, PreviewStage, ProgressPayload, ServerMessage};
use crate::db::RuleStore;
use crate::mail::Message;
use crate::pipeline::{ApplyPipeline, ProgressObserver};

/// Forwards observer callbacks to a connection's outbound queue
struct StreamObserver<'a> {
    events: &'a Sender<ServerMessage>,
}

impl StreamObserver<'_> {
    /// Waits while the queue is full
    async fn emit(&self, payload: ProgressPayload) {
        // A closed queue means the connection is gone; the caller drops us soon
        let _ = self.events.send(ServerMessage::progress(payload)).await;
    }
}

#[async_trait]
impl ProgressObserver for StreamObserver<'_> {
    async fn connected(&mut self) {
        self.emit(ProgressPayload::new(PreviewStage::Connected, 0, 0, "Connected successfully"))
            .await;
    }

    async fn selecting(&mut self, folder: &str) {
        self.emit(ProgressPayload::new(
            PreviewStage::Selecting,
            0,
            0,
            format!("Selecting folder: {}", folder),
        ))
        .await;
    }

    async fn fetching(&mut self, folder_total: u32) {
        self.emit(ProgressPayload::new(
            PreviewStage::Fetching,
            0,
            folder_total as usize,
            "Fetching messages...",
        ))
        .await;
    }

    async fn processing(&mut self, current: usize, total: usize, message: Option<&Message>) {
        let payload = match message {
            None => ProgressPayload::new(PreviewStage::Processing, 0, total, "Processing rules..."),
            Some(message) => ProgressPayload::new(
                PreviewStage::Processing,
                current,
                total,
                format!("Processing message {} of {}", current, total),
            )
            .with_message(message.clone()),
        };
        self.emit(payload).await;
    }
}

/// Loads the account and its rules, then streams a preview run
pub struct PreviewStreamer {
    store: Arc<dyn RuleStore>,
    pipeline: ApplyPipeline,
}

impl PreviewStreamer {
    pub fn new(store: Arc<dyn RuleStore>, pipeline: ApplyPipeline) -> Self {
        Self { store, pipeline }
    }

    /// Emit every frame of one preview, ending with `result` or `error`.
    ///
    /// Dropping the returned future abandons the run and releases the
    /// mailbox session.
    pub async fn run(&self, request: PreviewRequest, events: &Sender<ServerMessage>) {
        let request = request.normalized();
        let terminal = self.terminal_frame(&request, events).await;
        let _ = events.send(terminal).await;
    }

    async fn terminal_frame(
        &self,
        request: &PreviewRequest,
        events: &Sender<ServerMessage>,
    ) -> ServerMessage {
        let mut observer = StreamObserver { events };
        observer
            .emit(ProgressPayload::new(
                PreviewStage::Connecting,
                0,
                0,
                "Connecting to IMAP server...",
            ))
            .await;

        let account = match self.store.find_account(request.account_id) {
            Ok(Some(account)) => account,
            Ok(None) => return ServerMessage::error("account not found"),
            Err(e) => {
                log::error!("Failed to load account {}: {}", request.account_id, e);
                return ServerMessage::error("account not found");
            }
        };

        let rules = match self.store.list_rules(account.id) {
            Ok(rules) => rules,
            Err(e) => {
                log::error!("Failed to load rules for {}: {}", account.name, e);
                return ServerMessage::error("failed to load rules");
            }
        };

        log::info!(
            "Preview requested for {} ({}, limit {})",
            account.name,
            request.folder,
            request.limit()
        );
        match self
            .pipeline
            .preview(&account, &rules, &request.folder, request.limit(), &mut observer)
            .await
        {
            Ok(result) => ServerMessage::PreviewResult { payload: result },
            Err(e) => ServerMessage::error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewAccount};
    use crate::mailstore::{MemoryBackend, MemoryConnector, NewMessage, INBOX};
    use crate::rules::{Action, Conditions, NewRule, PatternKind};
    use tokio::sync::mpsc;

    fn setup() -> (MemoryBackend, Arc<Database>, i64) {
        let backend = MemoryBackend::new();
        let user = backend.add_user("me@example.com", "pw");
        user.append(INBOX, NewMessage::new("news@shop.com", "Sale")).unwrap();
        user.append(INBOX, NewMessage::new("friend@home.org", "Hi")).unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        let account_id = db
            .add_account(&NewAccount::new("personal", "localhost", "me@example.com", "pw"))
            .unwrap();
        db.add_rule(&NewRule::new(
            account_id,
            "newsletters",
            Conditions::pattern(PatternKind::FromDomain, "shop.com"),
            Action::move_to("News"),
        ))
        .unwrap();
        (backend, db, account_id)
    }

    async fn collect(streamer: &PreviewStreamer, request: PreviewRequest) -> Vec<ServerMessage> {
        let (tx, mut rx) = mpsc::channel(64);
        streamer.run(request, &tx).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn stages(frames: &[ServerMessage]) -> Vec<String> {
        frames
            .iter()
            .map(|frame| match frame {
                ServerMessage::Progress { payload } => serde_json::to_value(payload.stage)
                    .unwrap()
                    .as_str()
                    .unwrap()
                    .to_string(),
                ServerMessage::PreviewResult { .. } => "result".to_string(),
                ServerMessage::Error { error } => format!("error: {}", error),
                ServerMessage::Pong => "pong".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_preview_sequence() {
        let (backend, db, account_id) = setup();
        let streamer = PreviewStreamer::new(db, ApplyPipeline::new(Arc::new(MemoryConnector::new(backend))));

        let frames = collect(&streamer, PreviewRequest::new(account_id)).await;
        assert_eq!(
            stages(&frames),
            vec![
                "connecting",
                "connected",
                "selecting",
                "fetching",
                "processing",
                "processing",
                "processing",
                "result"
            ]
        );

        let ServerMessage::Progress { payload } = &frames[5] else {
            panic!("expected progress");
        };
        // Newest message first
        assert_eq!(payload.message, "Processing message 1 of 2");
        let first = payload.message_data.as_ref().unwrap();
        assert_eq!(first.from, "friend@home.org");
        assert!(first.matched_rule.is_none());

        let ServerMessage::Progress { payload } = &frames[6] else {
            panic!("expected progress");
        };
        let second = payload.message_data.as_ref().unwrap();
        assert_eq!(second.from, "news@shop.com");
        assert_eq!(second.matched_rule.as_ref().unwrap().name, "newsletters");

        let ServerMessage::PreviewResult { payload } = frames.last().unwrap() else {
            panic!("expected result");
        };
        assert_eq!(payload.total_messages, 2);
        assert_eq!(payload.matched_messages, 1);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (backend, db, _) = setup();
        let streamer = PreviewStreamer::new(db, ApplyPipeline::new(Arc::new(MemoryConnector::new(backend))));

        let frames = collect(&streamer, PreviewRequest::new(42)).await;
        assert_eq!(stages(&frames), vec!["connecting", "error: account not found"]);
    }

    #[tokio::test]
    async fn test_connection_failure_is_an_error_frame() {
        let (backend, db, account_id) = setup();
        let streamer = PreviewStreamer::new(
            db,
            ApplyPipeline::new(Arc::new(MemoryConnector::unreachable(backend))),
        );

        let frames = collect(&streamer, PreviewRequest::new(account_id)).await;
        assert_eq!(frames.len(), 2);
        let ServerMessage::Error { error } = &frames[1] else {
            panic!("expected error");
        };
        assert!(error.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_missing_folder() {
        let (backend, db, account_id) = setup();
        let streamer = PreviewStreamer::new(db, ApplyPipeline::new(Arc::new(MemoryConnector::new(backend))));

        let mut request = PreviewRequest::new(account_id);
        request.folder = "Nowhere".to_string();
        let frames = collect(&streamer, request).await;
        assert_eq!(
            stages(&frames),
            vec![
                "connecting",
                "connected",
                "selecting",
                "error: Folder not found: Nowhere"
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_consumer_applies_backpressure() {
        let (backend, db, account_id) = setup();
        let streamer = PreviewStreamer::new(db, ApplyPipeline::new(Arc::new(MemoryConnector::new(backend))));

        // Room for one frame: the run only advances as frames are taken
        let (tx, mut rx) = mpsc::channel(1);
        let reader = async {
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
            }
            frames
        };
        let run = async {
            streamer.run(PreviewRequest::new(account_id), &tx).await;
            drop(tx);
        };
        let ((), frames) = tokio::join!(run, reader);

        assert_eq!(frames.len(), 8);
        assert!(matches!(frames.last(), Some(ServerMessage::PreviewResult { .. })));
    }
}
