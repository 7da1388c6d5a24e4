//! Apply pipeline: connect, select, fetch, match, act, report.
//!
//! Two entry points share the same session handling. The batch run lets
//! every enabled rule act on every message it matches; the first-match run
//! assigns each message to a single rule and powers the live preview.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::mail::{
    Account, FetchRequest, Folder, MailError, MailResult, MailboxConnector, MailboxSession,
    Message,
};
use crate::rules::{ActionExecutor, ActionReport, MatchStrategy, Rule, RuleEngine, DEFAULT_RULE_FOLDER};

/// Upper bound for establishing a session
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a pipeline run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Connected,
    FolderSelected,
    Matching,
    Acting,
    Reported,
    Failed,
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Reported | PipelineStage::Failed)
    }

    pub fn can_advance_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Connected) => true,
            // A batch run selects a folder per rule
            (Connected | FolderSelected | Matching | Acting, FolderSelected) => true,
            (FolderSelected, Matching) => true,
            (Matching, Acting) => true,
            (Connected | FolderSelected | Matching | Acting, Reported) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Records stage transitions for one run
#[derive(Debug)]
struct StageTracker<'a> {
    account: &'a str,
    stage: PipelineStage,
}

impl<'a> StageTracker<'a> {
    fn new(account: &'a str) -> Self {
        Self {
            account,
            stage: PipelineStage::Idle,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        if !self.stage.can_advance_to(next) {
            log::warn!(
                "[{}] unexpected pipeline transition {} -> {}",
                self.account,
                self.stage,
                next
            );
        }
        log::debug!("[{}] {} -> {}", self.account, self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, error: &MailError) {
        log::error!("[{}] pipeline failed during {}: {}", self.account, self.stage, error);
        self.stage = PipelineStage::Failed;
    }
}

/// Hooks for observing a preview as it runs. All methods default to no-ops.
/// The run waits for each hook, so a slow observer slows the run down.
#[async_trait]
pub trait ProgressObserver: Send {
    async fn connected(&mut self) {}

    async fn selecting(&mut self, _folder: &str) {}

    async fn fetching(&mut self, _folder_total: u32) {}

    /// Called once with `message == None` before the first message, then
    /// once per processed message, newest first.
    async fn processing(&mut self, _current: usize, _total: usize, _message: Option<&Message>) {}
}

#[async_trait]
impl ProgressObserver for () {}

/// Aggregate outcome of a first-match pass over a folder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewResult {
    pub total_messages: usize,
    pub matched_messages: usize,
    /// Newest first
    pub messages: Vec<Message>,
    pub rule_matches: BTreeMap<i64, usize>,
}

impl PreviewResult {
    /// UIDs claimed by each rule, in rule order
    pub fn uids_by_rule(&self, rules: &[Rule]) -> Vec<(Rule, Vec<u32>)> {
        rules
            .iter()
            .filter_map(|rule| {
                let mut uids: Vec<u32> = self
                    .messages
                    .iter()
                    .filter(|m| m.matched_rule.as_ref().map(|r| r.id) == Some(rule.id))
                    .map(|m| m.uid)
                    .collect();
                if uids.is_empty() {
                    return None;
                }
                uids.sort_unstable();
                Some((rule.clone(), uids))
            })
            .collect()
    }
}

/// Action taken for one rule during a first-match apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleActionReport {
    pub rule_id: i64,
    pub rule_name: String,
    pub report: ActionReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstMatchReport {
    pub preview: PreviewResult,
    pub actions: Vec<RuleActionReport>,
}

impl FirstMatchReport {
    /// One run report per rule that claimed messages in `folder`
    pub fn rule_reports(self, folder: &str) -> Vec<RuleRunReport> {
        let scanned = self.preview.total_messages;
        self.actions
            .into_iter()
            .map(|a| RuleRunReport {
                rule_id: a.rule_id,
                rule_name: a.rule_name,
                folder: folder.to_string(),
                scanned,
                matched: a.report.uids.len(),
                action: Some(a.report),
                error: None,
            })
            .collect()
    }
}

/// What one batch rule did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRunReport {
    pub rule_id: i64,
    pub rule_name: String,
    pub folder: String,
    pub scanned: usize,
    pub matched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RuleRunReport {
    fn new(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            folder: rule.folder_or_inbox().to_string(),
            scanned: 0,
            matched: 0,
            action: None,
            error: None,
        }
    }

    fn failed(mut self, error: &MailError) -> Self {
        log::error!("Rule '{}' failed on {}: {}", self.rule_name, self.folder, error);
        self.error = Some(error.to_string());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.action.as_ref().is_some_and(ActionReport::is_failure)
    }
}

/// Batch outcome for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountReport {
    pub account_id: i64,
    pub account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rules: Vec<RuleRunReport>,
}

impl AccountReport {
    fn new(account: &Account) -> Self {
        Self {
            account_id: account.id,
            account_name: account.name.clone(),
            error: None,
            rules: Vec::new(),
        }
    }

    /// One entry per rule that claimed messages in `folder`
    pub fn from_first_match(account: &Account, folder: &str, applied: FirstMatchReport) -> Self {
        Self {
            rules: applied.rule_reports(folder),
            ..Self::new(account)
        }
    }

    fn unreachable(mut self, error: &MailError) -> Self {
        if error.is_connection_failure() {
            log::warn!("Account {} unreachable, moving on: {}", self.account_name, error);
        } else {
            log::error!("Account {} failed: {}", self.account_name, error);
        }
        self.error = Some(error.to_string());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.rules.iter().any(RuleRunReport::is_failure)
    }
}

/// Batch outcome across accounts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub accounts: Vec<AccountReport>,
    /// Rules whose account is not configured
    pub skipped_rules: Vec<String>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.accounts.iter().any(AccountReport::is_failure)
    }

    pub fn matched(&self) -> usize {
        self.accounts
            .iter()
            .flat_map(|a| a.rules.iter())
            .map(|r| r.matched)
            .sum()
    }
}

/// Result of a connection check; failures are data, not errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub total_emails: u32,
}

impl ConnectionStatus {
    fn failure(error: &MailError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            folders: Vec::new(),
            total_emails: 0,
        }
    }
}

/// Drives rule runs against mailbox sessions
#[derive(Clone)]
pub struct ApplyPipeline {
    connector: Arc<dyn MailboxConnector>,
    connect_timeout: Duration,
    executor: ActionExecutor,
}

impl ApplyPipeline {
    pub fn new(connector: Arc<dyn MailboxConnector>) -> Self {
        Self {
            connector,
            connect_timeout: CONNECT_TIMEOUT,
            executor: ActionExecutor::new(false),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Record what would happen instead of mutating mailboxes
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.executor = ActionExecutor::new(dry_run);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    /// Open a session, bounded by the connect timeout
    pub async fn connect(&self, account: &Account) -> MailResult<Box<dyn MailboxSession>> {
        if let Err(errors) = account.validate() {
            return Err(MailError::Connection(format!(
                "account {} is incomplete: {}",
                account.name,
                errors.join(", ")
            )));
        }
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(account)).await {
            Ok(result) => result,
            Err(_) => Err(MailError::Timeout(self.connect_timeout)),
        }
    }

    async fn close(&self, mut session: Box<dyn MailboxSession>) {
        if let Err(e) = session.logout().await {
            log::debug!("Logout failed: {}", e);
        }
    }

    pub async fn test_connection(&self, account: &Account) -> ConnectionStatus {
        let check = async {
            let mut session = self.connect(account).await?;
            let folders = session.list_folders().await;
            let total = session.select_folder(DEFAULT_RULE_FOLDER).await;
            self.close(session).await;
            Ok::<_, MailError>((folders?, total?))
        };

        match tokio::time::timeout(self.connect_timeout, check).await {
            Ok(Ok((folders, total_emails))) => ConnectionStatus {
                success: true,
                message: "Connection successful".to_string(),
                folders,
                total_emails,
            },
            Ok(Err(e)) => ConnectionStatus::failure(&e),
            Err(_) => ConnectionStatus::failure(&MailError::Timeout(self.connect_timeout)),
        }
    }

    /// Dispatch on the rules' strategy
    pub async fn apply(&self, account: &Account, rules: &[Rule], strategy: MatchStrategy) -> AccountReport {
        match strategy {
            MatchStrategy::Batch => self.run_batch(account, rules).await,
            MatchStrategy::FirstMatch => self.run_first_match(account, rules).await,
        }
    }

    /// First-match over each folder the account's enabled rules name. Rules
    /// only compete with rules watching the same folder.
    async fn run_first_match(&self, account: &Account, rules: &[Rule]) -> AccountReport {
        let mut by_folder: BTreeMap<&str, Vec<Rule>> = BTreeMap::new();
        for rule in rules.iter().filter(|r| r.enabled && r.account_id == account.id) {
            by_folder
                .entry(rule.folder_or_inbox())
                .or_default()
                .push(rule.clone());
        }

        let mut report = AccountReport::new(account);
        for (folder, folder_rules) in by_folder {
            match self.apply_first_match(account, &folder_rules, folder).await {
                Ok(applied) => report.rules.extend(applied.rule_reports(folder)),
                Err(e) if e.is_connection_failure() => return report.unreachable(&e),
                Err(e) => report
                    .rules
                    .extend(folder_rules.iter().map(|rule| RuleRunReport::new(rule).failed(&e))),
            }
        }
        report
    }

    /// First-match pass over the newest `limit` messages (0 = all) of `folder`.
    /// Nothing is mutated.
    pub async fn preview(
        &self,
        account: &Account,
        rules: &[Rule],
        folder: &str,
        limit: u32,
        observer: &mut dyn ProgressObserver,
    ) -> MailResult<PreviewResult> {
        let mut tracker = StageTracker::new(&account.name);
        let mut session = match self.connect(account).await {
            Ok(session) => session,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };
        tracker.advance(PipelineStage::Connected);
        observer.connected().await;

        let engine = RuleEngine::by_priority(rules);
        let outcome = preview_session(session.as_mut(), &engine, folder, limit, observer, &mut tracker).await;
        self.close(session).await;

        match outcome {
            Ok(result) => {
                tracker.advance(PipelineStage::Reported);
                log::info!(
                    "Preview of {} for {}: {} of {} messages matched",
                    folder,
                    account.name,
                    result.matched_messages,
                    result.total_messages
                );
                Ok(result)
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    /// Preview the whole folder, then run each claiming rule's action on the
    /// messages it claimed, highest priority first.
    pub async fn apply_first_match(
        &self,
        account: &Account,
        rules: &[Rule],
        folder: &str,
    ) -> MailResult<FirstMatchReport> {
        let mut tracker = StageTracker::new(&account.name);
        let mut session = match self.connect(account).await {
            Ok(session) => session,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };
        tracker.advance(PipelineStage::Connected);

        let engine = RuleEngine::by_priority(rules);
        let preview = match preview_session(session.as_mut(), &engine, folder, 0, &mut (), &mut tracker).await {
            Ok(preview) => preview,
            Err(e) => {
                tracker.fail(&e);
                self.close(session).await;
                return Err(e);
            }
        };

        let claimed = preview.uids_by_rule(engine.rules());
        if !claimed.is_empty() {
            tracker.advance(PipelineStage::Acting);
        }
        let mut actions = Vec::new();
        for (rule, uids) in claimed {
            log::info!("Rule '{}' claimed {} messages", rule.name, uids.len());
            let report = self.executor.execute(session.as_mut(), &uids, &rule.action).await;
            actions.push(RuleActionReport {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                report,
            });
        }

        self.close(session).await;
        tracker.advance(PipelineStage::Reported);
        Ok(FirstMatchReport { preview, actions })
    }

    /// Run every enabled rule of this account, in order, against its folder.
    /// Per-rule failures are recorded and the run continues.
    pub async fn run_batch(&self, account: &Account, rules: &[Rule]) -> AccountReport {
        let mut report = AccountReport::new(account);
        let rules: Vec<&Rule> = rules
            .iter()
            .filter(|r| r.enabled && r.account_id == account.id)
            .collect();

        let mut tracker = StageTracker::new(&account.name);
        let mut session = match self.connect(account).await {
            Ok(session) => session,
            Err(e) => {
                tracker.fail(&e);
                return report.unreachable(&e);
            }
        };
        tracker.advance(PipelineStage::Connected);

        for rule in rules {
            log::info!("Executing rule: {}", rule.name);
            let outcome = self.run_rule(session.as_mut(), rule, &mut tracker).await;
            report.rules.push(outcome);
        }

        self.close(session).await;
        tracker.advance(PipelineStage::Reported);
        report
    }

    async fn run_rule(
        &self,
        session: &mut dyn MailboxSession,
        rule: &Rule,
        tracker: &mut StageTracker<'_>,
    ) -> RuleRunReport {
        let report = RuleRunReport::new(rule);
        let now = Utc::now();

        let count = match session.select_folder(rule.folder_or_inbox()).await {
            Ok(count) => count,
            Err(e) => return report.failed(&e),
        };
        tracker.advance(PipelineStage::FolderSelected);
        if count == 0 {
            log::info!("No messages in {}", report.folder);
            return report;
        }

        let request = match rule.conditions.search_window(now) {
            Some(window) => match session.search(window).await {
                Ok(uids) if uids.is_empty() => {
                    log::info!("Search found no candidates in {}", report.folder);
                    return report;
                }
                Ok(uids) => {
                    log::debug!("Search narrowed {} to {} candidates", report.folder, uids.len());
                    FetchRequest::uids(uids)
                }
                Err(e) => return report.failed(&e),
            },
            None => FetchRequest::all(),
        };

        tracker.advance(PipelineStage::Matching);
        let mut report = report;
        let mut matched = Vec::new();
        {
            let mut messages = match session.fetch(request).await {
                Ok(messages) => messages,
                Err(e) => return report.failed(&e),
            };
            while let Some(item) = messages.next().await {
                match item {
                    Ok(message) => {
                        report.scanned += 1;
                        if rule.matches_at(&message, now) {
                            log::debug!("Rule '{}' matched message {}", rule.name, message.uid);
                            matched.push(message.uid);
                        }
                    }
                    Err(e) => return report.failed(&e),
                }
            }
        }

        report.matched = matched.len();
        log::info!("Matched {} messages", matched.len());
        if matched.is_empty() {
            return report;
        }

        tracker.advance(PipelineStage::Acting);
        report.action = Some(self.executor.execute(session, &matched, &rule.action).await);
        report
    }

    /// Batch-run every account that has rules. Accounts run one at a time and
    /// a failing account never stops the others.
    pub async fn run_batch_all(&self, accounts: &[Account], rules: &[Rule]) -> BatchReport {
        log::info!("Starting rule execution...");
        let mut report = BatchReport::default();

        for rule in rules {
            if !accounts.iter().any(|a| a.id == rule.account_id) {
                log::warn!("Account not found for rule {}", rule.name);
                report.skipped_rules.push(rule.name.clone());
            }
        }

        for account in accounts {
            if !rules.iter().any(|r| r.account_id == account.id) {
                continue;
            }
            report.accounts.push(self.run_batch(account, rules).await);
        }

        log::info!("Rule execution completed, {} messages matched", report.matched());
        report
    }
}

/// Select, fetch and classify on an open session. Messages are classified
/// newest first.
async fn preview_session(
    session: &mut dyn MailboxSession,
    engine: &RuleEngine,
    folder: &str,
    limit: u32,
    observer: &mut dyn ProgressObserver,
    tracker: &mut StageTracker<'_>,
) -> MailResult<PreviewResult> {
    observer.selecting(folder).await;
    let count = session.select_folder(folder).await?;
    tracker.advance(PipelineStage::FolderSelected);

    observer.fetching(count).await;
    let mut fetched = Vec::new();
    {
        let mut messages = session.fetch(FetchRequest::latest(limit)).await?;
        while let Some(item) = messages.next().await {
            fetched.push(item?);
        }
    }
    fetched.sort_by(|a, b| b.uid.cmp(&a.uid));

    tracker.advance(PipelineStage::Matching);
    let total = fetched.len();
    let mut result = PreviewResult {
        total_messages: total,
        messages: Vec::with_capacity(total),
        ..Default::default()
    };
    observer.processing(0, total, None).await;

    for (index, mut message) in fetched.into_iter().enumerate() {
        if let Some(rule_id) = engine.classify(&mut message) {
            result.matched_messages += 1;
            *result.rule_matches.entry(rule_id).or_insert(0) += 1;
        }
        observer.processing(index + 1, total, Some(&message)).await;
        result.messages.push(message);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailstore::{MemoryBackend, MemoryConnector, MemoryUser, NewMessage, INBOX};
    use crate::rules::{Action, ActionStatus, Conditions, NewRule, PatternKind, PredicateSet};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        backend: MemoryBackend,
        user: Arc<MemoryUser>,
        account: Account,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = MemoryBackend::new();
            let user = backend.add_user("me@example.com", "pw");
            let account = Account::new(1, "personal", "localhost", "me@example.com", "pw", false);
            Self {
                backend,
                user,
                account,
            }
        }

        fn deliver(&self, from: &str, subject: &str) -> u32 {
            self.user.append(INBOX, NewMessage::new(from, subject)).unwrap()
        }

        fn pipeline(&self) -> ApplyPipeline {
            ApplyPipeline::new(Arc::new(MemoryConnector::new(self.backend.clone())))
        }
    }

    fn sender_move(id: i64, name: &str, pattern: &str, folder: &str, priority: i32) -> Rule {
        NewRule::new(1, name, Conditions::pattern(PatternKind::Sender, pattern), Action::move_to(folder))
            .with_priority(priority)
            .into_rule(id)
    }

    fn predicate_rule(id: i64, set: PredicateSet, action: Action) -> Rule {
        NewRule::new(1, format!("rule {}", id), Conditions::Predicates(set), action).into_rule(id)
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    #[async_trait]
    impl ProgressObserver for Recorder {
        async fn connected(&mut self) {
            self.events.push("connected".into());
        }
        async fn selecting(&mut self, folder: &str) {
            self.events.push(format!("selecting {}", folder));
        }
        async fn fetching(&mut self, total: u32) {
            self.events.push(format!("fetching {}", total));
        }
        async fn processing(&mut self, current: usize, total: usize, message: Option<&Message>) {
            let uid = message.map(|m| m.uid).unwrap_or(0);
            self.events.push(format!("processing {}/{} uid={}", current, total, uid));
        }
    }

    #[test]
    fn test_stage_transitions() {
        use PipelineStage::*;
        assert!(Idle.can_advance_to(Connected));
        assert!(Matching.can_advance_to(Acting));
        assert!(Acting.can_advance_to(FolderSelected));
        assert!(Acting.can_advance_to(Reported));
        assert!(Matching.can_advance_to(Failed));
        assert!(!Idle.can_advance_to(Acting));
        assert!(!Reported.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Connected));
    }

    #[tokio::test]
    async fn test_preview_first_match_by_priority() {
        let fx = Fixture::new();
        fx.deliver("news@shop.com", "Sale");
        fx.deliver("boss@work.com", "Meeting");
        fx.deliver("news@work.com", "Digest");

        let rules = vec![
            sender_move(1, "all news", "news@", "News", 1),
            sender_move(2, "work", "work.com", "Work", 10),
        ];
        let mut recorder = Recorder::default();
        let result = fx
            .pipeline()
            .preview(&fx.account, &rules, INBOX, 100, &mut recorder)
            .await
            .unwrap();

        assert_eq!(result.total_messages, 3);
        assert_eq!(result.matched_messages, 3);
        assert_eq!(result.rule_matches.get(&2), Some(&2));
        assert_eq!(result.rule_matches.get(&1), Some(&1));

        let uids: Vec<u32> = result.messages.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![3, 2, 1]);
        assert_eq!(result.messages[0].matched_rule.as_ref().unwrap().id, 2);

        assert_eq!(
            recorder.events,
            vec![
                "connected",
                "selecting INBOX",
                "fetching 3",
                "processing 0/3 uid=0",
                "processing 1/3 uid=3",
                "processing 2/3 uid=2",
                "processing 3/3 uid=1",
            ]
        );
        // Preview never mutates
        assert_eq!(fx.user.status(INBOX).unwrap().messages, 3);
    }

    #[tokio::test]
    async fn test_preview_limit_takes_newest() {
        let fx = Fixture::new();
        for i in 0..5 {
            fx.deliver("a@x.com", &format!("m{}", i));
        }
        let result = fx
            .pipeline()
            .preview(&fx.account, &[], INBOX, 2, &mut ())
            .await
            .unwrap();

        let uids: Vec<u32> = result.messages.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![5, 4]);
        assert_eq!(result.matched_messages, 0);
    }

    #[tokio::test]
    async fn test_preview_empty_folder() {
        let fx = Fixture::new();
        let rules = vec![sender_move(1, "any", "@", "Archive", 0)];
        let result = fx
            .pipeline()
            .preview(&fx.account, &rules, INBOX, 100, &mut ())
            .await
            .unwrap();

        assert_eq!(result, PreviewResult::default());
    }

    #[tokio::test]
    async fn test_preview_missing_folder_fails() {
        let fx = Fixture::new();
        let err = fx
            .pipeline()
            .preview(&fx.account, &[], "Nope", 100, &mut ())
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::FolderNotFound(_)));
        assert_eq!(fx.backend.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_preview_stream_error_fails_the_run() {
        let fx = Fixture::new();
        for i in 0..4 {
            fx.deliver("a@x.com", &format!("m{}", i));
        }
        fx.user.break_fetch_after(INBOX, 2);

        let err = fx
            .pipeline()
            .preview(&fx.account, &[], INBOX, 0, &mut ())
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_incomplete_account_is_refused_before_connecting() {
        let fx = Fixture::new();
        let mut account = fx.account.clone();
        account.host = String::new();

        let err = fx.pipeline().connect(&account).await.err().unwrap();
        assert!(matches!(err, MailError::Connection(_)));
        assert!(err.to_string().contains("IMAP host is required"));

        let report = fx.pipeline().run_batch(&account, &[]).await;
        assert!(report.is_failure());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let fx = Fixture::new();
        let pipeline = ApplyPipeline::new(Arc::new(MemoryConnector::stalled(fx.backend.clone())))
            .with_connect_timeout(Duration::from_millis(50));

        let err = pipeline.connect(&fx.account).await.err().unwrap();
        assert!(matches!(err, MailError::Timeout(_)));

        let status = pipeline.test_connection(&fx.account).await;
        assert!(!status.success);
        assert!(status.message.starts_with("Connection timeout"));
    }

    #[tokio::test]
    async fn test_connection_status() {
        let fx = Fixture::new();
        fx.user.create_mailbox("Archive").unwrap();
        fx.deliver("a@x.com", "one");

        let status = fx.pipeline().test_connection(&fx.account).await;
        assert!(status.success);
        assert_eq!(status.total_emails, 1);
        assert_eq!(status.folders.len(), 2);

        let mut wrong = fx.account.clone();
        wrong.password = "nope".to_string();
        let status = fx.pipeline().test_connection(&wrong).await;
        assert!(!status.success);
        assert!(status.message.contains("Authentication"));
    }

    #[tokio::test]
    async fn test_apply_first_match_moves_each_message_once() {
        let fx = Fixture::new();
        fx.user.create_mailbox("Work").unwrap();
        fx.user.create_mailbox("News").unwrap();
        fx.deliver("news@work.com", "Digest");
        fx.deliver("boss@work.com", "Meeting");
        fx.deliver("news@shop.com", "Sale");
        fx.deliver("friend@home.org", "Hi");

        let rules = vec![
            sender_move(1, "news", "news@", "News", 1),
            sender_move(2, "work", "work.com", "Work", 10),
        ];
        let report = fx
            .pipeline()
            .apply_first_match(&fx.account, &rules, INBOX)
            .await
            .unwrap();

        assert_eq!(report.actions.len(), 2);
        assert_eq!(report.actions[0].rule_id, 2);
        assert_eq!(report.actions[0].report.uids, vec![1, 2]);
        assert_eq!(fx.user.status("Work").unwrap().messages, 2);
        assert_eq!(fx.user.status("News").unwrap().messages, 1);
        let left: Vec<String> = fx.user.messages(INBOX).unwrap().into_iter().map(|m| m.subject).collect();
        assert_eq!(left, vec!["Hi"]);
    }

    #[tokio::test]
    async fn test_first_match_strategy_scans_each_rule_folder() {
        let fx = Fixture::new();
        fx.user.create_mailbox("Lists").unwrap();
        fx.user.create_mailbox("News").unwrap();
        fx.user
            .append("Lists", NewMessage::new("news@lists.org", "Weekly"))
            .unwrap();
        fx.deliver("news@shop.com", "Sale");
        fx.deliver("boss@work.com", "Meeting");

        let lists_rule = NewRule::new(
            1,
            "list news",
            Conditions::pattern(PatternKind::Sender, "news@"),
            Action::move_to("News"),
        )
        .in_folder("Lists")
        .into_rule(1);
        let inbox_rule = sender_move(2, "work", "work.com", "Work", 0);
        fx.user.create_mailbox("Work").unwrap();

        let report = fx
            .pipeline()
            .apply(&fx.account, &[lists_rule, inbox_rule], MatchStrategy::FirstMatch)
            .await;

        assert!(!report.is_failure());
        let folders: Vec<(&str, usize)> = report
            .rules
            .iter()
            .map(|r| (r.folder.as_str(), r.matched))
            .collect();
        assert_eq!(folders, vec![("INBOX", 1), ("Lists", 1)]);

        assert_eq!(fx.user.status("Lists").unwrap().messages, 0);
        assert_eq!(fx.user.status("News").unwrap().messages, 1);
        // The INBOX newsletter is outside the Lists rule's folder
        let inbox: Vec<String> = fx.user.messages(INBOX).unwrap().into_iter().map(|m| m.subject).collect();
        assert_eq!(inbox, vec!["Sale"]);
    }

    #[tokio::test]
    async fn test_first_match_strategy_reports_missing_folder_per_rule() {
        let fx = Fixture::new();
        fx.deliver("a@x.com", "one");

        let mut gone = sender_move(1, "gone", "a@", "Archive", 0);
        gone.folder = Some("Gone".to_string());
        let report = fx
            .pipeline()
            .apply(&fx.account, &[gone], MatchStrategy::FirstMatch)
            .await;

        assert!(report.error.is_none());
        assert_eq!(report.rules.len(), 1);
        assert_eq!(report.rules[0].folder, "Gone");
        assert!(report.rules[0].error.as_deref().unwrap().contains("Gone"));
    }

    #[tokio::test]
    async fn test_first_match_strategy_unreachable_account() {
        let fx = Fixture::new();
        let pipeline = ApplyPipeline::new(Arc::new(MemoryConnector::unreachable(fx.backend.clone())));
        let rules = vec![sender_move(1, "any", "@", "Archive", 0)];

        let report = pipeline.apply(&fx.account, &rules, MatchStrategy::FirstMatch).await;
        assert!(report.error.as_deref().unwrap().contains("connection refused"));
        assert!(report.rules.is_empty());
    }

    #[tokio::test]
    async fn test_apply_first_match_dry_run() {
        let fx = Fixture::new();
        fx.user.create_mailbox("Work").unwrap();
        fx.deliver("boss@work.com", "Meeting");

        let rules = vec![sender_move(1, "work", "work.com", "Work", 10)];
        let report = fx
            .pipeline()
            .dry_run(true)
            .apply_first_match(&fx.account, &rules, INBOX)
            .await
            .unwrap();

        assert_eq!(report.actions[0].report.status, ActionStatus::DryRun);
        assert_eq!(report.preview.matched_messages, 1);
        assert_eq!(fx.user.status(INBOX).unwrap().messages, 1);
        assert_eq!(fx.user.status("Work").unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_batch_move_three_messages() {
        let fx = Fixture::new();
        fx.user.create_mailbox("Archive").unwrap();
        for i in 0..3 {
            fx.deliver("reports@corp.com", &format!("report {}", i));
        }
        fx.deliver("friend@home.org", "Hi");

        let rule = predicate_rule(
            1,
            PredicateSet {
                from_contains: Some("reports@".into()),
                ..Default::default()
            },
            Action::move_to("Archive"),
        );
        let report = fx.pipeline().run_batch(&fx.account, &[rule]).await;

        assert!(!report.is_failure());
        assert_eq!(report.rules[0].scanned, 4);
        assert_eq!(report.rules[0].matched, 3);
        assert_eq!(fx.user.status(INBOX).unwrap().messages, 1);
        assert_eq!(fx.user.status("Archive").unwrap().messages, 3);
    }

    #[tokio::test]
    async fn test_batch_size_attachment_and_recipient_predicates() {
        let fx = Fixture::new();
        fx.user
            .append(
                INBOX,
                NewMessage::new("a@x.com", "scan")
                    .to("team@corp.com")
                    .sized(5 * 1024 * 1024)
                    .with_attachment(),
            )
            .unwrap();
        fx.user
            .append(INBOX, NewMessage::new("a@x.com", "small").to("team@corp.com").with_attachment())
            .unwrap();
        fx.user
            .append(INBOX, NewMessage::new("a@x.com", "no file").to("team@corp.com").sized(5 * 1024 * 1024))
            .unwrap();
        fx.user
            .append(INBOX, NewMessage::new("a@x.com", "elsewhere").to("me@home.org").sized(5 * 1024 * 1024).with_attachment())
            .unwrap();

        let rule = predicate_rule(
            1,
            PredicateSet {
                to_contains: Some("@corp.com".into()),
                has_attachment: Some(true),
                size_larger_than: Some("1MB".into()),
                ..Default::default()
            },
            Action::Flag,
        );
        let report = fx.pipeline().run_batch(&fx.account, &[rule]).await;

        assert_eq!(report.rules[0].scanned, 4);
        assert_eq!(report.rules[0].matched, 1);
        let flagged: Vec<String> = fx
            .user
            .messages(INBOX)
            .unwrap()
            .into_iter()
            .filter(|m| m.is_flagged())
            .map(|m| m.subject)
            .collect();
        assert_eq!(flagged, vec!["scan"]);
    }

    #[tokio::test]
    async fn test_batch_rules_can_hit_the_same_message() {
        let fx = Fixture::new();
        fx.deliver("alerts@corp.com", "Disk full");

        let alerts = PredicateSet {
            from_contains: Some("alerts".into()),
            ..Default::default()
        };
        let rules = vec![
            predicate_rule(1, alerts.clone(), Action::MarkRead),
            predicate_rule(2, alerts, Action::Flag),
        ];
        let report = fx.pipeline().run_batch(&fx.account, &rules).await;

        assert_eq!(report.rules.len(), 2);
        let message = &fx.user.messages(INBOX).unwrap()[0];
        assert!(message.is_read());
        assert!(message.is_flagged());
    }

    #[tokio::test]
    async fn test_batch_age_rule_uses_search() {
        let fx = Fixture::new();
        let old = Utc::now() - ChronoDuration::days(40);
        fx.user
            .append(INBOX, NewMessage::new("a@x.com", "old").dated(old))
            .unwrap();
        fx.deliver("a@x.com", "fresh");

        let rule = predicate_rule(
            1,
            PredicateSet {
                older_than_days: Some(30),
                ..Default::default()
            },
            Action::Delete,
        );
        let report = fx.pipeline().run_batch(&fx.account, &[rule]).await;

        assert_eq!(report.rules[0].scanned, 1);
        assert_eq!(report.rules[0].matched, 1);
        let left: Vec<String> = fx.user.messages(INBOX).unwrap().into_iter().map(|m| m.subject).collect();
        assert_eq!(left, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_batch_missing_folder_continues() {
        let fx = Fixture::new();
        fx.deliver("a@x.com", "one");

        let mut missing = predicate_rule(1, PredicateSet::default(), Action::MarkRead);
        missing.folder = Some("Gone".to_string());
        let flag_all = predicate_rule(2, PredicateSet::default(), Action::Flag);

        let report = fx.pipeline().run_batch(&fx.account, &[missing, flag_all]).await;

        assert!(report.rules[0].error.as_deref().unwrap().contains("Gone"));
        assert!(report.rules[1].error.is_none());
        assert!(fx.user.messages(INBOX).unwrap()[0].is_flagged());
    }

    #[tokio::test]
    async fn test_batch_read_only_source_is_reported() {
        let fx = Fixture::new();
        fx.deliver("a@x.com", "one");
        fx.user.set_read_only(INBOX, true).unwrap();

        let rule = predicate_rule(1, PredicateSet::default(), Action::MarkRead);
        let report = fx.pipeline().run_batch(&fx.account, &[rule]).await;

        assert!(report.is_failure());
        assert!(report.rules[0].action.as_ref().unwrap().is_failure());
    }

    #[tokio::test]
    async fn test_batch_all_survives_bad_accounts() {
        let fx = Fixture::new();
        fx.deliver("a@x.com", "one");

        let mut broken = fx.account.clone();
        broken.id = 2;
        broken.name = "broken".to_string();
        broken.password = "wrong".to_string();

        let mut rules = vec![predicate_rule(1, PredicateSet::default(), Action::MarkRead)];
        let mut for_broken = predicate_rule(2, PredicateSet::default(), Action::MarkRead);
        for_broken.account_id = 2;
        let mut orphan = predicate_rule(3, PredicateSet::default(), Action::MarkRead);
        orphan.account_id = 99;
        rules.push(for_broken);
        rules.push(orphan);

        let report = fx
            .pipeline()
            .run_batch_all(&[broken, fx.account.clone()], &rules)
            .await;

        assert_eq!(report.accounts.len(), 2);
        assert!(report.accounts[0].error.is_some());
        assert!(report.accounts[1].error.is_none());
        assert_eq!(report.skipped_rules, vec!["rule 3".to_string()]);
        assert_eq!(report.matched(), 1);
        assert!(fx.user.messages(INBOX).unwrap()[0].is_read());
    }

    #[tokio::test]
    async fn test_batch_dry_run_reports_without_mutating() {
        let fx = Fixture::new();
        fx.deliver("a@x.com", "one");

        let rule = predicate_rule(1, PredicateSet::default(), Action::Delete);
        let report = fx.pipeline().dry_run(true).run_batch(&fx.account, &[rule]).await;

        assert_eq!(report.rules[0].matched, 1);
        assert_eq!(report.rules[0].action.as_ref().unwrap().status, ActionStatus::DryRun);
        assert_eq!(fx.user.status(INBOX).unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_empty_rule_set_completes() {
        let fx = Fixture::new();
        fx.deliver("a@x.com", "one");

        let report = fx.pipeline().run_batch(&fx.account, &[]).await;
        assert!(report.rules.is_empty());
        assert!(!report.is_failure());

        let applied = fx
            .pipeline()
            .apply(&fx.account, &[], MatchStrategy::FirstMatch)
            .await;
        assert!(applied.rules.is_empty());
        assert!(applied.error.is_none());
    }
}
