//! Rule actions and their execution against a mailbox session

use serde::{Deserialize, Serialize};

use crate::mail::{MailResult, MailboxSession, FLAG_DELETED, FLAG_FLAGGED, FLAG_SEEN};

/// Action to perform on the messages a rule matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Mark deleted, then expunge
    Delete,
    Move {
        #[serde(default, rename = "move_to", skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    MarkRead,
    MarkUnread,
    Flag,
    Unflag,
    AddFlag {
        #[serde(default, rename = "add_flag", skip_serializing_if = "Option::is_none")]
        flag: Option<String>,
    },
    RemoveFlag {
        #[serde(default, rename = "remove_flag", skip_serializing_if = "Option::is_none")]
        flag: Option<String>,
    },
}

impl Action {
    pub fn move_to(destination: impl Into<String>) -> Self {
        Action::Move {
            destination: Some(destination.into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Delete => "delete",
            Action::Move { .. } => "move",
            Action::MarkRead => "mark_read",
            Action::MarkUnread => "mark_unread",
            Action::Flag => "flag",
            Action::Unflag => "unflag",
            Action::AddFlag { .. } => "add_flag",
            Action::RemoveFlag { .. } => "remove_flag",
        }
    }

    /// Reason this action cannot run, if a required parameter is missing
    pub fn missing_parameter(&self) -> Option<&'static str> {
        let blank = |value: &Option<String>| value.as_deref().map_or(true, str::is_empty);
        match self {
            Action::Move { destination } if blank(destination) => {
                Some("move action requires a destination folder")
            }
            Action::AddFlag { flag } if blank(flag) => Some("add_flag action requires a flag"),
            Action::RemoveFlag { flag } if blank(flag) => Some("remove_flag action requires a flag"),
            _ => None,
        }
    }
}

/// A move runs as copy, then mark-deleted at the source, then expunge.
/// Steps are recorded as they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStep {
    Copied,
    SourceMarked,
    Expunged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveReport {
    pub destination: String,
    pub completed: Vec<MoveStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MoveReport {
    pub fn is_complete(&self) -> bool {
        self.completed.contains(&MoveStep::Expunged)
    }

    /// The destination holds a copy but the source was not cleaned up.
    /// A later run finishes the move.
    pub fn is_duplicated(&self) -> bool {
        self.completed.contains(&MoveStep::Copied) && !self.is_complete()
    }
}

/// Copy-mark-expunge sequence for one destination
pub struct MoveSaga<'a> {
    destination: &'a str,
}

impl<'a> MoveSaga<'a> {
    pub fn new(destination: &'a str) -> Self {
        Self { destination }
    }

    pub async fn run(&self, session: &mut dyn MailboxSession, uids: &[u32]) -> MoveReport {
        let mut report = MoveReport {
            destination: self.destination.to_string(),
            completed: Vec::new(),
            error: None,
        };

        if let Err(e) = self.step(session, uids, &mut report).await {
            if report.is_duplicated() {
                log::error!(
                    "Move to {} stopped after {:?}: {}. {} messages now exist in both folders",
                    self.destination,
                    report.completed.last(),
                    e,
                    uids.len()
                );
            } else {
                log::error!("Move to {} failed: {}", self.destination, e);
            }
            report.error = Some(e.to_string());
        }
        report
    }

    async fn step(
        &self,
        session: &mut dyn MailboxSession,
        uids: &[u32],
        report: &mut MoveReport,
    ) -> MailResult<()> {
        session.copy(uids, self.destination).await?;
        report.completed.push(MoveStep::Copied);

        session
            .set_flags(uids, &[FLAG_DELETED.to_string()], true)
            .await?;
        report.completed.push(MoveStep::SourceMarked);

        session.expunge().await?;
        report.completed.push(MoveStep::Expunged);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Applied,
    DryRun,
    Skipped { reason: String },
    Failed { error: String },
}

/// Outcome of running one action on a set of messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action: Action,
    pub uids: Vec<u32>,
    #[serde(flatten)]
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub move_report: Option<MoveReport>,
}

impl ActionReport {
    fn new(action: &Action, uids: &[u32], status: ActionStatus) -> Self {
        Self {
            action: action.clone(),
            uids: uids.to_vec(),
            status,
            move_report: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, ActionStatus::Failed { .. })
    }
}

/// Runs actions against the currently selected folder of a session
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionExecutor {
    dry_run: bool,
}

impl ActionExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Each action is issued once for the whole UID set
    pub async fn execute(
        &self,
        session: &mut dyn MailboxSession,
        uids: &[u32],
        action: &Action,
    ) -> ActionReport {
        if uids.is_empty() {
            return ActionReport::new(
                action,
                uids,
                ActionStatus::Skipped {
                    reason: "no messages".to_string(),
                },
            );
        }

        if let Some(reason) = action.missing_parameter() {
            log::error!("{}", reason);
            return ActionReport::new(
                action,
                uids,
                ActionStatus::Skipped {
                    reason: reason.to_string(),
                },
            );
        }

        if self.dry_run {
            log::info!(
                "[DRY RUN] Would execute action {} on {} messages",
                action.name(),
                uids.len()
            );
            return ActionReport::new(action, uids, ActionStatus::DryRun);
        }

        log::info!("Executing action {} on {} messages", action.name(), uids.len());

        if let Action::Move {
            destination: Some(destination),
        } = action
        {
            let move_report = MoveSaga::new(destination).run(session, uids).await;
            let status = match &move_report.error {
                None => ActionStatus::Applied,
                Some(error) => ActionStatus::Failed {
                    error: error.clone(),
                },
            };
            let mut report = ActionReport::new(action, uids, status);
            report.move_report = Some(move_report);
            return report;
        }

        let status = match self.apply(session, uids, action).await {
            Ok(()) => ActionStatus::Applied,
            Err(e) => {
                log::error!("Action {} failed: {}", action.name(), e);
                ActionStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        ActionReport::new(action, uids, status)
    }

    async fn apply(&self, session: &mut dyn MailboxSession, uids: &[u32], action: &Action) -> MailResult<()> {
        let one = |flag: &str| vec![flag.to_string()];
        match action {
            Action::Delete => {
                session.set_flags(uids, &one(FLAG_DELETED), true).await?;
                session.expunge().await
            }
            Action::MarkRead => session.set_flags(uids, &one(FLAG_SEEN), true).await,
            Action::MarkUnread => session.set_flags(uids, &one(FLAG_SEEN), false).await,
            Action::Flag => session.set_flags(uids, &one(FLAG_FLAGGED), true).await,
            Action::Unflag => session.set_flags(uids, &one(FLAG_FLAGGED), false).await,
            Action::AddFlag { flag: Some(flag) } => session.set_flags(uids, &one(flag.as_str()), true).await,
            Action::RemoveFlag { flag: Some(flag) } => {
                session.set_flags(uids, &one(flag.as_str()), false).await
            }
            // Parameterless variants were rejected by `missing_parameter`
            Action::Move { .. } | Action::AddFlag { .. } | Action::RemoveFlag { .. } => Ok(()),
        }
    }
}
