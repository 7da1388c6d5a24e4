//! Background Rule Scheduler
//!
//! Runs the batch pipeline over every account at a fixed interval or on a
//! cron schedule. The first run starts as soon as the scheduler does.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::mail::Account;
use crate::pipeline::{ApplyPipeline, BatchReport};
use crate::rules::Rule;

pub const DEFAULT_INTERVAL_MINUTES: u32 = 60;
pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Failed to load accounts and rules: {0}")]
    Source(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// A parsed cron expression in local time. Five-field crontab lines get a
/// leading seconds field of `0`.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let expr = expr.trim();
        let full = if expr.split_whitespace().count() == 5 {
            format!("0 {}", expr)
        } else {
            expr.to_string()
        };
        let schedule = cron::Schedule::from_str(&full).map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(after).next()
    }
}

/// What wakes the scheduler loop. Both fire immediately on the first tick.
enum Trigger {
    Every(tokio::time::Interval),
    Cron { schedule: CronSchedule, started: bool },
}

impl Trigger {
    /// Wait for the next run; `false` once the schedule has no runs left
    async fn tick(&mut self) -> bool {
        match self {
            Trigger::Every(interval) => {
                interval.tick().await;
                true
            }
            Trigger::Cron { schedule, started } => {
                if !*started {
                    *started = true;
                    return true;
                }
                let now = Local::now();
                let Some(next) = schedule.next_after(&now) else {
                    return false;
                };
                log::debug!("Next scheduled run at {}", next);
                tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;
                true
            }
        }
    }
}

/// Where each run gets its accounts and rules from
pub trait BatchSource: Send + Sync {
    fn load(&self) -> Result<(Vec<Account>, Vec<Rule>), SchedulerError>;
}

/// Fixed accounts and rules, as read from a config file
#[derive(Debug, Clone)]
pub struct StaticSource {
    pub accounts: Vec<Account>,
    pub rules: Vec<Rule>,
}

impl BatchSource for StaticSource {
    fn load(&self) -> Result<(Vec<Account>, Vec<Rule>), SchedulerError> {
        Ok((self.accounts.clone(), self.rules.clone()))
    }
}

/// Reloads from the database on every run so edits apply without a restart
impl BatchSource for Database {
    fn load(&self) -> Result<(Vec<Account>, Vec<Rule>), SchedulerError> {
        let accounts = self
            .list_accounts()
            .map_err(|e| SchedulerError::Source(e.to_string()))?;
        let rules = self
            .list_all_rules()
            .map_err(|e| SchedulerError::Source(e.to_string()))?;
        Ok((accounts, rules))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub interval_minutes: u32,
    /// Takes precedence over the interval when set
    pub cron: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            cron: None,
            last_run: None,
        }
    }
}

fn check_interval(minutes: u32) -> Result<(), SchedulerError> {
    if (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, minutes
        )))
    }
}

/// Periodic batch runner
#[derive(Clone)]
pub struct RuleScheduler {
    pipeline: ApplyPipeline,
    source: Arc<dyn BatchSource>,
    config: Arc<RwLock<SchedulerConfig>>,
    last_report: Arc<RwLock<Option<BatchReport>>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl RuleScheduler {
    pub fn new(pipeline: ApplyPipeline, source: Arc<dyn BatchSource>) -> Self {
        Self {
            pipeline,
            source,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            last_report: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub async fn set_interval(&self, minutes: u32) -> Result<(), SchedulerError> {
        check_interval(minutes)?;
        self.config.write().await.interval_minutes = minutes;
        Ok(())
    }

    /// Switch to a cron schedule, or back to the interval with `None`
    pub async fn set_cron(&self, expr: Option<&str>) -> Result<(), SchedulerError> {
        let cron = match expr {
            Some(expr) => Some(CronSchedule::parse(expr)?.expr().to_string()),
            None => None,
        };
        self.config.write().await.cron = cron;
        Ok(())
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    pub async fn last_report(&self) -> Option<BatchReport> {
        self.last_report.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run every account once, now
    pub async fn run_once(&self) -> Result<BatchReport, SchedulerError> {
        let (accounts, rules) = self.source.load()?;
        let report = self.pipeline.run_batch_all(&accounts, &rules).await;

        self.config.write().await.last_run = Some(Utc::now());
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        let trigger = match &config.cron {
            Some(expr) => Trigger::Cron {
                schedule: CronSchedule::parse(expr)?,
                started: false,
            },
            None => {
                check_interval(config.interval_minutes)?;
                Trigger::Every(tokio::time::interval(Duration::from_secs(
                    60 * u64::from(config.interval_minutes),
                )))
            }
        };

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.scheduler_loop(trigger).await;
        });
        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        match &config.cron {
            Some(expr) => log::info!("Rule scheduler started (cron: {})", expr),
            None => log::info!(
                "Rule scheduler started (interval: {} minutes)",
                config.interval_minutes
            ),
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        log::info!("Rule scheduler stopped");
        Ok(())
    }

    async fn scheduler_loop(&self, mut trigger: Trigger) {
        loop {
            if !trigger.tick().await {
                log::warn!("Schedule has no further runs");
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            log::info!("Scheduled rule run triggered");
            match self.run_once().await {
                Ok(report) => {
                    let failed = report.accounts.iter().filter(|a| a.is_failure()).count();
                    log::info!(
                        "Scheduled run completed: accounts={}, matched={}, failures={}",
                        report.accounts.len(),
                        report.matched(),
                        failed
                    );
                }
                Err(e) => log::error!("Scheduled run failed: {}", e),
            }
        }

        log::info!("Scheduler loop exited");
    }
}
