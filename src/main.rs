//! CLI entry point for mailsweep.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use mailsweep_lib::config::{AppConfig, LegacyConfig};
use mailsweep_lib::db::{Database, NewAccount};
use mailsweep_lib::mail::{Account, ImapConnector};
use mailsweep_lib::pipeline::{AccountReport, ApplyPipeline, BatchReport};
use mailsweep_lib::preview::{PreviewConfig, PreviewServer, PreviewStreamer};
use mailsweep_lib::rules::{MatchStrategy, NewRule, DEFAULT_RULE_FOLDER};
use mailsweep_lib::scheduler::{RuleScheduler, StaticSource};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "mailsweep")]
#[command(about = "Rule-based IMAP mailbox cleanup with live preview")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    /// Every rule acts on everything it matches
    Batch,
    /// Each message goes to its highest-priority matching rule
    FirstMatch,
}

impl From<Strategy> for MatchStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Batch => MatchStrategy::Batch,
            Strategy::FirstMatch => MatchStrategy::FirstMatch,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all rules once
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
        /// Report what would happen without changing any mailbox
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_enum, default_value = "batch")]
        strategy: Strategy,
    },
    /// Run all rules periodically until interrupted
    Schedule {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the live preview endpoint from the database
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        database: Option<PathBuf>,
        /// Address to listen on, overrides the config file
        #[arg(long)]
        bind: Option<String>,
        /// Also run the database rules periodically
        #[arg(long)]
        schedule: bool,
    },
    /// Copy accounts and rules from a config file into the database
    Import {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// List the accounts stored in the database, without passwords
    Accounts {
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Check that every configured account can log in
    TestConnection {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Run a single-account JSON config of sender rules against INBOX
    Legacy {
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

fn pipeline(dry_run: bool) -> ApplyPipeline {
    ApplyPipeline::new(Arc::new(ImapConnector)).dry_run(dry_run)
}

fn open_database(explicit: Option<PathBuf>, config: Option<&AppConfig>) -> CliResult<Database> {
    let path = explicit
        .or_else(|| config.and_then(|c| c.database.clone()))
        .or_else(mailsweep_lib::default_database_path)
        .ok_or("cannot determine a database location; pass --database")?;
    Ok(Database::new(path)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: PathBuf, dry_run: bool, strategy: Strategy) -> CliResult<bool> {
    let config = AppConfig::load(config)?;
    let accounts = config.accounts();
    let rules = config.rules();
    let pipeline = pipeline(dry_run);

    let report = match MatchStrategy::from(strategy) {
        MatchStrategy::Batch => pipeline.run_batch_all(&accounts, &rules).await,
        strategy => {
            let mut report = BatchReport::default();
            for account in &accounts {
                let account_rules: Vec<_> = rules
                    .iter()
                    .filter(|r| r.account_id == account.id)
                    .cloned()
                    .collect();
                if account_rules.is_empty() {
                    continue;
                }
                report.accounts.push(pipeline.apply(account, &account_rules, strategy).await);
            }
            report
        }
    };

    if dry_run {
        log::info!("Dry run - no changes made");
    }
    print_json(&report)?;
    Ok(!report.has_failures())
}

async fn schedule(config: PathBuf, dry_run: bool) -> CliResult<bool> {
    let config = AppConfig::load(config)?;
    let source = StaticSource {
        accounts: config.accounts(),
        rules: config.rules(),
    };

    let scheduler = RuleScheduler::new(pipeline(dry_run), Arc::new(source));
    scheduler.set_interval(config.schedule.interval_minutes()).await?;
    scheduler.set_cron(config.schedule.cron()).await?;
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    scheduler.stop().await?;
    Ok(true)
}

async fn serve(
    config: Option<PathBuf>,
    database: Option<PathBuf>,
    bind: Option<String>,
    with_schedule: bool,
) -> CliResult<bool> {
    let config = config.map(AppConfig::load).transpose()?;
    let db = Arc::new(open_database(database, config.as_ref())?);

    let server_config = config.as_ref().map(|c| c.server.clone()).unwrap_or_default();
    let bind = bind.unwrap_or(server_config.bind);
    let preview = PreviewConfig {
        origin_policy: config.as_ref().map(AppConfig::origin_policy).unwrap_or_default(),
    };

    let streamer = Arc::new(PreviewStreamer::new(db.clone(), pipeline(true)));
    let server = PreviewServer::start(&bind, streamer, preview).await?;

    let scheduler = if with_schedule {
        let scheduler = RuleScheduler::new(pipeline(false), db);
        if let Some(config) = &config {
            scheduler.set_interval(config.schedule.interval_minutes()).await?;
            scheduler.set_cron(config.schedule.cron()).await?;
        }
        scheduler.start().await?;
        Some(scheduler)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    if let Some(scheduler) = scheduler {
        scheduler.stop().await?;
    }
    server.stop().await;
    Ok(true)
}

fn import(config: PathBuf, database: Option<PathBuf>) -> CliResult<bool> {
    let config = AppConfig::load(config)?;
    let db = open_database(database, Some(&config))?;

    let mut ids = HashMap::new();
    for account in config.accounts() {
        let id = db.add_account(&NewAccount {
            name: account.name.clone(),
            host: account.host.clone(),
            port: account.port,
            username: account.username.clone(),
            password: account.password.clone(),
            tls: account.tls,
        })?;
        ids.insert(account.id, id);
    }

    let mut imported = 0;
    for rule in config.rules() {
        let Some(&account_id) = ids.get(&rule.account_id) else {
            continue;
        };
        db.add_rule(&NewRule {
            account_id,
            name: rule.name,
            priority: rule.priority,
            enabled: rule.enabled,
            folder: rule.folder,
            conditions: rule.conditions,
            action: rule.action,
        })?;
        imported += 1;
    }

    log::info!("Imported {} accounts and {} rules", ids.len(), imported);
    Ok(true)
}

fn accounts(database: Option<PathBuf>) -> CliResult<bool> {
    let db = open_database(database, None)?;
    let accounts: Vec<Account> = db.list_accounts()?.iter().map(Account::redacted).collect();
    print_json(&accounts)?;
    Ok(true)
}

async fn test_connection(config: PathBuf) -> CliResult<bool> {
    let config = AppConfig::load(config)?;
    let pipeline = pipeline(true);

    let mut all_ok = true;
    let mut results = Vec::new();
    for account in config.accounts() {
        let status = pipeline.test_connection(&account).await;
        if status.success {
            log::info!("{}: {} ({} messages in INBOX)", account.name, status.message, status.total_emails);
        } else {
            log::error!("{}: {}", account.name, status.message);
            all_ok = false;
        }
        results.push((account.name, status));
    }

    print_json(&results)?;
    Ok(all_ok)
}

async fn legacy(config: PathBuf, dry_run: bool) -> CliResult<bool> {
    let config = LegacyConfig::load(config)?;
    let account = config.account();
    let rules = config.rules();
    log::info!("Connecting to {}...", account.address());

    let applied = pipeline(dry_run)
        .apply_first_match(&account, &rules, DEFAULT_RULE_FOLDER)
        .await?;

    log::info!("Found {} matching messages", applied.preview.matched_messages);
    for message in applied.preview.messages.iter().rev() {
        if let Some(rule) = &message.matched_rule {
            log::info!("  {} (from: {}, subject: {})", rule.name, message.from, message.subject);
        }
    }
    if dry_run {
        log::info!("Dry run - no changes made");
    }

    let report = AccountReport::from_first_match(&account, DEFAULT_RULE_FOLDER, applied);
    print_json(&report)?;
    Ok(!report.is_failure())
}

#[tokio::main]
async fn main() -> ExitCode {
    mailsweep_lib::init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            config,
            dry_run,
            strategy,
        } => run(config, dry_run, strategy).await,
        Command::Schedule { config, dry_run } => schedule(config, dry_run).await,
        Command::Serve {
            config,
            database,
            bind,
            schedule,
        } => serve(config, database, bind, schedule).await,
        Command::Import { config, database } => import(config, database),
        Command::Accounts { database } => accounts(database),
        Command::TestConnection { config } => test_connection(config).await,
        Command::Legacy { config, dry_run } => legacy(config, dry_run).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
