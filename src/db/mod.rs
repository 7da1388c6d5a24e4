//! Database module for Mailsweep
//!
//! SQLite persistence for accounts and rules. Rule conditions and actions
//! are stored as JSON columns.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::mail::{Account, SecurityType};
use crate::rules::{NewRule, Rule};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Read access the preview and scheduler need
pub trait RuleStore: Send + Sync {
    fn find_account(&self, id: i64) -> DbResult<Option<Account>>;

    /// Rules of one account, highest priority first, then by name
    fn list_rules(&self, account_id: i64) -> DbResult<Vec<Rule>>;
}

/// New account for insertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_tls")]
    pub tls: bool,
}

fn default_tls() -> bool {
    true
}

impl NewAccount {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: 0,
            username: username.into(),
            password: password.into(),
            tls: true,
        }
    }

    /// Port to persist; zero picks the transport default
    fn effective_port(&self) -> u16 {
        if self.port == 0 {
            SecurityType::from_tls(self.tls).default_imap_port()
        } else {
            self.port
        }
    }
}

fn json_column<T: Serialize>(value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn from_json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let json: String = row.get(idx)?;
    serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

const ACCOUNT_COLUMNS: &str = "id, name, host, port, username, password, tls";
const RULE_COLUMNS: &str = "id, account_id, name, priority, enabled, folder, conditions, action";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
        tls: row.get(6)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        priority: row.get(3)?,
        enabled: row.get(4)?,
        folder: row.get(5)?,
        conditions: from_json_column(row, 6)?,
        action: from_json_column(row, 7)?,
    })
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        "#,
        )?;
        Self::init_schema(&conn)?;
        drop(conn);

        log::info!("Database opened at {}", db_path.display());
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing).
    ///
    /// Every pooled connection to `:memory:` is its own database, so the
    /// pool holds exactly one.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(conn)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: per-rule folder
        let has_folder: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('rules') WHERE name = 'folder'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_folder {
            log::info!("Running migration: Adding folder column to rules");
            conn.execute("ALTER TABLE rules ADD COLUMN folder TEXT", [])?;
        }

        Ok(())
    }

    // =========================================================================
    // ACCOUNTS
    // =========================================================================

    pub fn add_account(&self, account: &NewAccount) -> DbResult<i64> {
        let conn = self.get_conn()?;

        conn.execute(
            r#"
            INSERT INTO accounts (name, host, port, username, password, tls)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                account.name,
                account.host,
                account.effective_port(),
                account.username,
                account.password,
                account.tls,
            ],
        )?;

        let id = conn.last_insert_rowid();
        log::debug!("Added account {} ({})", account.name, id);
        Ok(id)
    }

    pub fn get_account(&self, id: i64) -> DbResult<Account> {
        self.find_account(id)?
            .ok_or_else(|| DbError::NotFound(format!("account {}", id)))
    }

    pub fn list_accounts(&self) -> DbResult<Vec<Account>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts ORDER BY id ASC",
            ACCOUNT_COLUMNS
        ))?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(accounts)
    }

    /// Update account settings. An empty password keeps the stored one.
    pub fn update_account(&self, id: i64, account: &NewAccount) -> DbResult<()> {
        let conn = self.get_conn()?;

        let changed = conn.execute(
            r#"
            UPDATE accounts SET
                name = ?1,
                host = ?2,
                port = ?3,
                username = ?4,
                password = CASE WHEN ?5 = '' THEN password ELSE ?5 END,
                tls = ?6,
                updated_at = datetime('now')
            WHERE id = ?7
            "#,
            params![
                account.name,
                account.host,
                account.effective_port(),
                account.username,
                account.password,
                account.tls,
                id,
            ],
        )?;

        if changed == 0 {
            return Err(DbError::NotFound(format!("account {}", id)));
        }
        Ok(())
    }

    /// Delete an account together with its rules
    pub fn delete_account(&self, id: i64) -> DbResult<()> {
        let conn = self.get_conn()?;

        let changed = conn.execute("DELETE FROM accounts WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("account {}", id)));
        }
        Ok(())
    }

    // =========================================================================
    // RULES
    // =========================================================================

    pub fn add_rule(&self, rule: &NewRule) -> DbResult<i64> {
        let conn = self.get_conn()?;

        let conditions_json = json_column(&rule.conditions)?;
        let action_json = json_column(&rule.action)?;

        conn.execute(
            r#"
            INSERT INTO rules (account_id, name, priority, enabled, folder, conditions, action)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                rule.account_id,
                rule.name,
                rule.priority,
                rule.enabled,
                rule.folder,
                conditions_json,
                action_json,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_rule(&self, id: i64) -> DbResult<Rule> {
        let conn = self.get_conn()?;

        conn.query_row(
            &format!("SELECT {} FROM rules WHERE id = ?1", RULE_COLUMNS),
            [id],
            rule_from_row,
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("rule {}", id)))
    }

    /// Every rule across accounts, in evaluation order
    pub fn list_all_rules(&self) -> DbResult<Vec<Rule>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rules ORDER BY priority DESC, name ASC, id ASC",
            RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rules)
    }

    pub fn update_rule(&self, id: i64, rule: &NewRule) -> DbResult<()> {
        let conn = self.get_conn()?;

        let conditions_json = json_column(&rule.conditions)?;
        let action_json = json_column(&rule.action)?;

        let changed = conn.execute(
            r#"
            UPDATE rules SET
                account_id = ?1,
                name = ?2,
                priority = ?3,
                enabled = ?4,
                folder = ?5,
                conditions = ?6,
                action = ?7,
                updated_at = datetime('now')
            WHERE id = ?8
            "#,
            params![
                rule.account_id,
                rule.name,
                rule.priority,
                rule.enabled,
                rule.folder,
                conditions_json,
                action_json,
                id,
            ],
        )?;

        if changed == 0 {
            return Err(DbError::NotFound(format!("rule {}", id)));
        }
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute("DELETE FROM rules WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Flip a rule's enabled state
    pub fn toggle_rule(&self, id: i64) -> DbResult<bool> {
        let conn = self.get_conn()?;

        conn.execute(
            "UPDATE rules SET enabled = NOT enabled, updated_at = datetime('now') WHERE id = ?1",
            [id],
        )?;
        conn.query_row("SELECT enabled FROM rules WHERE id = ?1", [id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("rule {}", id)))
    }
}

impl RuleStore for Database {
    fn find_account(&self, id: i64) -> DbResult<Option<Account>> {
        let conn = self.get_conn()?;

        let account = conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                [id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn list_rules(&self, account_id: i64) -> DbResult<Vec<Rule>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rules WHERE account_id = ?1 ORDER BY priority DESC, name ASC, id ASC",
            RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map([account_id], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rules)
    }
}
