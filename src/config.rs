//! Configuration files
//!
//! The main configuration is YAML and lists accounts, rules, the schedule
//! and the preview server. A small JSON format with a single account and
//! sender rules is still accepted for older setups.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mail::{Account, SecurityType};
use crate::preview::OriginPolicy;
use crate::rules::{Action, Conditions, NewRule, PatternKind, PredicateSet, Rule, DEFAULT_RULE_FOLDER};
use crate::scheduler::{CronSchedule, DEFAULT_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub host: String,
    /// Zero picks 993 or 143 depending on `tls`
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Environment variable holding the password; wins over `password`
    #[serde(default)]
    pub password_env: String,
    #[serde(default = "default_true")]
    pub tls: bool,
}

impl AccountConfig {
    pub fn password(&self) -> String {
        if self.password_env.is_empty() {
            return self.password.clone();
        }
        std::env::var(&self.password_env).unwrap_or_else(|_| {
            log::warn!(
                "Account {}: environment variable {} is not set",
                self.name,
                self.password_env
            );
            String::new()
        })
    }

    fn port(&self) -> u16 {
        if self.port == 0 {
            SecurityType::from_tls(self.tls).default_imap_port()
        } else {
            self.port
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub account: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: PredicateSet,
    #[serde(default)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub interval_minutes: u32,
    /// Cron expression, five or six fields; wins over `interval_minutes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

impl ScheduleConfig {
    /// The cron expression, if one is set and non-blank
    pub fn cron(&self) -> Option<&str> {
        self.cron.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn interval_minutes(&self) -> u32 {
        if self.interval_minutes == 0 {
            DEFAULT_INTERVAL_MINUTES
        } else {
            self.interval_minutes
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Top-level YAML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let config = Self::from_yaml(&read(path)?)?;
        log::info!(
            "Loaded {} accounts and {} rules from {}",
            config.accounts.len(),
            config.rules.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: AppConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.accounts.is_empty() {
            return invalid("at least one account is required".to_string());
        }

        let mut names = HashSet::new();
        for (i, account) in self.accounts.iter().enumerate() {
            if account.name.is_empty() {
                return invalid(format!("account {}: name is required", i));
            }
            if !names.insert(account.name.as_str()) {
                return invalid(format!("duplicate account name: {}", account.name));
            }
            if account.host.is_empty() {
                return invalid(format!("account {}: host is required", account.name));
            }
            if account.username.is_empty() {
                return invalid(format!("account {}: username is required", account.name));
            }
            if account.password.is_empty() && account.password_env.is_empty() {
                return invalid(format!(
                    "account {}: password or password_env is required",
                    account.name
                ));
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.is_empty() {
                return invalid(format!("rule {}: name is required", i));
            }
            if rule.account.is_empty() {
                return invalid(format!("rule {}: account is required", rule.name));
            }
            if !names.contains(rule.account.as_str()) {
                return invalid(format!("rule {}: unknown account {}", rule.name, rule.account));
            }
            if rule.folder.is_empty() {
                return invalid(format!("rule {}: folder is required", rule.name));
            }
            // A missing move target or flag is a no-op at run time, not a load error
            if rule.action.is_none() {
                return invalid(format!("rule {}: action type is required", rule.name));
            }
        }

        let interval = self.schedule.interval_minutes();
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval) {
            return invalid(format!(
                "schedule: interval_minutes must be between {} and {}",
                MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES
            ));
        }
        if let Some(expr) = self.schedule.cron() {
            if let Err(e) = CronSchedule::parse(expr) {
                return invalid(format!("schedule: {}", e));
            }
        }

        Ok(())
    }

    /// Accounts with ids assigned in file order, starting at 1
    pub fn accounts(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .zip(1i64..)
            .map(|(a, id)| Account {
                id,
                name: a.name.clone(),
                host: a.host.clone(),
                port: a.port(),
                username: a.username.clone(),
                password: a.password(),
                tls: a.tls,
            })
            .collect()
    }

    fn account_id(&self, name: &str) -> Option<i64> {
        self.accounts
            .iter()
            .zip(1i64..)
            .find(|(a, _)| a.name == name)
            .map(|(_, id)| id)
    }

    /// Rules in file order, ids starting at 1
    pub fn rules(&self) -> Vec<Rule> {
        self.rules
            .iter()
            .zip(1i64..)
            .filter_map(|(r, id)| {
                let account_id = self.account_id(&r.account)?;
                let action = r.action.clone()?;
                let mut rule = NewRule::new(account_id, r.name.clone(), Conditions::Predicates(r.conditions.clone()), action)
                    .with_priority(r.priority)
                    .in_folder(r.folder.clone());
                rule.enabled = r.enabled;
                Some(rule.into_rule(id))
            })
            .collect()
    }

    pub fn origin_policy(&self) -> OriginPolicy {
        OriginPolicy::from_list(self.server.allowed_origins.clone())
    }
}

/// Legacy single-account JSON configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyConfig {
    pub server: String,
    #[serde(default)]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub rules: Vec<LegacyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRule {
    pub sender: String,
    pub move_to_folder: String,
}

impl LegacyConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_json(&read(path.as_ref())?)
    }

    pub fn from_json(json: &str) -> ConfigResult<Self> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn account(&self) -> Account {
        let mut account = Account::new(1, &self.server, &self.server, &self.username, &self.password, self.tls);
        if self.port != 0 {
            account.port = self.port;
        }
        account
    }

    /// Sender rules for INBOX; earlier entries take precedence
    pub fn rules(&self) -> Vec<Rule> {
        let total = self.rules.len() as i32;
        self.rules
            .iter()
            .zip(0i32..)
            .map(|(r, i)| {
                NewRule::new(
                    1,
                    format!("{} -> {}", r.sender, r.move_to_folder),
                    Conditions::pattern(PatternKind::Sender, &r.sender),
                    Action::move_to(&r.move_to_folder),
                )
                .with_priority(total - i)
                .in_folder(DEFAULT_RULE_FOLDER)
                .into_rule(i64::from(i) + 1)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
accounts:
  - name: personal
    host: imap.example.com
    username: me@example.com
    password: secret
  - name: work
    host: mail.corp.example
    port: 1143
    username: me
    password_env: MAILSWEEP_TEST_WORK_PASSWORD
    tls: false

rules:
  - name: old newsletters
    account: personal
    folder: INBOX
    conditions:
      from_contains: newsletter
      older_than_days: 30
    action:
      type: move
      move_to: Archive
  - name: big attachments
    account: work
    folder: INBOX
    priority: 3
    enabled: false
    conditions:
      has_attachment: true
      size_larger_than: 10MB
    action:
      type: add_flag
      add_flag: Large

schedule:
  interval_minutes: 15

server:
  bind: 0.0.0.0:9000
  allowed_origins:
    - http://localhost:3000
"#;

    fn with_rule(rule: &str) -> String {
        format!(
            "accounts:\n  - name: a\n    host: h\n    username: u\n    password: p\nrules:\n{}\n",
            rule
        )
    }

    fn invalid_message(yaml: &str) -> String {
        match AppConfig::from_yaml(yaml) {
            Err(ConfigError::Invalid(msg)) => msg,
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_load_sample() {
        std::env::set_var("MAILSWEEP_TEST_WORK_PASSWORD", "from-env");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();

        let accounts = config.accounts();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, 1);
        assert_eq!(accounts[0].port, 993);
        assert!(accounts[0].tls);
        assert_eq!(accounts[1].port, 1143);
        assert!(!accounts[1].tls);
        assert_eq!(accounts[1].password, "from-env");

        let rules = config.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].account_id, 1);
        assert_eq!(rules[0].action, Action::move_to("Archive"));
        assert_eq!(rules[1].account_id, 2);
        assert_eq!(rules[1].priority, 3);
        assert!(!rules[1].enabled);
        assert_eq!(
            rules[1].action,
            Action::AddFlag {
                flag: Some("Large".to_string())
            }
        );

        assert_eq!(config.schedule.interval_minutes(), 15);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(!config.origin_policy().allows(Some("http://elsewhere")));
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_yaml(&with_rule("  []")).unwrap();
        assert_eq!(config.schedule.interval_minutes(), 60);
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.origin_policy(), OriginPolicy::AllowAll);
        assert!(config.database.is_none());
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(invalid_message("accounts: []"), "at least one account is required");

        let duplicate = "accounts:\n  - {name: a, host: h, username: u, password: p}\n  - {name: a, host: h, username: u, password: p}\n";
        assert_eq!(invalid_message(duplicate), "duplicate account name: a");

        let no_password = "accounts:\n  - {name: a, host: h, username: u}\n";
        assert_eq!(
            invalid_message(no_password),
            "account a: password or password_env is required"
        );

        let unknown = with_rule("  - {name: r, account: b, folder: INBOX, action: {type: delete}}");
        assert_eq!(invalid_message(&unknown), "rule r: unknown account b");

        let no_folder = with_rule("  - {name: r, account: a, action: {type: delete}}");
        assert_eq!(invalid_message(&no_folder), "rule r: folder is required");

        let no_action = with_rule("  - {name: r, account: a, folder: INBOX}");
        assert_eq!(invalid_message(&no_action), "rule r: action type is required");

        let slow = format!("{}schedule:\n  interval_minutes: 5000\n", with_rule("  []"));
        assert_eq!(
            invalid_message(&slow),
            "schedule: interval_minutes must be between 1 and 1440"
        );

        let bad_cron = format!("{}schedule:\n  cron: \"every tuesday\"\n", with_rule("  []"));
        let message = invalid_message(&bad_cron);
        assert!(message.starts_with("schedule: "));
        assert!(message.contains("every tuesday"));
    }

    #[test]
    fn test_action_without_target_still_loads() {
        let yaml = with_rule("  - {name: r, account: a, folder: INBOX, action: {type: move}}");
        let config = AppConfig::from_yaml(&yaml).unwrap();

        let rules = config.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, Action::Move { destination: None });
    }

    #[test]
    fn test_cron_schedule() {
        let yaml = format!("{}schedule:\n  cron: \"0 */6 * * *\"\n", with_rule("  []"));
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.schedule.cron(), Some("0 */6 * * *"));

        let blank = format!("{}schedule:\n  cron: \"  \"\n", with_rule("  []"));
        assert_eq!(AppConfig::from_yaml(&blank).unwrap().schedule.cron(), None);
    }

    #[test]
    fn test_parse_and_read_errors() {
        assert!(matches!(
            AppConfig::from_yaml("accounts: [unclosed"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AppConfig::load("/nonexistent/mailsweep.yaml"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_legacy_config() {
        let json = r#"{
            "server": "imap.example.com",
            "port": 993,
            "username": "me",
            "password": "pw",
            "rules": [
                {"sender": "news@", "move_to_folder": "News"},
                {"sender": "example.com", "move_to_folder": "Example"}
            ]
        }"#;
        let legacy = LegacyConfig::from_json(json).unwrap();

        let account = legacy.account();
        assert!(account.tls);
        assert_eq!(account.address(), "imap.example.com:993");

        let rules = legacy.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 2);
        assert_eq!(rules[1].priority, 1);
        assert_eq!(rules[0].conditions, Conditions::pattern(PatternKind::Sender, "news@"));
        assert_eq!(rules[1].action, Action::move_to("Example"));
    }
}
