//! Account Configuration Module

use serde::{Deserialize, Serialize};

/// Transport security for mailbox connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    #[default]
    Tls,
    Plain,
}

impl SecurityType {
    pub fn from_tls(tls: bool) -> Self {
        if tls {
            SecurityType::Tls
        } else {
            SecurityType::Plain
        }
    }

    pub fn default_imap_port(&self) -> u16 {
        match self {
            SecurityType::Tls => 993,
            SecurityType::Plain => 143,
        }
    }
}

/// Identity for one remote mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub tls: bool,
}

impl Account {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        tls: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port: SecurityType::from_tls(tls).default_imap_port(),
            username: username.into(),
            password: password.into(),
            tls,
        }
    }

    pub fn security(&self) -> SecurityType {
        SecurityType::from_tls(self.tls)
    }

    /// `host:port`, falling back to the default port for the transport.
    pub fn address(&self) -> String {
        let port = if self.port == 0 {
            self.security().default_imap_port()
        } else {
            self.port
        };
        format!("{}:{}", self.host, port)
    }

    /// Copy of the account safe to hand to API consumers
    pub fn redacted(&self) -> Self {
        Self {
            password: String::new(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Account name is required".to_string());
        }
        if self.host.is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.username.is_empty() {
            errors.push("Username is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_follow_transport() {
        let tls = Account::new(1, "work", "imap.example.com", "me", "pw", true);
        let plain = Account::new(2, "local", "localhost", "me", "pw", false);

        assert_eq!(tls.port, 993);
        assert_eq!(plain.port, 143);
        assert_eq!(plain.address(), "localhost:143");
    }

    #[test]
    fn test_zero_port_uses_default() {
        let mut account = Account::new(1, "work", "imap.example.com", "me", "pw", true);
        account.port = 0;
        assert_eq!(account.address(), "imap.example.com:993");
    }

    #[test]
    fn test_redacted_drops_password() {
        let account = Account::new(1, "work", "imap.example.com", "me", "secret", true);
        let safe = account.redacted();

        assert!(safe.password.is_empty());
        let json = serde_json::to_string(&safe).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_validate_reports_every_missing_field() {
        let account = Account::new(1, "", "", "", "", true);
        let errors = account.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
