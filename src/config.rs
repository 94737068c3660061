use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const SSL_PORT: u16 = 993;
const PLAIN_PORT: u16 = 143;

#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub address: String,
    pub password: String,
    #[serde(default)]
    pub group: Option<String>,
}

impl AccountConfig {
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        AccountConfig {
            address: address.into(),
            password: password.into(),
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("address", &self.address)
            .field("password", &"<redacted>")
            .field("group", &self.group)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `host` or `host:port`.
    pub server: String,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default)]
    pub page_size: usize,
    #[serde(default)]
    pub pool_size: usize,
    /// Socket timeout in seconds.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Group name to member addresses, for accounts without a `group` of
    /// their own.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validated()
    }

    /// Fills in defaults, resolves account groups and rejects configurations
    /// the run cannot work with.
    pub fn validated(mut self) -> Result<Self> {
        self.server_addr()?;
        if self.page_size == 0 {
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        if self.pool_size == 0 {
            self.pool_size = DEFAULT_POOL_SIZE;
        }
        if self.timeout == 0 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }

        let mut seen = HashSet::new();
        for account in self.accounts.iter_mut() {
            account.address = account.address.trim().to_string();
            if account.address.is_empty() {
                return Err(Error::config("account with an empty address"));
            }
            if !seen.insert(account.address.clone()) {
                return Err(Error::config(format!(
                    "account {} is listed more than once",
                    account.address
                )));
            }
            if account.group.is_none() {
                account.group = self
                    .groups
                    .iter()
                    .find(|(_, members)| members.iter().any(|m| m.trim() == account.address))
                    .map(|(name, _)| name.clone());
            }
        }
        Ok(self)
    }

    pub fn server_addr(&self) -> Result<(String, u16)> {
        let server = self.server.trim();
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::config(format!("invalid port in server {:?}", server)))?;
                (host, port)
            }
            None if self.ssl => (server, SSL_PORT),
            None => (server, PLAIN_PORT),
        };
        if host.is_empty() {
            return Err(Error::config("server host is empty"));
        }
        Ok((host.to_string(), port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
