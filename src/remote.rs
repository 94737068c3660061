use std::collections::BTreeMap;

use crate::config::AccountConfig;
use crate::error::Result;
use crate::state::Uid;

/// Result of searching one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub uid_validity: Option<u32>,
    pub uids: Vec<Uid>,
}

/// Opens one authenticated session per account.
///
/// A rejected login is reported as `Error::Auth`; everything else that goes
/// wrong while connecting is `Error::Transport`.
pub trait Connector: Sync {
    type Session: MailSession;

    fn connect(&self, account: &AccountConfig) -> Result<Self::Session>;
}

pub trait MailSession {
    fn list_mailboxes(&mut self) -> Result<Vec<String>>;

    fn search(&mut self, mailbox: &str) -> Result<Listing>;

    /// Raw message bytes for the requested identifiers. The server may leave
    /// some of them out.
    fn fetch_bodies(&mut self, mailbox: &str, uids: &[Uid]) -> Result<BTreeMap<Uid, Vec<u8>>>;

    fn logout(&mut self) {}
}
