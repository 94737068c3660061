use ::imap::types::NameAttribute;
use native_tls::{TlsConnector, TlsStream};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{AccountConfig, Config};
use crate::error::{Error, Result};
use crate::remote::{Connector, Listing, MailSession};
use crate::state::Uid;

pub enum Stream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

pub struct ImapConnector {
    host: String,
    port: u16,
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl ImapConnector {
    pub fn new(config: &Config) -> Result<Self> {
        let (host, port) = config.server_addr()?;
        let tls = if config.ssl {
            Some(TlsConnector::builder().build()?)
        } else {
            None
        };
        Ok(ImapConnector {
            host,
            port,
            timeout: config.timeout(),
            tls,
        })
    }

    fn open_stream(&self) -> Result<Stream> {
        let tcp = self.connect_tcp().map_err(|e| {
            Error::transport(format!("cannot connect to {}:{}: {}", self.host, self.port, e))
        })?;
        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connect(&self.host, tcp)
                    .map_err(|e| Error::transport(format!("TLS handshake: {}", e)))?;
                Ok(Stream::Tls(stream))
            }
            None => Ok(Stream::Plain(tcp)),
        }
    }

    fn connect_tcp(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(self.timeout))?;
                    tcp.set_write_timeout(Some(self.timeout))?;
                    return Ok(tcp);
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved")))
    }
}

impl Connector for ImapConnector {
    type Session = ImapSession;

    fn connect(&self, account: &AccountConfig) -> Result<ImapSession> {
        let mut client = ::imap::Client::new(self.open_stream()?);
        client.read_greeting()?;
        let session = client
            .login(&account.address, &account.password)
            .map_err(|(err, _)| match err {
                ::imap::Error::No(_) | ::imap::Error::Bad(_) => Error::auth(&account.address, err),
                other => Error::from(other),
            })?;
        debug!(account = %account.address, "logged in");
        Ok(ImapSession {
            account: account.address.clone(),
            session,
            selected: None,
        })
    }
}

pub struct ImapSession {
    account: String,
    session: ::imap::Session<Stream>,
    selected: Option<String>,
}

impl ImapSession {
    fn examine(&mut self, mailbox: &str) -> Result<Option<u32>> {
        let info = self.session.examine(mailbox)?;
        self.selected = Some(mailbox.to_string());
        Ok(info.uid_validity)
    }
}

impl MailSession for ImapSession {
    fn list_mailboxes(&mut self) -> Result<Vec<String>> {
        let names = self.session.list(Some(""), Some("*"))?;
        Ok(names
            .iter()
            .filter(|name| !name.attributes().contains(&NameAttribute::NoSelect))
            .map(|name| name.name().to_string())
            .collect())
    }

    fn search(&mut self, mailbox: &str) -> Result<Listing> {
        let uid_validity = self.examine(mailbox)?;
        let mut uids: Vec<Uid> = self.session.uid_search("ALL")?.into_iter().collect();
        uids.sort_unstable();
        Ok(Listing { uid_validity, uids })
    }

    fn fetch_bodies(&mut self, mailbox: &str, uids: &[Uid]) -> Result<BTreeMap<Uid, Vec<u8>>> {
        if uids.is_empty() {
            return Ok(BTreeMap::new());
        }
        if self.selected.as_deref() != Some(mailbox) {
            self.examine(mailbox)?;
        }
        // PEEK keeps the \Seen flag untouched.
        let fetches = self.session.uid_fetch(uid_set(uids), "BODY.PEEK[]")?;
        let mut bodies = BTreeMap::new();
        for fetch in fetches.iter() {
            match (fetch.uid, fetch.body()) {
                (Some(uid), Some(body)) => {
                    bodies.insert(uid, body.to_vec());
                }
                _ => debug!(account = %self.account, mailbox, "fetch response without body"),
            }
        }
        Ok(bodies)
    }

    fn logout(&mut self) {
        if let Err(err) = self.session.logout() {
            warn!(account = %self.account, error = %err, "logout failed");
        }
    }
}

/// Formats identifiers as an IMAP sequence set, collapsing runs into ranges.
fn uid_set(uids: &[Uid]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    if let Some(first) = iter.next() {
        let (mut start, mut end) = (first, first);
        for uid in iter {
            if end.checked_add(1) == Some(uid) {
                end = uid;
                continue;
            }
            parts.push(format_range(start, end));
            start = uid;
            end = uid;
        }
        parts.push(format_range(start, end));
    }
    parts.join(",")
}

fn format_range(start: Uid, end: Uid) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}
