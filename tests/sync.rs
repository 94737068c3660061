use mail_archiver::remote::{Connector, Listing, MailSession};
use mail_archiver::state::{Segment, StateKey, StateStore, SyncCursor, Uid, STATE_DIR};
use mail_archiver::summary::{SummaryStore, SENDERS_FILE};
use mail_archiver::sync::{AccountStatus, MailboxStatus, RunOptions, RunReport};
use mail_archiver::{synchronize, AccountConfig, Config, Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const DATE_DIR: &str = "2016-09-29";

#[derive(Clone, Default)]
struct Mailbox {
    uid_validity: u32,
    messages: BTreeMap<Uid, Vec<u8>>,
    /// Listed by SEARCH but never returned by FETCH.
    ghosts: Vec<Uid>,
}

#[derive(Default)]
struct Server {
    passwords: Mutex<HashMap<String, String>>,
    mailboxes: Mutex<HashMap<(String, String), Mailbox>>,
    fail_on: Mutex<Option<Uid>>,
    /// Simulates the process dying in the middle of a fetch.
    crash_on: Mutex<Option<Uid>>,
    fetches: Mutex<Vec<(String, String, Vec<Uid>)>>,
    watch_root: Mutex<Option<PathBuf>>,
    observed: Mutex<Vec<SyncCursor>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Server {
    fn add_account(&self, address: &str, password: &str) {
        self.passwords
            .lock()
            .unwrap()
            .insert(address.to_string(), password.to_string());
    }

    fn put(&self, account: &str, mailbox: &str, uid: Uid, body: Vec<u8>) {
        self.with_mailbox(account, mailbox, |m| {
            m.messages.insert(uid, body);
        });
    }

    fn with_mailbox<F: FnOnce(&mut Mailbox)>(&self, account: &str, mailbox: &str, f: F) {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        let entry = mailboxes
            .entry((account.to_string(), mailbox.to_string()))
            .or_insert_with(|| Mailbox {
                uid_validity: 1,
                ..Mailbox::default()
            });
        f(entry);
    }

    fn mailbox(&self, account: &str, mailbox: &str) -> Result<Mailbox> {
        self.mailboxes
            .lock()
            .unwrap()
            .get(&(account.to_string(), mailbox.to_string()))
            .cloned()
            .ok_or_else(|| Error::transport("NO no such mailbox"))
    }

    fn fetched(&self, account: &str, mailbox: &str) -> Vec<Vec<Uid>> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, m, _)| a == account && m == mailbox)
            .map(|(_, _, uids)| uids.clone())
            .collect()
    }
}

#[derive(Clone, Default)]
struct FakeConnector(Arc<Server>);

impl Connector for FakeConnector {
    type Session = FakeSession;

    fn connect(&self, account: &AccountConfig) -> Result<FakeSession> {
        let expected = self.0.passwords.lock().unwrap().get(&account.address).cloned();
        if expected.as_deref() != Some(account.password.as_str()) {
            return Err(Error::auth(&account.address, "NO [AUTHENTICATIONFAILED]"));
        }
        let active = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(FakeSession {
            server: self.0.clone(),
            account: account.address.clone(),
        })
    }
}

struct FakeSession {
    server: Arc<Server>,
    account: String,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.server.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MailSession for FakeSession {
    fn list_mailboxes(&mut self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .server
            .mailboxes
            .lock()
            .unwrap()
            .keys()
            .filter(|(account, _)| *account == self.account)
            .map(|(_, mailbox)| mailbox.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn search(&mut self, mailbox: &str) -> Result<Listing> {
        let mailbox = self.server.mailbox(&self.account, mailbox)?;
        let mut uids: Vec<Uid> = mailbox
            .messages
            .keys()
            .chain(mailbox.ghosts.iter())
            .cloned()
            .collect();
        // Servers commonly list newest first.
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(Listing {
            uid_validity: Some(mailbox.uid_validity),
            uids,
        })
    }

    fn fetch_bodies(&mut self, mailbox: &str, uids: &[Uid]) -> Result<BTreeMap<Uid, Vec<u8>>> {
        let watch_root = self.server.watch_root.lock().unwrap().clone();
        if let Some(root) = watch_root {
            let cursors = StateStore::open(&root).unwrap().load().unwrap();
            let key = StateKey::new(self.account.as_str(), mailbox);
            let cursor = cursors.get(&key).cloned().unwrap_or_default();
            self.server.observed.lock().unwrap().push(cursor);
        }
        self.server.fetches.lock().unwrap().push((
            self.account.clone(),
            mailbox.to_string(),
            uids.to_vec(),
        ));
        let crash_on = *self.server.crash_on.lock().unwrap();
        if crash_on.map_or(false, |uid| uids.contains(&uid)) {
            panic!("process killed while fetching {:?}", uids);
        }
        if let Some(fail_on) = *self.server.fail_on.lock().unwrap() {
            if uids.contains(&fail_on) {
                return Err(Error::transport("connection reset by peer"));
            }
        }
        let mailbox = self.server.mailbox(&self.account, mailbox)?;
        Ok(uids
            .iter()
            .filter_map(|uid| mailbox.messages.get(uid).map(|body| (*uid, body.clone())))
            .collect())
    }
}

fn mail(uid: Uid) -> Vec<u8> {
    format!(
        "From: Sender {0} <sender{0}@example.com>\r\n\
         To: me@example.com\r\n\
         Subject: Message {0}\r\n\
         Date: Thu, 29 Sep 2016 23:18:26 +0000\r\n\
         \r\n\
         body {0}\r\n",
        uid
    )
    .into_bytes()
}

fn config(page_size: usize, pool_size: usize, accounts: &[(&str, &str)]) -> Config {
    let mut text = format!(
        "server = \"imap.example.com\"\npage_size = {}\npool_size = {}\n",
        page_size, pool_size
    );
    for (address, password) in accounts {
        text.push_str(&format!(
            "[[accounts]]\naddress = \"{}\"\npassword = \"{}\"\n",
            address, password
        ));
    }
    Config::parse(&text).unwrap()
}

fn run(config: &Config, root: &Path, connector: &FakeConnector) -> RunReport {
    let options = RunOptions {
        root: root.to_path_buf(),
        quiet: true,
    };
    synchronize(config, &options, connector).unwrap()
}

fn message_path(root: &Path, account: &str, mailbox: &str, uid: Uid) -> PathBuf {
    root.join("email")
        .join(account)
        .join(mailbox)
        .join(DATE_DIR)
        .join(format!("{}-Message {}.eml", uid, uid))
}

fn stored_cursor(root: &Path, account: &str, mailbox: &str) -> SyncCursor {
    let cursors = StateStore::open(root).unwrap().load().unwrap();
    cursors[&StateKey::new(account, mailbox)].clone()
}

const ALICE: &str = "alice@example.com";

fn server_with_inbox(uids: std::ops::RangeInclusive<Uid>) -> FakeConnector {
    let connector = FakeConnector::default();
    connector.0.add_account(ALICE, "pw");
    for uid in uids {
        connector.0.put(ALICE, "INBOX", uid, mail(uid));
    }
    connector
}

#[test]
fn first_sync_pages_and_checkpoints() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=3);
    *connector.0.watch_root.lock().unwrap() = Some(root.path().to_path_buf());

    let report = run(&config(2, 2, &[(ALICE, "pw")]), root.path(), &connector);

    assert_eq!(connector.0.fetched(ALICE, "INBOX"), vec![vec![1, 2], vec![3]]);
    let observed = connector.0.observed.lock().unwrap().clone();
    assert_eq!(observed.len(), 2);
    assert!(!observed[0].is_archived(1));
    // The first page is on disk before the second one is fetched.
    assert!(observed[1].is_archived(1));
    assert!(observed[1].is_archived(2));
    assert!(!observed[1].is_archived(3));

    let outcome = report.account(ALICE).unwrap();
    assert_eq!(outcome.status, AccountStatus::Synced);
    assert_eq!(outcome.mailboxes[0].status, MailboxStatus::Complete);
    assert_eq!(outcome.totals().downloaded, 3);
    for uid in 1..=3 {
        let path = message_path(root.path(), ALICE, "INBOX", uid);
        assert_eq!(fs::read(&path).unwrap(), mail(uid));
    }

    let cursor = stored_cursor(root.path(), ALICE, "INBOX");
    assert_eq!(cursor.newest, Some(3));
    assert!(cursor.segments.is_empty());
    assert!(root.path().join(STATE_DIR).is_dir());
}

#[test]
fn later_runs_only_fetch_new_messages() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=3);
    let config = config(100, 2, &[(ALICE, "pw")]);
    run(&config, root.path(), &connector);

    let report = run(&config, root.path(), &connector);
    let outcome = report.account(ALICE).unwrap();
    assert_eq!(outcome.mailboxes[0].status, MailboxStatus::UpToDate);
    assert_eq!(connector.0.fetched(ALICE, "INBOX").len(), 1);

    connector.0.put(ALICE, "INBOX", 4, mail(4));
    connector.0.put(ALICE, "INBOX", 10, mail(10));
    run(&config, root.path(), &connector);
    assert_eq!(
        connector.0.fetched(ALICE, "INBOX"),
        vec![vec![1, 2, 3], vec![4, 10]]
    );
}

#[test]
fn interrupted_mailbox_resumes_at_the_failed_page() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=5);
    let config = config(2, 2, &[(ALICE, "pw")]);
    *connector.0.fail_on.lock().unwrap() = Some(3);

    let report = run(&config, root.path(), &connector);
    let outcome = report.account(ALICE).unwrap();
    assert_eq!(outcome.status, AccountStatus::Synced);
    assert!(matches!(
        outcome.mailboxes[0].status,
        MailboxStatus::Interrupted(_)
    ));
    assert_eq!(outcome.mailboxes[0].stats.downloaded, 2);
    assert!(!message_path(root.path(), ALICE, "INBOX", 3).exists());

    *connector.0.fail_on.lock().unwrap() = None;
    connector.0.fetches.lock().unwrap().clear();
    let report = run(&config, root.path(), &connector);
    assert_eq!(
        report.account(ALICE).unwrap().mailboxes[0].status,
        MailboxStatus::Complete
    );
    // Only the page that failed is fetched again.
    assert_eq!(connector.0.fetched(ALICE, "INBOX"), vec![vec![3, 4], vec![5]]);
    for uid in 1..=5 {
        assert!(message_path(root.path(), ALICE, "INBOX", uid).exists());
    }
}

#[test]
fn counts_survive_a_crash_between_pages() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=4);
    let config = config(2, 1, &[(ALICE, "pw")]);
    *connector.0.crash_on.lock().unwrap() = Some(3);

    let options = RunOptions {
        root: root.path().to_path_buf(),
        quiet: true,
    };
    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        synchronize(&config, &options, &connector)
    }));
    assert!(crashed.is_err());
    let cursor = stored_cursor(root.path(), ALICE, "INBOX");
    assert!(cursor.is_archived(1) && cursor.is_archived(2));
    assert!(!cursor.is_archived(3));

    *connector.0.crash_on.lock().unwrap() = None;
    run(&config, root.path(), &connector);

    let tally = SummaryStore::new(root.path()).load(ALICE);
    let senders: Vec<(&str, u64)> = tally
        .senders
        .iter()
        .map(|(addr, count)| (addr.as_str(), *count))
        .collect();
    assert_eq!(
        senders,
        vec![
            ("sender1@example.com", 1),
            ("sender2@example.com", 1),
            ("sender3@example.com", 1),
            ("sender4@example.com", 1),
        ]
    );
    assert_eq!(tally.recipients["me@example.com"], 4);
}

#[test]
fn backlog_is_fetched_before_newer_messages() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=120);
    StateStore::open(root.path())
        .unwrap()
        .checkpoint(
            &StateKey::new(ALICE, "INBOX"),
            &SyncCursor {
                uid_validity: Some(1),
                newest: Some(100),
                segments: vec![Segment::new(50, 10)],
            },
        )
        .unwrap();

    run(&config(15, 2, &[(ALICE, "pw")]), root.path(), &connector);

    let fetched: Vec<Uid> = connector
        .0
        .fetched(ALICE, "INBOX")
        .into_iter()
        .flatten()
        .collect();
    let expected: Vec<Uid> = (10..50).chain(101..=120).collect();
    assert_eq!(fetched, expected);
    let cursor = stored_cursor(root.path(), ALICE, "INBOX");
    assert_eq!(cursor.newest, Some(120));
    assert!(cursor.segments.is_empty());
}

#[test]
fn failed_login_does_not_stop_other_accounts() {
    let root = TempDir::new().unwrap();
    let bob = "bob@example.com";
    let connector = server_with_inbox(1..=2);
    connector.0.add_account(bob, "pw");
    connector.0.put(bob, "INBOX", 1, mail(1));
    connector.0.put(bob, "Sent", 7, mail(7));

    let config = config(10, 2, &[(ALICE, "wrong"), (bob, "pw")]);
    let report = run(&config, root.path(), &connector);

    assert!(matches!(
        report.account(ALICE).unwrap().status,
        AccountStatus::LoginFailed(_)
    ));
    assert_eq!(report.login_failures(), vec![ALICE]);
    let outcome = report.account(bob).unwrap();
    assert_eq!(outcome.status, AccountStatus::Synced);
    assert_eq!(outcome.totals().downloaded, 2);
    assert!(message_path(root.path(), bob, "INBOX", 1).exists());
    assert!(message_path(root.path(), bob, "Sent", 7).exists());
    assert!(!root.path().join("email").join(ALICE).exists());

    let summaries = SummaryStore::new(root.path());
    assert_eq!(summaries.login_failures(), vec![ALICE.to_string()]);
    let senders = fs::read_to_string(summaries.account_dir(bob).join(SENDERS_FILE)).unwrap();
    assert_eq!(senders, "sender1@example.com:1\nsender7@example.com:1\n");
    assert_eq!(summaries.load(bob).recipients["me@example.com"], 2);
}

#[test]
fn bad_messages_do_not_stop_the_batch() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=1);
    connector.0.put(
        ALICE,
        "INBOX",
        2,
        b"From: x@example.com\r\nSubject: \xb2\xe2\xca\xd4\xff\r\n\
          Date: Thu, 29 Sep 2016 23:18:26 +0000\r\n\r\nbody"
            .to_vec(),
    );
    connector.0.put(ALICE, "INBOX", 3, Vec::new());
    connector.0.put(ALICE, "INBOX", 4, mail(4));

    let report = run(&config(10, 1, &[(ALICE, "pw")]), root.path(), &connector);

    let stats = report.account(ALICE).unwrap().mailboxes[0].stats;
    assert_eq!(stats.downloaded, 3);
    assert_eq!(stats.failed, 1);
    let dir = root.path().join("email").join(ALICE).join("INBOX").join(DATE_DIR);
    assert!(dir.join("2-invalid-subject.eml").exists());
    assert!(message_path(root.path(), ALICE, "INBOX", 1).exists());
    assert!(message_path(root.path(), ALICE, "INBOX", 4).exists());
}

#[test]
fn missing_messages_are_skipped_once() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=3);
    connector
        .0
        .with_mailbox(ALICE, "INBOX", |m| m.ghosts.push(5));
    let config = config(10, 1, &[(ALICE, "pw")]);

    let report = run(&config, root.path(), &connector);
    let stats = report.account(ALICE).unwrap().mailboxes[0].stats;
    assert_eq!((stats.downloaded, stats.skipped), (3, 1));

    let report = run(&config, root.path(), &connector);
    assert_eq!(
        report.account(ALICE).unwrap().mailboxes[0].status,
        MailboxStatus::UpToDate
    );
}

#[test]
fn uid_validity_change_archives_again() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=2);
    let config = config(10, 1, &[(ALICE, "pw")]);
    run(&config, root.path(), &connector);

    // The mailbox was renumbered: UID 1 now names a different message that
    // happens to share subject and date with the old one.
    let mut renumbered = mail(1);
    renumbered.extend_from_slice(b"a different message\r\n");
    connector.0.with_mailbox(ALICE, "INBOX", |m| {
        m.uid_validity = 2;
        m.messages.insert(1, renumbered.clone());
    });
    run(&config, root.path(), &connector);
    assert_eq!(
        connector.0.fetched(ALICE, "INBOX"),
        vec![vec![1, 2], vec![1, 2]]
    );
    assert_eq!(stored_cursor(root.path(), ALICE, "INBOX").uid_validity, Some(2));

    let old = message_path(root.path(), ALICE, "INBOX", 1);
    assert_eq!(fs::read(&old).unwrap(), mail(1));
    let new = old.with_file_name("1-2-Message 1.eml");
    assert_eq!(fs::read(&new).unwrap(), renumbered);
    // Unchanged messages are not duplicated.
    assert!(!old.with_file_name("2-2-Message 2.eml").exists());
    let files = fs::read_dir(old.parent().unwrap()).unwrap().count();
    assert_eq!(files, 3);
}

#[test]
fn legacy_state_is_imported() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=4);
    let meta = root.path().join(STATE_DIR);
    fs::create_dir_all(&meta).unwrap();
    fs::write(meta.join(format!("{}-INBOX.meta", ALICE)), "1,3").unwrap();

    run(&config(10, 1, &[(ALICE, "pw")]), root.path(), &connector);
    assert_eq!(connector.0.fetched(ALICE, "INBOX"), vec![vec![2, 4]]);
}

#[test]
fn groups_prefix_the_account_directory() {
    let root = TempDir::new().unwrap();
    let connector = server_with_inbox(1..=1);
    let config = Config::parse(&format!(
        "server = \"imap.example.com\"\n\
         [[accounts]]\naddress = \"{}\"\npassword = \"pw\"\n\
         [groups]\nsales = [\"{}\"]\n",
        ALICE, ALICE
    ))
    .unwrap();

    run(&config, root.path(), &connector);
    let path = root
        .path()
        .join("email")
        .join("sales")
        .join(ALICE)
        .join("INBOX")
        .join(DATE_DIR)
        .join("1-Message 1.eml");
    assert!(path.exists());
}

#[test]
fn pool_size_bounds_open_sessions() {
    let root = TempDir::new().unwrap();
    let connector = FakeConnector::default();
    let accounts: Vec<String> = (0..6).map(|i| format!("user{}@example.com", i)).collect();
    for account in &accounts {
        connector.0.add_account(account, "pw");
        for uid in 1..=3 {
            connector.0.put(account, "INBOX", uid, mail(uid));
        }
    }
    let pairs: Vec<(&str, &str)> = accounts.iter().map(|a| (a.as_str(), "pw")).collect();

    let report = run(&config(1, 2, &pairs), root.path(), &connector);

    assert!(connector.0.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(connector.0.active.load(Ordering::SeqCst), 0);
    assert_eq!(report.accounts.len(), 6);
    for account in &accounts {
        let outcome = report.account(account).unwrap();
        assert_eq!(outcome.status, AccountStatus::Synced);
        assert_eq!(outcome.totals().downloaded, 3);
        assert_eq!(stored_cursor(root.path(), account, "INBOX").newest, Some(3));
    }
}
