use indicatif::MultiProgress;
use rayon::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};

use crate::archive::{ArchiveWriter, ArchivedMessage};
use crate::config::{AccountConfig, Config};
use crate::error::{Error, Result};
use crate::fetch::{BatchFetcher, BatchStats};
use crate::message::{self, Envelope};
use crate::reconcile::reconcile;
use crate::remote::{Connector, MailSession};
use crate::state::{StateKey, StateStore, SyncCursor, Uid};
use crate::summary::{SummaryStore, Tally};
use crate::utils;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Directory holding the archive, sync state and summaries.
    pub root: PathBuf,
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxStatus {
    UpToDate,
    Complete,
    /// Stopped early; the rest of the backlog is retried on the next run.
    Interrupted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxReport {
    pub mailbox: String,
    pub status: MailboxStatus,
    pub stats: BatchStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatus {
    Synced,
    LoginFailed(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountOutcome {
    pub account: String,
    pub status: AccountStatus,
    pub mailboxes: Vec<MailboxReport>,
}

impl AccountOutcome {
    pub fn totals(&self) -> BatchStats {
        let mut totals = BatchStats::default();
        for mailbox in &self.mailboxes {
            totals += mailbox.stats;
        }
        totals
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub accounts: Vec<AccountOutcome>,
}

impl RunReport {
    pub fn account(&self, address: &str) -> Option<&AccountOutcome> {
        self.accounts.iter().find(|a| a.account == address)
    }

    pub fn login_failures(&self) -> Vec<&str> {
        self.accounts
            .iter()
            .filter(|a| matches!(a.status, AccountStatus::LoginFailed(_)))
            .map(|a| a.account.as_str())
            .collect()
    }
}

struct Context<'a> {
    config: &'a Config,
    store: &'a StateStore,
    summaries: &'a SummaryStore,
    archive: &'a ArchiveWriter,
    progress: &'a MultiProgress,
    quiet: bool,
}

/// Everything one account task hands back to the scheduler.
struct AccountRun {
    outcome: AccountOutcome,
    cursors: HashMap<String, SyncCursor>,
    tally: Tally,
}

/// Archives every account in `config`, at most `pool_size` at a time.
///
/// Only configuration problems and an unusable state directory fail the
/// run. Account and mailbox failures are logged and show up in the report.
pub fn synchronize<C: Connector>(
    config: &Config,
    options: &RunOptions,
    connector: &C,
) -> Result<RunReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.pool_size)
        .build()
        .map_err(|e| Error::config(format!("cannot start worker pool: {}", e)))?;

    let store = StateStore::open(&options.root)?;
    let mut jobs: Vec<(&AccountConfig, HashMap<String, SyncCursor>)> = config
        .accounts
        .iter()
        .map(|account| (account, HashMap::new()))
        .collect();
    // Each task owns the cursors of its own account.
    for (key, cursor) in store.load()? {
        if let Some((_, cursors)) = jobs.iter_mut().find(|(a, _)| a.address == key.account) {
            cursors.insert(key.mailbox, cursor);
        }
    }

    let summaries = SummaryStore::new(&options.root);
    let archive = ArchiveWriter::new(&options.root);
    let progress = MultiProgress::new();
    let ctx = Context {
        config,
        store: &store,
        summaries: &summaries,
        archive: &archive,
        progress: &progress,
        quiet: options.quiet,
    };

    info!(accounts = jobs.len(), pool_size = config.pool_size, "starting sync");
    let runs: Vec<AccountRun> = pool.install(|| {
        jobs.into_par_iter()
            .map(|(account, cursors)| sync_account(&ctx, connector, account, cursors))
            .collect()
    });

    let mut report = RunReport::default();
    for run in runs {
        let account = run.outcome.account.as_str();
        let keys: Vec<(StateKey, &SyncCursor)> = run
            .cursors
            .iter()
            .map(|(mailbox, cursor)| (StateKey::new(account, mailbox.as_str()), cursor))
            .collect();
        if let Err(err) = store.flush_all(keys.iter().map(|(k, c)| (k, *c))) {
            error!(account, error = %err, "cannot flush sync state");
        }
        if run.outcome.status == AccountStatus::Synced {
            if let Err(err) = summaries.flush(account, &run.tally) {
                error!(account, error = %err, "cannot flush summary");
            }
        }
        report.accounts.push(run.outcome);
    }

    let failures = report.login_failures();
    if !failures.is_empty() {
        if let Err(err) = summaries.record_login_failures(failures.iter().cloned()) {
            error!(error = %err, "cannot record login failures");
        }
    }
    Ok(report)
}

fn sync_account<C: Connector>(
    ctx: &Context,
    connector: &C,
    account: &AccountConfig,
    mut cursors: HashMap<String, SyncCursor>,
) -> AccountRun {
    let span = info_span!("account", account = %account.address);
    let _enter = span.enter();

    let mut run = AccountRun {
        outcome: AccountOutcome {
            account: account.address.clone(),
            status: AccountStatus::Synced,
            mailboxes: Vec::new(),
        },
        cursors: HashMap::new(),
        tally: Tally::default(),
    };

    let mut session = match connector.connect(account) {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "cannot open session");
            run.outcome.status = if err.is_auth() {
                AccountStatus::LoginFailed(err.to_string())
            } else {
                AccountStatus::Failed(err.to_string())
            };
            run.cursors = cursors;
            return run;
        }
    };

    let mailboxes = match session.list_mailboxes() {
        Ok(mailboxes) => mailboxes,
        Err(err) => {
            error!(error = %err, "cannot list mailboxes");
            session.logout();
            run.outcome.status = AccountStatus::Failed(err.to_string());
            run.cursors = cursors;
            return run;
        }
    };

    let tally = RefCell::new(ctx.summaries.load(&account.address));
    for mailbox in mailboxes {
        let report = sync_mailbox(ctx, &mut session, account, &mailbox, &mut cursors, &tally);
        run.outcome.mailboxes.push(report);
    }
    session.logout();
    run.tally = tally.into_inner();

    let totals = run.outcome.totals();
    info!(
        downloaded = totals.downloaded,
        skipped = totals.skipped,
        failed = totals.failed,
        "account done"
    );
    run.cursors = cursors;
    run
}

fn sync_mailbox<S: MailSession>(
    ctx: &Context,
    session: &mut S,
    account: &AccountConfig,
    mailbox: &str,
    cursors: &mut HashMap<String, SyncCursor>,
    tally: &RefCell<Tally>,
) -> MailboxReport {
    let key = StateKey::new(account.address.as_str(), mailbox);
    let mut report = MailboxReport {
        mailbox: mailbox.to_string(),
        status: MailboxStatus::Complete,
        stats: BatchStats::default(),
    };

    let listing = match session.search(mailbox) {
        Ok(listing) => listing,
        Err(err) => {
            warn!(mailbox, error = %err, "cannot search mailbox");
            report.status = MailboxStatus::Interrupted(err.to_string());
            return report;
        }
    };

    let prior = cursors
        .remove(mailbox)
        .or_else(|| ctx.store.legacy(&key));
    let plan = reconcile(&listing.uids, listing.uid_validity, prior.clone());
    if plan.reset {
        warn!(mailbox, uid_validity = ?listing.uid_validity, "UIDVALIDITY changed, archiving again");
    }
    let mut cursor = plan.cursor;
    if prior.as_ref() != Some(&cursor) {
        if let Err(err) = ctx.store.checkpoint(&key, &cursor) {
            warn!(mailbox, error = %err, "cannot record sync state");
            report.status = MailboxStatus::Interrupted(err.to_string());
            cursors.insert(mailbox.to_string(), cursor);
            return report;
        }
    }

    if plan.to_download.is_empty() {
        info!(mailbox, "no new messages");
        report.status = MailboxStatus::UpToDate;
        cursors.insert(mailbox.to_string(), cursor);
        return report;
    }

    info!(mailbox, count = plan.to_download.len(), "downloading");
    let bar = utils::create_progress_bar(
        ctx.progress,
        ctx.quiet,
        plan.to_download.len(),
        format!("{}/{}", account.address, mailbox),
    );
    let mut fetcher = BatchFetcher::new(ctx.config.page_size);
    let result = fetcher.run(
        &plan.to_download,
        |batch| session.fetch_bodies(mailbox, batch),
        |uid, body| {
            let archived = archive_message(ctx, account, mailbox, listing.uid_validity, uid, body)?;
            tally.borrow_mut().record(&archived.from, &archived.recipients);
            Ok(())
        },
        |batch| {
            // Counts go to disk before the cursor moves past their messages.
            ctx.summaries.flush(&account.address, &tally.borrow())?;
            cursor.mark_archived(batch);
            bar.inc(batch.len() as u64);
            ctx.store.checkpoint(&key, &cursor)
        },
    );
    bar.finish_and_clear();
    report.stats = fetcher.stats();

    match result {
        Ok(()) => {
            let before = cursor.clone();
            cursor.retain_listed(&listing.uids);
            if cursor != before {
                if let Err(err) = ctx.store.checkpoint(&key, &cursor) {
                    warn!(mailbox, error = %err, "cannot record sync state");
                }
            }
        }
        Err(err) => {
            warn!(mailbox, error = %err, "mailbox interrupted, backlog kept for next run");
            report.status = MailboxStatus::Interrupted(err.to_string());
        }
    }
    info!(
        mailbox,
        downloaded = report.stats.downloaded,
        skipped = report.stats.skipped,
        failed = report.stats.failed,
        "mailbox done"
    );
    cursors.insert(mailbox.to_string(), cursor);
    report
}

fn archive_message(
    ctx: &Context,
    account: &AccountConfig,
    mailbox: &str,
    uid_validity: Option<u32>,
    uid: Uid,
    body: &[u8],
) -> Result<Envelope> {
    let envelope = message::parse_envelope(uid, body)?;
    ctx.archive.write(&ArchivedMessage {
        account: &account.address,
        group: account.group.as_deref(),
        mailbox,
        date: envelope.date,
        uid_validity,
        uid,
        subject: envelope.subject.as_deref(),
        body,
    })?;
    Ok(envelope)
}
