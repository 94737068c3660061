mod args;

use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use args::Args;
use mail_archiver::imap::ImapConnector;
use mail_archiver::sync::{AccountStatus, MailboxStatus, RunOptions, RunReport};
use mail_archiver::Config;

const LOG_FILE: &str = "mailer.log";

fn setup_logging(data: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(data.join(LOG_FILE))
        .ok();

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fall back to stderr if the log file cannot be opened.
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    do_main(&Args::parse_args())
}

fn do_main(args: &Args) -> Result<()> {
    if !args.config.is_file() {
        bail!("config file {} does not exist", args.config.display());
    }
    if !args.data.is_dir() {
        bail!("data directory {} does not exist", args.data.display());
    }
    setup_logging(&args.data);

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let connector = ImapConnector::new(&config).context("failed to set up the IMAP client")?;

    if !args.quiet {
        eprintln!("Archiving {} account(s)...", config.accounts.len());
    }
    let options = RunOptions {
        root: args.data.clone(),
        quiet: args.quiet,
    };
    let report = mail_archiver::synchronize(&config, &options, &connector)?;
    info!(accounts = report.accounts.len(), "run finished");
    print_report(&report);

    Ok(())
}

fn print_report(report: &RunReport) {
    for account in &report.accounts {
        let totals = account.totals();
        match &account.status {
            AccountStatus::Synced => println!(
                "{}: {} downloaded, {} skipped, {} failed",
                account.account, totals.downloaded, totals.skipped, totals.failed
            ),
            AccountStatus::LoginFailed(reason) => {
                println!("{}: login failed: {}", account.account, reason)
            }
            AccountStatus::Failed(reason) => println!("{}: failed: {}", account.account, reason),
        }
        for mailbox in &account.mailboxes {
            let stats = mailbox.stats;
            let status = match &mailbox.status {
                MailboxStatus::UpToDate => "no new messages".to_string(),
                MailboxStatus::Complete => format!(
                    "{} downloaded, {} skipped, {} failed",
                    stats.downloaded, stats.skipped, stats.failed
                ),
                MailboxStatus::Interrupted(reason) => format!(
                    "interrupted after {} downloaded: {}",
                    stats.downloaded, reason
                ),
            };
            println!("  {}: {}", mailbox.mailbox, status);
        }
    }
}
