//! # Followup: deferred jobs and retrying email delivery
//!
//! Usage:
//!   followup run                              # Poll triggers until Ctrl-C
//!   followup send a@b.com -s "Hi" -m "Body" --at 3 --name review_request
//!   followup sequence order_77.json           # Queue a follow-up series
//!   followup pending | stats | logs           # Inspect the queue
//!   followup retry-failed                     # Run the failed-email sweep now

mod app;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use app::{App, SUBSCRIBED_CHECK, SequenceFile, with_recipient};
use clap::{Parser, Subcommand};
use followup_core::{Context, Db, FollowupConfig};
use followup_mailer::{
    DEFAULT_LOG_LIMIT, EmailRequest, MemoryTransport, SendAt, SmtpTransport, Transport,
};
use followup_scheduler::Callable;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "followup",
    version,
    about = "📬 Followup: deferred jobs and retrying email delivery"
)]
struct Cli {
    /// Config file (default: ~/.followup/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database path (overrides the config)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Record emails instead of sending them over SMTP
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the trigger table and run due work until Ctrl-C
    Run {
        /// Seconds between polls (default from config)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Queue one email, or send it right away with --now
    Send {
        to: String,
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        message: String,
        /// Days from now, or a unix timestamp
        #[arg(long, default_value_t = 0)]
        at: i64,
        /// Notification name (review_request, followup, ...)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Template context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Skip the email if the recipient has unsubscribed by then
        #[arg(long)]
        check_subscribed: bool,
        /// Send immediately instead of queueing
        #[arg(long)]
        now: bool,
    },
    /// Queue a follow-up sequence described in a JSON file
    Sequence { file: String },
    /// Run one queued email now
    Execute { id: i64 },
    /// Cancel one pending email
    Cancel { id: i64 },
    /// Cancel every email of a sequence
    CancelSequence { sequence_id: String },
    /// List scheduled and retrying emails
    Pending,
    /// Email counts per status
    Stats,
    /// Recent delivery attempts
    Logs {
        #[arg(short, long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },
    /// Re-queue recently failed emails now
    RetryFailed,
    /// Re-queue one email regardless of its state
    ManualRetry { id: i64 },
    /// Delete finished emails older than the retention window
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Make sure the daily retry and nightly maintenance are registered
    ScheduleMaintenance,
    /// Turn the daily failed-email sweep on or off
    DailyRetry {
        #[arg(long)]
        off: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn parse_context(raw: Option<&str>) -> Result<Context> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--context must be a JSON object"),
        None => Ok(Context::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "followup=debug,followup_core=debug,followup_scheduler=debug,followup_mailer=debug"
    } else {
        "followup=info,followup_core=info,followup_scheduler=info,followup_mailer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => FollowupConfig::load_from(Path::new(&expand_path(path)))?,
        None => FollowupConfig::load()?,
    };
    let db_path = expand_path(cli.db.as_deref().unwrap_or(&config.database.path));
    let db = Db::open(Path::new(&db_path))?;

    let transport: Arc<dyn Transport> = if cli.dry_run {
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(SmtpTransport::new(&config.mail, &config.site.admin_email)?)
    };
    tracing::debug!("🗄️ Database: {db_path} (transport: {})", transport.name());

    let app = Arc::new(App::build(config, db, transport)?);
    let queue = &app.queue;

    match cli.command {
        Command::Run { interval } => {
            let secs = interval.unwrap_or(app.config.runner.tick_interval_secs);
            println!("📬 Followup v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database: {db_path}");
            println!("   ⏱️  Poll:     every {secs}s");
            println!();
            app.clone().run(secs).await?;
        }
        Command::Send {
            to,
            subject,
            message,
            at,
            name,
            notes,
            context,
            check_subscribed,
            now,
        } => {
            let context = with_recipient(parse_context(context.as_deref())?, &to);
            if now {
                let sent = queue.send_now(&to, &subject, &message, &context).await;
                println!("{}", if sent { "✅ Sent" } else { "❌ Send failed" });
                return Ok(());
            }
            let mut req =
                EmailRequest::new(&to, &subject, &message, SendAt::from_raw(at)).with_context(context);
            if let Some(name) = &name {
                req = req.named(name);
            }
            if let Some(notes) = &notes {
                req = req.with_notes(notes);
            }
            if check_subscribed {
                req = req.validated_by(Callable::function(SUBSCRIBED_CHECK));
            }
            let id = queue.send_later(req)?;
            println!("📧 Queued email {id}");
        }
        Command::Sequence { file } => {
            let raw = std::fs::read_to_string(expand_path(&file))
                .with_context(|| format!("Failed to read {file}"))?;
            let seq = SequenceFile::parse(&raw)?.into_sequence();
            let steps = seq.steps.len();
            let id = queue.create_followup_sequence(seq)?;
            println!("📧 Queued sequence {id} ({steps} email(s))");
        }
        Command::Execute { id } => {
            let outcome = queue.execute(id).await?;
            println!("{outcome:?}");
        }
        Command::Cancel { id } => {
            if queue.cancel(id)? {
                println!("🛑 Email {id} canceled");
            } else {
                println!("⚠️  Email {id} is not pending");
            }
        }
        Command::CancelSequence { sequence_id } => {
            let n = queue.cancel_sequence(&sequence_id)?;
            println!("🛑 {n} email(s) of {sequence_id} canceled");
        }
        Command::Pending => {
            let pending = queue.pending_emails()?;
            if pending.is_empty() {
                println!("📭 Nothing pending");
            }
            for p in pending {
                println!(
                    "#{:<6} {:<9} {:<32} in {}d  retries {}{}  {}",
                    p.id,
                    p.status,
                    p.to,
                    p.days_remaining,
                    p.retry_count,
                    if p.has_validation { "  [validated]" } else { "" },
                    p.subject
                );
            }
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&queue.queue_stats()?)?);
        }
        Command::Logs { limit } => {
            for entry in queue.email_logs(limit)? {
                println!(
                    "{}  {:?}  {:<32} {}{}",
                    entry.sent_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.sent,
                    entry.to_email,
                    entry.subject,
                    entry
                        .skip_reason
                        .map(|r| format!("  ({r})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::RetryFailed => {
            let report = queue.retry_all_failed()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ManualRetry { id } => {
            if queue.manual_retry(id)? {
                println!("🔁 Email {id} requeued");
            } else {
                println!("⚠️  No email {id}");
            }
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(app.config.retention.email_queue_days);
            let n = queue.cleanup_old_emails(days)?;
            println!("🧹 Removed {n} email(s) older than {days} days");
        }
        Command::ScheduleMaintenance => {
            match queue.schedule_daily_retry()? {
                Some(at) => println!("🔁 Daily retry: {at}"),
                None => println!("🔁 Daily retry disabled"),
            }
            match app.ensure_maintenance()? {
                Some(at) => println!("🧹 Maintenance scheduled: {at}"),
                None => println!("🧹 Maintenance already scheduled"),
            }
        }
        Command::DailyRetry { off } => {
            queue.set_daily_retry(!off)?;
            match queue.next_daily_retry()? {
                Some(at) => println!("🔁 Daily retry on, next run {at}"),
                None => println!("🔁 Daily retry off"),
            }
        }
    }

    Ok(())
}
