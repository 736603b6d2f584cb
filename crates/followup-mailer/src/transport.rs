//! Outgoing mail transports.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use followup_core::config::MailConfig;
use followup_core::{FollowupError, Result};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use serde::{Deserialize, Serialize};

/// A fully rendered email, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Raw `Name: value` header lines.
    pub headers: Vec<String>,
}

impl OutgoingEmail {
    /// Value of the first header called `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// SMTP via lettre. STARTTLS with credentials when a username is set,
/// plain relay otherwise (local MTA).
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    default_from: Option<Mailbox>,
}

impl SmtpTransport {
    pub fn new(config: &MailConfig, fallback_from: &str) -> Result<Self> {
        let mailer = if config.username.is_empty() {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
                .port(config.smtp_port)
                .build()
        } else {
            let creds = Credentials::new(config.username.clone(), config.password.clone());
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| FollowupError::Transport(format!("SMTP relay: {e}")))?
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        };

        let from = if config.from_email.is_empty() {
            fallback_from
        } else {
            config.from_email.as_str()
        };
        let default_from = from.parse::<Mailbox>().ok();

        tracing::info!(
            "📮 SMTP transport ready: {}:{}",
            config.smtp_host,
            config.smtp_port
        );
        Ok(Self {
            mailer,
            default_from,
        })
    }

    fn build(&self, email: &OutgoingEmail) -> Result<LettreMessage> {
        let from = match email.header("From") {
            Some(raw) => raw
                .parse::<Mailbox>()
                .map_err(|e| FollowupError::Transport(format!("Invalid from: {e}")))?,
            None => self
                .default_from
                .clone()
                .ok_or_else(|| FollowupError::Transport("No sender address configured".into()))?,
        };
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| FollowupError::Transport(format!("Invalid to: {e}")))?;
        let content_type = match email.header("Content-Type") {
            Some(raw) => ContentType::parse(raw)
                .map_err(|e| FollowupError::Transport(format!("Invalid content type: {e}")))?,
            None => ContentType::TEXT_HTML,
        };

        LettreMessage::builder()
            .from(from)
            .to(to)
            .subject(email.subject.as_str())
            .header(content_type)
            .body(email.body.clone())
            .map_err(|e| FollowupError::Transport(format!("Build email: {e}")))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let message = self.build(email)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| FollowupError::Transport(format!("SMTP send: {e}")))?;
        tracing::info!("📤 Email sent to: {}", email.to);
        Ok(())
    }
}

/// Records instead of sending. Used for dry runs and tests; failures can be
/// scripted per call.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutgoingEmail>>,
    script: Mutex<VecDeque<std::result::Result<(), String>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail with `error`.
    pub fn fail_next(&self, n: usize, error: &str) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..n {
            script.push_back(Err(error.to_string()));
        }
    }

    /// Emails accepted so far.
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(Err(e)) = scripted {
            return Err(FollowupError::Transport(e));
        }
        tracing::debug!("📭 Recorded email to {}: {}", email.to, email.subject);
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(())
    }
}
