//! E-mailing receipts to customers over Gmail SMTP.
//!
//! Tries implicit TLS on 465 first. If that fails for any reason other than
//! rejected credentials, retries with STARTTLS on 587.

use std::fs;
use std::path::Path;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::KeyValueFile;
use crate::documents::STORE_NAME;
use crate::error::{PosError, PosResult};

pub const CONFIG_FILE_NAME: &str = "email_config.txt";
const SMTP_HOST: &str = "smtp.gmail.com";
const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct EmailConfig {
    pub sender: String,
    pub app_password: Zeroizing<String>,
    pub host: String,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("sender", &self.sender)
            .field("app_password", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

impl EmailConfig {
    pub fn from_values(file: &KeyValueFile) -> PosResult<Self> {
        let missing = || {
            PosError::Config(
                "e-mail credentials not configured; set EMAIL_GMAIL and EMAIL_GMAIL_APP in \
                 email_config.txt or the environment"
                    .into(),
            )
        };
        let sender = file.get_or_env("EMAIL_GMAIL").ok_or_else(missing)?;
        let app_password = file.get_or_env("EMAIL_GMAIL_APP").ok_or_else(missing)?;
        Ok(Self {
            sender,
            app_password: Zeroizing::new(app_password),
            host: SMTP_HOST.to_string(),
        })
    }

    pub fn load(base_dir: &Path) -> PosResult<Self> {
        let file = KeyValueFile::load(&base_dir.join(CONFIG_FILE_NAME))?;
        Self::from_values(&file)
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(self.sender.clone(), self.app_password.to_string())
    }
}

/// Result of one delivery attempt, reduced to what the fallback needs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Sent,
    AuthRejected(String),
    Failed(String),
}

fn classify(result: Result<lettre::transport::smtp::response::Response, lettre::transport::smtp::Error>) -> Attempt {
    match result {
        Ok(_) => Attempt::Sent,
        Err(e) => {
            let auth = e
                .status()
                .map(|code| matches!(code.to_string().as_str(), "534" | "535"))
                .unwrap_or(false);
            if auth {
                Attempt::AuthRejected(e.to_string())
            } else {
                Attempt::Failed(e.to_string())
            }
        }
    }
}

fn send_with_fallback(
    implicit_tls: impl FnOnce() -> Attempt,
    starttls: impl FnOnce() -> Attempt,
) -> PosResult<()> {
    let first = match implicit_tls() {
        Attempt::Sent => return Ok(()),
        Attempt::AuthRejected(msg) => {
            error!("SMTP authentication failed: {msg}");
            return Err(PosError::Email(format!("SMTP authentication failed: {msg}")));
        }
        Attempt::Failed(msg) => msg,
    };
    warn!("SMTP over TLS failed, retrying with STARTTLS: {first}");

    match starttls() {
        Attempt::Sent => Ok(()),
        Attempt::AuthRejected(second) | Attempt::Failed(second) => {
            error!("Sending e-mail failed (TLS and STARTTLS): {first} | {second}");
            Err(PosError::Email(format!("TLS/STARTTLS failed: {first} | {second}")))
        }
    }
}

fn build_receipt_message(cfg: &EmailConfig, to: &str, attachment: &Path) -> PosResult<Message> {
    if to.trim().is_empty() || !to.contains('@') {
        return Err(PosError::validation("recipient e-mail is empty or invalid"));
    }
    if !attachment.is_file() {
        return Err(PosError::not_found(format!("receipt file {}", attachment.display())));
    }
    let file_name = attachment
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "receipt.txt".to_string());
    let content = fs::read(attachment)?;

    let from: Mailbox = cfg.sender.parse()?;
    let to: Mailbox = to.trim().parse()?;
    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(format!("Your purchase receipt - {STORE_NAME}"))
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(
                    "Hello!\nYour purchase receipt is attached.\nThank you for your business!".to_string(),
                ))
                .singlepart(Attachment::new(file_name).body(content, ContentType::TEXT_PLAIN)),
        )?;
    Ok(message)
}

/// E-mail a receipt file to `to`.
pub fn send_receipt(cfg: &EmailConfig, to: &str, attachment: &Path) -> PosResult<()> {
    let message = build_receipt_message(cfg, to, attachment)?;

    let implicit_tls = || match SmtpTransport::relay(&cfg.host) {
        Ok(builder) => classify(
            builder
                .port(465)
                .timeout(Some(SMTP_TIMEOUT))
                .credentials(cfg.credentials())
                .build()
                .send(&message),
        ),
        Err(e) => Attempt::Failed(e.to_string()),
    };
    let starttls = || match SmtpTransport::starttls_relay(&cfg.host) {
        Ok(builder) => classify(
            builder
                .port(587)
                .timeout(Some(SMTP_TIMEOUT))
                .credentials(cfg.credentials())
                .build()
                .send(&message),
        ),
        Err(e) => Attempt::Failed(e.to_string()),
    };

    send_with_fallback(implicit_tls, starttls)?;
    info!(to = %to, file = %attachment.display(), "Receipt e-mailed");
    Ok(())
}
