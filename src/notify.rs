//! Optional Telegram notifications.
//!
//! When `telegram_config.txt` (or the environment) provides a bot token and
//! chat id, sales events and generated documents are pushed to the owner's
//! chat. Each send runs on its own short-lived thread and is never awaited
//! or retried; failures only reach the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::KeyValueFile;
use crate::error::{PosError, PosResult};

pub const CONFIG_FILE_NAME: &str = "telegram_config.txt";
const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct TelegramConfig {
    pub bot_token: Zeroizing<String>,
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramConfig {
    /// `None` when either value is missing; notifications are then off.
    pub fn from_values(file: &KeyValueFile) -> Option<Self> {
        let bot_token = file.get_or_env("TELEGRAM_BOT_TOKEN")?;
        let chat_id = file.get_or_env("TELEGRAM_CHAT_ID")?;
        Some(Self {
            bot_token: Zeroizing::new(bot_token),
            chat_id,
        })
    }

    pub fn load(base_dir: &Path) -> PosResult<Option<Self>> {
        let file = KeyValueFile::load(&base_dir.join(CONFIG_FILE_NAME))?;
        let cfg = Self::from_values(&file);
        if cfg.is_none() {
            info!("Telegram notifications disabled (no credentials)");
        }
        Ok(cfg)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.bot_token.as_str())
    }
}

/// Where notifications are delivered. Calls block; [`Notifier`] moves them
/// off the caller's thread.
pub trait Channel: Send + Sync + 'static {
    fn send_message(&self, text: &str) -> PosResult<()>;
    fn send_document(&self, path: &Path, caption: Option<&str>) -> PosResult<()>;
}

impl Channel for TelegramConfig {
    fn send_message(&self, text: &str) -> PosResult<()> {
        send_message(self, text)
    }

    fn send_document(&self, path: &Path, caption: Option<&str>) -> PosResult<()> {
        send_document_blocking(self, path, caption)
    }
}

#[derive(Clone)]
pub struct Notifier {
    channel: Arc<dyn Channel>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self::with_channel(config)
    }

    pub fn with_channel(channel: impl Channel) -> Self {
        Self {
            channel: Arc::new(channel),
        }
    }

    /// Send a text message in the background.
    pub fn notify(&self, text: impl Into<String>) {
        let channel = Arc::clone(&self.channel);
        let text = text.into();
        spawn_send("sendMessage", move || channel.send_message(&text));
    }

    /// Upload a document in the background.
    pub fn send_document(&self, path: impl Into<PathBuf>, caption: Option<String>) {
        let channel = Arc::clone(&self.channel);
        let path = path.into();
        spawn_send("sendDocument", move || {
            channel.send_document(&path, caption.as_deref())
        });
    }
}

fn spawn_send<F>(method: &'static str, job: F)
where
    F: FnOnce() -> PosResult<()> + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("telegram-{method}"))
        .spawn(move || match job() {
            Ok(()) => debug!(method, "Telegram notification sent"),
            Err(e) => warn!(method, "Telegram notification failed: {e}"),
        });
    if let Err(e) = spawned {
        warn!(method, "Could not start notification thread: {e}");
    }
}

fn client() -> PosResult<Client> {
    Ok(Client::builder().timeout(SEND_TIMEOUT).build()?)
}

fn check_status(method: &str, resp: reqwest::blocking::Response) -> PosResult<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().unwrap_or_default();
    Err(PosError::Config(format!(
        "Telegram {method} returned {status}: {}",
        body.chars().take(200).collect::<String>()
    )))
}

pub fn send_message(config: &TelegramConfig, text: &str) -> PosResult<()> {
    let resp = client()?
        .post(config.method_url("sendMessage"))
        .form(&[("chat_id", config.chat_id.as_str()), ("text", text)])
        .send()?;
    check_status("sendMessage", resp)
}

pub fn send_document_blocking(config: &TelegramConfig, path: &Path, caption: Option<&str>) -> PosResult<()> {
    let mut form = multipart::Form::new()
        .text("chat_id", config.chat_id.clone())
        .file("document", path)?;
    if let Some(caption) = caption {
        form = form.text("caption", caption.to_string());
    }
    let resp = client()?
        .post(config.method_url("sendDocument"))
        .multipart(form)
        .send()?;
    check_status("sendDocument", resp)
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingChannel;
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        std::env::remove_var("TELEGRAM_CHAT_ID");
    }

    #[test]
    fn test_notifier_delivers_in_the_background() {
        let channel = RecordingChannel::default();
        let notifier = Notifier::with_channel(channel.clone());

        notifier.notify("Sale #1");
        notifier.send_document("reports/day_report_10-05-2024.txt", Some("Cash closed".into()));

        assert!(channel.wait_until(|c| c.messages().len() == 1 && c.documents().len() == 1));
        assert_eq!(channel.messages(), vec!["Sale #1".to_string()]);
        assert_eq!(channel.documents()[0].1.as_deref(), Some("Cash closed"));
    }

    #[test]
    #[serial]
    fn test_config_requires_both_values() {
        clear_env();
        let only_token = KeyValueFile::parse("TELEGRAM_BOT_TOKEN=123:abc").unwrap();
        assert!(TelegramConfig::from_values(&only_token).is_none());

        let both = KeyValueFile::parse("TELEGRAM_BOT_TOKEN=123:abc\nTELEGRAM_CHAT_ID=-10042").unwrap();
        let cfg = TelegramConfig::from_values(&both).unwrap();
        assert_eq!(cfg.chat_id, "-10042");
        assert_eq!(
            cfg.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    #[serial]
    fn test_chat_id_falls_back_to_environment() {
        clear_env();
        std::env::set_var("TELEGRAM_CHAT_ID", "777");
        let file = KeyValueFile::parse("TELEGRAM_BOT_TOKEN=t").unwrap();
        let cfg = TelegramConfig::from_values(&file).unwrap();
        assert_eq!(cfg.chat_id, "777");
        clear_env();
    }

    #[test]
    fn test_debug_output_hides_token() {
        let cfg = TelegramConfig {
            bot_token: Zeroizing::new("secret-token".into()),
            chat_id: "1".into(),
        };
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("secret-token"));
    }
}
