//! Operator alerts: fire-and-forget Telegram messages with per-key throttling.
//!
//! `notify` never blocks and never fails into the caller: the HTTP call runs
//! on a spawned task and its result is only logged. Without a bot token and
//! chat id the notifier is a silent no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    PositionOpened,
    PositionClosed,
    FlattenSubmitted,
    FlattenFailed,
    OrderCountExceeded,
    ModeChanged,
    Requote,
    SignatureRejected,
    Shutdown,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PositionOpened => "position_opened",
            Event::PositionClosed => "position_closed",
            Event::FlattenSubmitted => "flatten_submitted",
            Event::FlattenFailed => "flatten_failed",
            Event::OrderCountExceeded => "order_count_exceeded",
            Event::ModeChanged => "mode_changed",
            Event::Requote => "requote",
            Event::SignatureRejected => "signature_rejected",
            Event::Shutdown => "shutdown",
        }
    }
}

/// Same key inside `window` → dropped.
#[derive(Debug, Clone)]
pub struct Throttle {
    pub key: String,
    pub window: Duration,
}

impl Throttle {
    pub fn new(key: impl Into<String>, window: Duration) -> Self {
        Self {
            key: key.into(),
            window,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event, message: &str, throttle: Option<Throttle>);
}

/// Disabled notifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, event: Event, message: &str, _throttle: Option<Throttle>) {
        debug!("🔕 [{}] {}", event.as_str(), message);
    }
}

#[derive(Debug, Default)]
struct ThrottleGate {
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl ThrottleGate {
    /// True when the message may go out now; records the send time.
    fn admit(&self, throttle: Option<&Throttle>) -> bool {
        let Some(t) = throttle else { return true };
        if t.window.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut last = self.last_sent.lock().unwrap_or_else(|p| p.into_inner());
        match last.get(&t.key) {
            Some(at) if now.duration_since(*at) < t.window => false,
            _ => {
                last.insert(t.key.clone(), now);
                true
            }
        }
    }
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: SecretString,
    chat_id: String,
    account: String,
    gate: ThrottleGate,
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String, account: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: "https://api.telegram.org".to_string(),
            bot_token: SecretString::from(bot_token),
            chat_id,
            account,
            gate: ThrottleGate::default(),
        }
    }

    /// `TELEGRAM_BOT_TOKEN` + `TELEGRAM_CHAT_ID`, else a no-op notifier.
    pub fn from_env(account: &str) -> Arc<dyn Notifier> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty());
        let chat = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty());
        match (token, chat) {
            (Some(token), Some(chat)) => Arc::new(Self::new(token, chat, account.to_string())),
            _ => {
                debug!("🔕 Telegram not configured, alerts disabled");
                Arc::new(NoopNotifier)
            }
        }
    }

    fn render(&self, event: Event, message: &str) -> String {
        format!("*{}*\naccount: `{}`\n{}", event.as_str(), self.account, message)
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, event: Event, message: &str, throttle: Option<Throttle>) {
        if !self.gate.admit(throttle.as_ref()) {
            debug!("🔕 [{}] throttled", event.as_str());
            return;
        }
        // Outside a runtime there is nowhere to send from; drop it.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base,
            self.bot_token.expose_secret()
        );
        let body = json!({
            "chat_id": self.chat_id,
            "text": self.render(event, message),
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        let client = self.client.clone();
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!("📨 Telegram send failed: HTTP {}", resp.status()),
                Err(e) => warn!("📨 Telegram send failed: {}", e.without_url()),
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Captures notifications for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(Event, String)>>,
        gate: ThrottleGate,
    }

    impl RecordingNotifier {
        pub fn events(&self) -> Vec<Event> {
            self.sent.lock().unwrap().iter().map(|(e, _)| *e).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: Event, message: &str, throttle: Option<Throttle>) {
            if self.gate.admit(throttle.as_ref()) {
                self.sent.lock().unwrap().push((event, message.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn throttle_drops_repeats_inside_window() {
        let n = RecordingNotifier::default();
        let t = || Some(Throttle::new("requote", Duration::from_secs(60)));
        n.notify(Event::Requote, "a", t());
        n.notify(Event::Requote, "b", t());
        n.notify(Event::ModeChanged, "c", None);
        n.notify(Event::Requote, "d", Some(Throttle::new("other", Duration::from_secs(60))));
        assert_eq!(
            n.events(),
            vec![Event::Requote, Event::ModeChanged, Event::Requote]
        );
    }

    #[test]
    fn zero_window_never_throttles() {
        let gate = ThrottleGate::default();
        let t = Throttle::new("k", Duration::ZERO);
        assert!(gate.admit(Some(&t)));
        assert!(gate.admit(Some(&t)));
    }

    #[test]
    fn notify_outside_runtime_is_silent() {
        let n = TelegramNotifier::new("t".into(), "c".into(), "acct".into());
        n.notify(Event::Shutdown, "bye", None);
        let rendered = n.render(Event::Shutdown, "bye");
        assert!(rendered.contains("acct"));
        assert!(!format!("{n:?}").contains("bot"));
    }
}
