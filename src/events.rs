//! In-process event fan-out.
//!
//! Two channels decouple the protocol path from its observers: masked
//! transaction records, and dashboard log lines. Both ride bounded
//! broadcast channels, so a slow or dead subscriber loses its oldest
//! events instead of ever delaying a SIP2 operation. Every transaction
//! is also reforwarded onto the dashboard channel, giving consumers one
//! unified stream.
//!
//! Dashboard `details` may carry raw wire text under `raw` or `message`
//! keys; credential and identifier tag runs are redacted before the line
//! leaves the bus. The caller's value is cloned, never mutated.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::mask::Masker;

/// Events retained per subscriber before drop-oldest kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// Tag runs blanked outright in dashboard details.
const CREDENTIAL_TAGS: [&str; 3] = ["CN", "CO", "AD"];

/// Tag runs replaced by the deterministic mask in dashboard details.
const IDENTIFIER_TAGS: [&str; 3] = ["AA", "AE", "AB"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One dashboard log line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardLine {
    /// ISO-8601 UTC emission time.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    pub details: Value,
}

pub struct EventBus {
    masker: Arc<Masker>,
    transactions: broadcast::Sender<Value>,
    dashboard: broadcast::Sender<DashboardLine>,
}

impl EventBus {
    pub fn new(masker: Arc<Masker>) -> Self {
        let (transactions, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (dashboard, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { masker, transactions, dashboard }
    }

    pub fn subscribe_transactions(&self) -> broadcast::Receiver<Value> {
        self.transactions.subscribe()
    }

    pub fn subscribe_dashboard(&self) -> broadcast::Receiver<DashboardLine> {
        self.dashboard.subscribe()
    }

    /// Publish a masked transaction record. Best-effort: with no
    /// subscribers the event is dropped silently.
    pub fn emit_log(&self, payload: Value) {
        let _ = self.transactions.send(payload.clone());
        self.log_to_dashboard(LogLevel::Info, "SIP2 Transaction", &payload);
    }

    /// Publish a dashboard line, redacting sensitive tag runs in
    /// `details` first.
    pub fn log_to_dashboard(&self, level: LogLevel, message: &str, details: &Value) {
        let line = DashboardLine {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            message: message.to_string(),
            details: self.redact_details(details),
        };
        if self.dashboard.send(line).is_err() {
            trace!(message, "no dashboard subscribers");
        }
    }

    /// Clone `details` with every string-valued `raw` or `message` field
    /// stripped of SIP2 credential and identifier tag runs.
    fn redact_details(&self, details: &Value) -> Value {
        match details {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    let redacted = match value {
                        Value::String(s) if key == "raw" || key == "message" => {
                            Value::String(self.redact_tag_runs(s))
                        }
                        nested => self.redact_details(nested),
                    };
                    out.insert(key.clone(), redacted);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_details(v)).collect())
            }
            other => other.clone(),
        }
    }

    fn redact_tag_runs(&self, text: &str) -> String {
        let mut out = replace_tag_runs(text, &CREDENTIAL_TAGS, |_| "********".to_string());
        out = replace_tag_runs(&out, &IDENTIFIER_TAGS, |value| {
            self.masker.mask(value).unwrap_or_else(|_| "********".to_string())
        });
        out
    }
}

/// Replace the value of each `<tag><value>` run, where a value extends to
/// the next `|`, `\r`, or end of string.
fn replace_tag_runs(text: &str, tags: &[&str], replace: impl Fn(&str) -> String) -> String {
    let mut out = text.to_string();
    for tag in tags {
        out = replace_one_tag(&out, tag, &replace);
    }
    out
}

fn replace_one_tag(text: &str, tag: &str, replace: &impl Fn(&str) -> String) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(tag) {
        let value_start = pos + tag.len();
        result.push_str(&rest[..value_start]);
        let tail = &rest[value_start..];
        let value_end = tail.find(['|', '\r']).unwrap_or(tail.len());
        result.push_str(&replace(&tail[..value_end]));
        rest = &tail[value_end..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(Masker::new(b"0123456789abcdef0123456789abcdef")))
    }

    fn unkeyed_bus() -> EventBus {
        EventBus::new(Arc::new(Masker::unkeyed()))
    }

    #[tokio::test]
    async fn test_transaction_delivery_in_order() {
        let bus = bus();
        let mut rx = bus.subscribe_transactions();
        bus.emit_log(json!({"n": 1}));
        bus.emit_log(json!({"n": 2}));
        assert_eq!(rx.recv().await.unwrap()["n"], 1);
        assert_eq!(rx.recv().await.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = bus();
        bus.emit_log(json!({"n": 1}));
        bus.log_to_dashboard(LogLevel::Warn, "hello", &json!({}));
    }

    #[tokio::test]
    async fn test_transactions_reforwarded_to_dashboard() {
        let bus = bus();
        let mut rx = bus.subscribe_dashboard();
        bus.emit_log(json!({"action": "checkout"}));
        let line = rx.recv().await.unwrap();
        assert_eq!(line.message, "SIP2 Transaction");
        assert_eq!(line.level, LogLevel::Info);
        assert_eq!(line.details["action"], "checkout");
    }

    #[tokio::test]
    async fn test_credential_tags_blanked() {
        let bus = bus();
        let mut rx = bus.subscribe_dashboard();
        let details = json!({"raw": "9300CNscuser|COscpass|CPLOC|"});
        bus.log_to_dashboard(LogLevel::Debug, "request", &details);
        let line = rx.recv().await.unwrap();
        let raw = line.details["raw"].as_str().unwrap();
        assert_eq!(raw, "9300CN********|CO********|CPLOC|");
        // caller data untouched
        assert_eq!(details["raw"], "9300CNscuser|COscpass|CPLOC|");
    }

    #[tokio::test]
    async fn test_identifier_tags_masked_deterministically() {
        let bus = bus();
        let mut rx = bus.subscribe_dashboard();
        bus.log_to_dashboard(LogLevel::Debug, "request", &json!({"raw": "AAP12345|ABI1|"}));
        bus.log_to_dashboard(LogLevel::Debug, "request", &json!({"raw": "AAP12345|ABI1|"}));
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let raw = a.details["raw"].as_str().unwrap();
        assert!(raw.starts_with("AAMASKED_"));
        assert!(raw.contains("|ABMASKED_"));
        assert!(!raw.contains("P12345"));
        assert_eq!(raw, b.details["raw"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_identifier_tags_blanked_without_key() {
        let bus = unkeyed_bus();
        let mut rx = bus.subscribe_dashboard();
        bus.log_to_dashboard(LogLevel::Debug, "request", &json!({"raw": "AAP12345|"}));
        let line = rx.recv().await.unwrap();
        assert_eq!(line.details["raw"], "AA********|");
    }

    #[tokio::test]
    async fn test_nested_message_fields_redacted() {
        let bus = bus();
        let mut rx = bus.subscribe_dashboard();
        let details = json!({"inner": {"message": "ADsecret|", "other": "ADsecret|"}});
        bus.log_to_dashboard(LogLevel::Error, "oops", &details);
        let line = rx.recv().await.unwrap();
        assert_eq!(line.details["inner"]["message"], "AD********|");
        // only raw/message fields are rewritten
        assert_eq!(line.details["inner"]["other"], "ADsecret|");
    }

    #[test]
    fn test_replace_tag_run_at_end_of_string() {
        let out = replace_one_tag("11...ADpin", "AD", &|_| "********".to_string());
        assert_eq!(out, "11...AD********");
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let bus = bus();
        let mut rx = bus.subscribe_dashboard();
        bus.log_to_dashboard(LogLevel::Info, "x", &json!({}));
        let line = rx.try_recv().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&line.timestamp).is_ok());
    }
}
