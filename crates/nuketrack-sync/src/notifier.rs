//! Cycle digest and its delivery through the configured channel.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use nuketrack_core::{DataChange, RunLog, RunStatus};
use nuketrack_storage::Store;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::{EmailSettings, NotifyChannel};

/// One aggregated message per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub subject: String,
    pub body: String,
}

impl Digest {
    pub fn build(runs: &[RunLog], changes: &[DataChange]) -> Self {
        let succeeded = runs.iter().filter(|r| r.status == RunStatus::Success).count();
        let failed = runs.iter().filter(|r| r.status == RunStatus::Failure).count();
        let subject = format!(
            "Nuclear DB: {succeeded}/{} sources succeeded, {} change(s)",
            runs.len(),
            changes.len()
        );

        let mut body = format!(
            "Ingestion cycle: {succeeded} succeeded, {failed} failed, {} change(s) detected.\n",
            changes.len()
        );

        if failed > 0 {
            body.push_str("\nFailed sources:\n");
            for run in runs.iter().filter(|r| r.status == RunStatus::Failure) {
                let message = run.error_message.as_deref().unwrap_or("no error message");
                let _ = writeln!(body, "- {} (run #{}): {message}", run.script_name, run.id);
            }
        }

        let mut by_entity: BTreeMap<&str, Vec<&DataChange>> = BTreeMap::new();
        for change in changes {
            by_entity.entry(change.entity_type.as_str()).or_default().push(change);
        }
        for (entity_type, group) in by_entity {
            let _ = writeln!(body, "\n{entity_type} ({}):", group.len());
            for change in group {
                let _ = writeln!(
                    body,
                    "- {} #{}: {} changed from '{}' to '{}'",
                    change.entity_type,
                    change.entity_id,
                    change.field_name,
                    change.old_value.as_deref().unwrap_or("(none)"),
                    change.new_value
                );
            }
        }

        Self { subject, body }
    }
}

/// `send(text) -> success | failure` for one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn send(&self, digest: &Digest) -> Result<()>;
}

/// Writes the digest to the log. Never fails.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn send(&self, digest: &Digest) -> Result<()> {
        info!(subject = %digest.subject, "NOTIFICATION\n{}", digest.body);
        Ok(())
    }
}

/// SMTP delivery with STARTTLS.
pub struct EmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailTransport {
    pub fn new(settings: &EmailSettings) -> Result<Self> {
        let from = settings
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid sender address {}", settings.from))?;
        let to = settings
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid recipient address {addr}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .with_context(|| format!("configuring SMTP relay {}", settings.host))?
            .port(settings.port);
        if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }
}

#[async_trait]
impl Transport for EmailTransport {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, digest: &Digest) -> Result<()> {
        let mut message = Message::builder()
            .from(self.from.clone())
            .subject(digest.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            message = message.to(to.clone());
        }
        let message = message
            .body(digest.body.clone())
            .context("building digest email")?;
        self.mailer.send(message).await.context("sending digest email")?;
        info!(subject = %digest.subject, recipients = self.to.len(), "email sent");
        Ok(())
    }
}

/// Slack-compatible incoming-webhook POST.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn payload(digest: &Digest) -> serde_json::Value {
        json!({ "text": format!("*{}*\n```{}```", digest.subject, digest.body) })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, digest: &Digest) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&Self::payload(digest))
            .send()
            .await
            .context("posting digest to webhook")?
            .error_for_status()
            .context("webhook rejected digest")?;
        info!(subject = %digest.subject, "webhook notification sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyResult {
    pub delivered: bool,
    pub channel: &'static str,
    pub changes_included: usize,
    pub error: Option<String>,
}

pub struct Notifier {
    transport: Box<dyn Transport>,
}

impl Notifier {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn from_channel(channel: &NotifyChannel) -> Result<Self> {
        let transport: Box<dyn Transport> = match channel {
            NotifyChannel::Log => Box::new(LogTransport),
            NotifyChannel::Email(settings) => Box::new(EmailTransport::new(settings)?),
            NotifyChannel::Webhook { url } => Box::new(WebhookTransport::new(url)?),
        };
        Ok(Self::new(transport))
    }

    pub fn channel(&self) -> &'static str {
        self.transport.channel()
    }

    /// Sends one digest. On success every included change is marked notified;
    /// on failure they stay pending for the next cycle. Never returns an error.
    pub async fn notify(&self, store: &Store, runs: &[RunLog], changes: &[DataChange]) -> NotifyResult {
        let digest = Digest::build(runs, changes);
        let channel = self.transport.channel();

        if let Err(err) = self.transport.send(&digest).await {
            let message = format!("{err:#}");
            error!(channel, error = %message, pending = changes.len(), "digest delivery failed");
            return NotifyResult {
                delivered: false,
                channel,
                changes_included: changes.len(),
                error: Some(message),
            };
        }

        let ids = changes.iter().map(|c| c.id).collect::<Vec<_>>();
        let error = match store.mark_notified(&ids).await {
            Ok(flipped) => {
                info!(channel, flipped, "digest delivered");
                None
            }
            Err(err) => {
                error!(channel, error = %err, "digest delivered but changes could not be marked notified");
                Some(format!("marking changes notified: {err}"))
            }
        };
        NotifyResult {
            delivered: true,
            channel,
            changes_included: changes.len(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use chrono::Utc;
    use nuketrack_core::FieldChange;

    fn run(id: i64, name: &str, status: RunStatus, error: Option<&str>) -> RunLog {
        RunLog {
            id,
            script_name: name.into(),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_skipped: 0,
            error_message: error.map(str::to_string),
        }
    }

    fn change(id: i64, entity_type: &str, field: &str, old: Option<&str>, new: &str) -> DataChange {
        DataChange {
            id,
            run_log_id: Some(1),
            entity_type: entity_type.into(),
            entity_id: 7,
            field_name: field.into(),
            old_value: old.map(str::to_string),
            new_value: new.into(),
            detected_at: Utc::now(),
            notified: false,
        }
    }

    #[test]
    fn digest_summarizes_runs_and_groups_changes() {
        let runs = vec![
            run(1, "nrc-reactors", RunStatus::Success, None),
            run(2, "usaspending-contracts", RunStatus::Failure, Some("http status 503")),
        ];
        let changes = vec![
            change(10, "site", "owner", None, "Entergy"),
            change(11, "reactor", "status", Some("operating"), "extended-outage"),
        ];
        let digest = Digest::build(&runs, &changes);

        assert_eq!(digest.subject, "Nuclear DB: 1/2 sources succeeded, 2 change(s)");
        assert!(digest.body.contains("1 succeeded, 1 failed"));
        assert!(digest
            .body
            .contains("- usaspending-contracts (run #2): http status 503"));
        assert!(digest
            .body
            .contains("- reactor #7: status changed from 'operating' to 'extended-outage'"));
        assert!(digest.body.contains("- site #7: owner changed from '(none)' to 'Entergy'"));
        // grouped in entity-type order
        let reactor_at = digest.body.find("reactor (1):").unwrap();
        let site_at = digest.body.find("site (1):").unwrap();
        assert!(reactor_at < site_at);
    }

    #[test]
    fn quiet_cycle_still_has_a_digest() {
        let digest = Digest::build(&[run(1, "nrc-events", RunStatus::Success, None)], &[]);
        assert_eq!(digest.subject, "Nuclear DB: 1/1 sources succeeded, 0 change(s)");
        assert!(!digest.body.contains("Failed sources"));
    }

    #[test]
    fn webhook_payload_is_slack_formatted() {
        let digest = Digest {
            subject: "S".into(),
            body: "B".into(),
        };
        assert_eq!(WebhookTransport::payload(&digest), json!({"text": "*S*\n```B```"}));
    }

    #[test]
    fn email_transport_rejects_bad_addresses() {
        let settings = EmailSettings {
            host: "smtp.example.org".into(),
            port: 587,
            username: None,
            password: None,
            from: "not an address".into(),
            to: vec!["ops@example.org".into()],
        };
        assert!(EmailTransport::new(&settings).is_err());
    }

    #[tokio::test]
    async fn delivered_digest_marks_changes_notified() {
        let store = Store::connect_in_memory().await.unwrap();
        let recorded = store
            .record_changes(
                None,
                "reactor",
                1,
                &[FieldChange {
                    field: "status".into(),
                    old: Some("operating".into()),
                    new: "extended-outage".into(),
                }],
            )
            .await
            .unwrap();

        let transport = RecordingTransport::default();
        let notifier = Notifier::new(Box::new(transport.clone()));
        let result = notifier.notify(&store, &[], &recorded).await;

        assert!(result.delivered);
        assert_eq!(result.changes_included, 1);
        assert_eq!(result.error, None);
        assert_eq!(transport.calls(), 1);
        assert!(store.pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_keeps_changes_pending() {
        let store = Store::connect_in_memory().await.unwrap();
        let recorded = store
            .record_changes(
                None,
                "site",
                1,
                &[FieldChange {
                    field: "owner".into(),
                    old: None,
                    new: "Entergy".into(),
                }],
            )
            .await
            .unwrap();

        let transport = RecordingTransport::failing();
        let notifier = Notifier::new(Box::new(transport.clone()));
        let result = notifier.notify(&store, &[], &recorded).await;

        assert!(!result.delivered);
        assert!(result.error.unwrap().contains("smtp unavailable"));
        assert_eq!(transport.calls(), 1);
        assert_eq!(store.pending_changes().await.unwrap(), recorded);
    }
}
