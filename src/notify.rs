//! Operational notifications.
//!
//! Delivery is best-effort: a failed send is logged and collection goes on.

use crate::config::NotifySettings;
use crate::error::Result;
use crate::models::Notification;
use async_trait::async_trait;
use chrono::Local;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// A sink for [`Notification`] payloads.
#[async_trait]
pub(crate) trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Sends `notification`, downgrading any failure to a warning.
pub(crate) async fn notify_best_effort<N: Notifier + ?Sized>(notifier: &N, notification: Notification) {
    if let Err(e) = notifier.send(&notification).await {
        tracing::warn!(target: "notify_task", "Notification could not be delivered: {}", e);
    }
}

/// Logs each payload as JSON instead of delivering it.
#[derive(Debug, Default)]
pub(crate) struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_string(notification)?;
        tracing::info!(target: "notify_task", "Notification: {}", payload);
        Ok(())
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Subject line and HTML body for a notification.
pub(crate) fn render(notification: &Notification, sent_at: &str) -> (String, String) {
    match notification {
        Notification::FlowStarted { node_id, query } => (
            format!("{} - Collection started", node_id),
            format!(
                "<p>Hello,</p>\
                 <p>This email is sent from the <b>{}</b> collection flow.</p>\
                 <p><b>Execution Start Time</b>: {}</p>\
                 <p><b>Search query</b>:</p><p><code>{}</code></p>",
                node_id.to_uppercase(),
                sent_at,
                escape_html(query)
            ),
        ),
        Notification::FlowEnded {
            node_id,
            query,
            final_state,
            novel_records,
            batches_written,
        } => (
            format!("{} - Collection ended ({})", node_id, final_state),
            format!(
                "<p>Hello,</p>\
                 <p>The <b>{}</b> collection flow ended at {} in state <b>{}</b>.</p>\
                 <p><b>New records</b>: {}<br><b>Batch files</b>: {}</p>\
                 <p><b>Search query</b>:</p><p><code>{}</code></p>",
                node_id.to_uppercase(),
                sent_at,
                final_state,
                novel_records,
                batches_written,
                escape_html(query)
            ),
        ),
        Notification::SearchWindowSummary {
            node_id,
            since,
            until,
            query,
        } => (
            format!("{} - Query Lag Handling Info", node_id),
            format!(
                "<p>Hello,</p>\
                 <p>This is an automated summary from node <b>{}</b>.</p>\
                 <p><b>Execution Time</b>: {}</p>\
                 <p><b>Search window</b>: since {} until {}. The anchor day falls before \
                 the lag cutoff, so the until date was kept on the anchor day.</p>\
                 <p><b>Search Query Used</b>:</p><p><code>{}</code></p>",
                node_id,
                sent_at,
                since,
                until,
                escape_html(query)
            ),
        ),
        Notification::SearchQueryUpdate {
            node_id,
            stalled_key,
            query,
        } => (
            format!("{} - Search Query Update Notification", node_id),
            format!(
                "<p>Hello,</p>\
                 <p>This email is sent from the <b>{}</b> node.</p>\
                 <p>As of {}, a condition that warrants a change of the search query was encountered.</p>\
                 <p>The unique key <b>{}</b> has been encountered repeatedly.</p>\
                 <p>Here is the updated search query:</p><p><b>{}</b></p>",
                node_id,
                sent_at,
                escape_html(stalled_key),
                escape_html(query)
            ),
        ),
        Notification::RetrySucceeded {
            node_id,
            stalled_key,
        } => (
            format!("{} - Retry succeeded", node_id),
            format!(
                "<p>Hello,</p>\
                 <p>The <b>{}</b> node recovered a stalled feed at {}.</p>\
                 <p><b>Stalled key</b>: {}</p>",
                node_id,
                sent_at,
                escape_html(stalled_key.as_deref().unwrap_or("empty feed"))
            ),
        ),
    }
}

/// Delivers notifications as HTML email through an SMTP relay.
pub(crate) struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    recipients: Vec<Mailbox>,
}

impl SmtpNotifier {
    pub(crate) fn from_settings(settings: &NotifySettings) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)?
            .port(settings.smtp_port);
        if let (Some(username), Some(password)) = (&settings.smtp_username, &settings.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let sender: Mailbox = settings.sender.parse()?;
        let recipients = settings
            .recipients
            .iter()
            .map(|r| r.parse::<Mailbox>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::info!(target: "notify_task",
            "Notifications go to {} recipient(s) via {}:{}",
            recipients.len(), settings.smtp_host, settings.smtp_port);

        Ok(Self {
            transport: builder.build(),
            sender,
            recipients,
        })
    }

    fn message(&self, notification: &Notification) -> Result<Message> {
        let sent_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let (subject, body) = render(notification, &sent_at);
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(subject)
            .header(ContentType::TEXT_HTML);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        Ok(builder.body(body)?)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let message = self.message(notification)?;
        self.transport.send(message).await?;
        tracing::info!(target: "notify_task", "Email sent successfully.");
        Ok(())
    }
}

/// Picks the SMTP sink when delivery is enabled, the log sink otherwise.
/// A misconfigured SMTP sink falls back to logging rather than failing the run.
pub(crate) fn from_settings(settings: &NotifySettings) -> Box<dyn Notifier> {
    if !settings.enabled {
        return Box::new(LogNotifier);
    }
    match SmtpNotifier::from_settings(settings) {
        Ok(notifier) => Box::new(notifier),
        Err(e) => {
            tracing::warn!(target: "notify_task",
                "Email notifications disabled, settings are unusable: {}", e);
            Box::new(LogNotifier)
        }
    }
}
