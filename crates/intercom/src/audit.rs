//! Audit and alert sinks.
//!
//! Every routed message is reported as an [`AuditRecord`]; escalation
//! lifecycle events and the no-operator condition as [`AlertNotice`]s.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use intercom_protocol::{CloseReason, Destination, Role};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::escalation::EscalationKey;
use crate::message::{Message, ParticipantId};

/// One routed message, as seen by the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub message_id: Uuid,
    pub sender: ParticipantId,
    pub sender_role: Role,
    pub destination: Destination,
    pub body: String,
    pub alerted: bool,
}

impl From<&Message> for AuditRecord {
    fn from(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp(),
            message_id: message.id(),
            sender: message.sender().clone(),
            sender_role: message.sender_role(),
            destination: message.destination().clone(),
            body: message.body().to_string(),
            alerted: message.alerted(),
        }
    }
}

/// Operationally relevant escalation events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertNotice {
    EscalationOpened {
        channel_id: Uuid,
        key: EscalationKey,
        raised_by: ParticipantId,
        operator: Option<ParticipantId>,
        at: DateTime<Utc>,
    },
    EscalationClosed {
        channel_id: Uuid,
        key: EscalationKey,
        reason: CloseReason,
        at: DateTime<Utc>,
    },
    /// An alert fired and no operator could be reached.
    NoOperatorAvailable {
        channel_id: Uuid,
        key: EscalationKey,
        raised_by: ParticipantId,
        message_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// Receiver of audit records and alert notices.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
    fn alert(&self, notice: &AlertNotice);
}

/// Writes audit records to the `intercom::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "intercom::audit",
            message_id = %record.message_id,
            sender = %record.sender,
            sender_role = %record.sender_role,
            destination = %record.destination,
            alerted = record.alerted,
            body = %record.body,
            "message routed"
        );
    }

    fn alert(&self, notice: &AlertNotice) {
        match notice {
            AlertNotice::EscalationOpened {
                channel_id,
                key,
                raised_by,
                operator,
                ..
            } => {
                warn!(
                    target: "intercom::audit",
                    channel_id = %channel_id,
                    key = %key,
                    raised_by = %raised_by,
                    operator = ?operator.as_ref().map(ParticipantId::as_str),
                    "escalation opened"
                );
            }
            AlertNotice::EscalationClosed {
                channel_id,
                key,
                reason,
                ..
            } => {
                info!(
                    target: "intercom::audit",
                    channel_id = %channel_id,
                    key = %key,
                    reason = ?reason,
                    "escalation closed"
                );
            }
            AlertNotice::NoOperatorAvailable {
                channel_id,
                key,
                raised_by,
                message_id,
                ..
            } => {
                error!(
                    target: "intercom::audit",
                    safety_alert = true,
                    channel_id = %channel_id,
                    key = %key,
                    raised_by = %raised_by,
                    message_id = %message_id,
                    "NO OPERATOR AVAILABLE for escalated message"
                );
            }
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AuditLine<'a> {
    Message(&'a AuditRecord),
    Alert(&'a AlertNotice),
}

enum WriterCommand {
    Line(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

/// Appends one JSON object per line to a file.
///
/// `record` and `alert` only serialize and enqueue; a background task owns
/// the file and does the writing, so routing never waits on disk.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl JsonlAuditSink {
    /// Open (or create) the log and start its writer task. Must be called
    /// from within a tokio runtime.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(file, path.clone(), rx));
        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every line queued so far has reached the file.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn enqueue(&self, line: &AuditLine<'_>) {
        let mut buf = match serde_json::to_vec(line) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("Failed to serialize audit line: {}", e);
                return;
            }
        };
        buf.push(b'\n');

        if self.tx.send(WriterCommand::Line(buf)).is_err() {
            error!(path = %self.path.display(), "Audit writer stopped, line dropped");
        }
    }
}

async fn run_writer(mut file: File, path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Line(buf) => {
                if let Err(e) = file.write_all(&buf).await {
                    error!(path = %path.display(), "Failed to write audit line: {}", e);
                }
            }
            WriterCommand::Flush(ack) => {
                if let Err(e) = file.flush().await {
                    error!(path = %path.display(), "Failed to flush audit log: {}", e);
                }
                let _ = ack.send(());
            }
        }
    }

    if let Err(e) = file.flush().await {
        error!(path = %path.display(), "Failed to flush audit log: {}", e);
    }
    debug!(path = %path.display(), "Audit writer stopped");
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.enqueue(&AuditLine::Message(record));
    }

    fn alert(&self, notice: &AlertNotice) {
        self.enqueue(&AuditLine::Alert(notice));
    }
}

/// Forwards to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }

    fn alert(&self, notice: &AlertNotice) {
        for sink in &self.sinks {
            sink.alert(notice);
        }
    }
}
