//! `send-notification`: deliver a message to one user.

use crate::error::{JobError, JobResult};
use crate::schema::{FieldSpec, PayloadSchema};
use crate::task::{ExecutionContext, TaskExecutor, parse_payload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Task identifier
pub const TASK_ID: &str = "send-notification";

/// Delivery channel requested by the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Email,
    Sms,
    Push,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        }
    }
}

/// Where notifications are handed off to.
///
/// Implementations return [`JobError::Transient`] when the provider may
/// accept the message later.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(
        &self,
        kind: NotificationKind,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> JobResult<()>;
}

/// Channel that only logs the notification.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationChannel;

#[async_trait]
impl NotificationChannel for LogNotificationChannel {
    async fn send(
        &self,
        kind: NotificationKind,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> JobResult<()> {
        tracing::info!(
            channel = kind.as_str(),
            recipient,
            subject,
            body_len = body.len(),
            "Notification sent"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    user_id: String,
    #[serde(rename = "type")]
    kind: NotificationKind,
    subject: String,
    body: String,
}

/// Payload schema of `send-notification`.
pub fn schema() -> PayloadSchema {
    PayloadSchema::new()
        .field("userId", FieldSpec::string().min_length(1))
        .field("type", FieldSpec::string().one_of(["email", "sms", "push"]))
        .field("subject", FieldSpec::string())
        .field("body", FieldSpec::string())
}

/// Executor of `send-notification`.
pub struct SendNotification {
    channel: Arc<dyn NotificationChannel>,
}

impl SendNotification {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl TaskExecutor for SendNotification {
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> JobResult<serde_json::Value> {
        let payload: NotificationPayload = parse_payload(&ctx.task_id, payload)?;

        tracing::debug!(
            user_id = %payload.user_id,
            kind = payload.kind.as_str(),
            attempt = ctx.attempt,
            "Sending notification"
        );

        self.channel
            .send(payload.kind, &payload.user_id, &payload.subject, &payload.body)
            .await
            .map_err(|e| match e {
                JobError::Transient { .. } | JobError::Fatal { .. } => e,
                other => JobError::transient_from("Notification delivery failed", other),
            })?;

        Ok(json!({
            "success": true,
            "userId": payload.user_id,
            "type": payload.kind.as_str(),
        }))
    }
}
