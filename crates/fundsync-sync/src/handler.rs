//! Queue batch entrypoint with partial-batch acknowledgment.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use fundsync_core::{BatchAcknowledgment, HandlerResponse};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::orchestrator::{panic_message, MessageProcessor};

/// One delivered queue message. Only the id and body are used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(default)]
    pub body: Option<String>,
}

impl QueueMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: Some(body.into()),
        }
    }
}

/// Queue event as delivered to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueMessage>,
}

pub struct QueueBatchHandler {
    processor: Arc<dyn MessageProcessor>,
    max_batch_size: usize,
}

impl QueueBatchHandler {
    pub fn new(processor: Arc<dyn MessageProcessor>, max_batch_size: usize) -> Self {
        Self {
            processor,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Processes messages one at a time, in delivery order. Never fails:
    /// failed or panicking messages are listed for redelivery instead.
    pub async fn handle(&self, messages: &[QueueMessage]) -> BatchAcknowledgment {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("queue_batch", %invocation_id, messages = messages.len());
        async {
            if messages.len() > self.max_batch_size {
                warn!(
                    max_batch_size = self.max_batch_size,
                    "batch is larger than configured; processing all messages"
                );
            }

            let mut ack = BatchAcknowledgment::default();
            for message in messages {
                if self.process_one(message).await {
                    ack.record_success();
                } else {
                    ack.record_failure(message.message_id.clone());
                }
            }

            info!(
                succeeded = ack.success_count,
                failed = ack.failure_count,
                "batch processed"
            );
            ack
        }
        .instrument(span)
        .await
    }

    pub async fn handle_batch(&self, batch: &QueueBatch) -> HandlerResponse {
        self.handle(&batch.records).await.into()
    }

    async fn process_one(&self, message: &QueueMessage) -> bool {
        let span = info_span!("queue_message", message_id = %message.message_id);
        async {
            let body = message.body.as_deref().unwrap_or_default();
            let attempt = AssertUnwindSafe(self.processor.process_queue_message(body))
                .catch_unwind()
                .await;
            match attempt {
                Ok(outcome) if outcome.success => {
                    info!(
                        source = %outcome.source_ref,
                        records = outcome.records_processed,
                        rows_affected = outcome.rows_affected,
                        "message succeeded"
                    );
                    true
                }
                Ok(outcome) => {
                    error!(
                        source = %outcome.source_ref,
                        kind = ?outcome.failure_kind,
                        stage = outcome.failed_stage.map(|s| s.as_str()).unwrap_or("unknown"),
                        error = outcome.error.as_deref().unwrap_or("unknown error"),
                        "message failed; leaving it for redelivery"
                    );
                    false
                }
                Err(panic) => {
                    error!(panic = %panic_message(&*panic), "message processing panicked");
                    false
                }
            }
        }
        .instrument(span)
        .await
    }
}
