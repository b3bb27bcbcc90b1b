use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use fundsync_core::{distinct_tickers, FailureKind, ObjectLocation, ProcessingStage, SyncOutcome};
use fundsync_parser::FundDataParser;
use fundsync_storage::{sha256_hex, ObjectStore};
use futures::FutureExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::collaborators::{FundDataRepository, TickerRegistrar};
use crate::notification::{parse_notification, NotificationError};

/// Anything that turns one queue message body into an outcome.
///
/// Implementations must not panic or fail past this boundary; every
/// problem is reported through the returned outcome.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process_queue_message(&self, body: &str) -> SyncOutcome;
}

/// Moves one staged export from object storage into the fund-data store.
///
/// Collaborators are injected so one pool-backed registrar and repository
/// can be shared across every invocation of a long-lived process.
pub struct SyncOrchestrator {
    store: Arc<dyn ObjectStore>,
    parser: FundDataParser,
    registrar: Arc<dyn TickerRegistrar>,
    repository: Arc<dyn FundDataRepository>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        parser: FundDataParser,
        registrar: Arc<dyn TickerRegistrar>,
        repository: Arc<dyn FundDataRepository>,
    ) -> Self {
        Self {
            store,
            parser,
            registrar,
            repository,
        }
    }

    pub async fn process_file(&self, location: &ObjectLocation) -> SyncOutcome {
        let source_ref = location.to_string();
        let span = info_span!("process_file", source = %source_ref);
        self.run_stages(location, source_ref).instrument(span).await
    }

    async fn run_stages(&self, location: &ObjectLocation, source_ref: String) -> SyncOutcome {
        match location.raw_path() {
            Some(path) => debug!(
                source_system = %path.source_system,
                dataset = %path.dataset,
                as_of = %path.as_of,
                file = %path.file_name,
                "staged export"
            ),
            None => warn!("object key is outside the raw/<source>/<dataset>/<date>/<file>.csv layout"),
        }

        enter(ProcessingStage::Received);
        let bytes = match self.store.get_object(location).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return fail(
                    SyncOutcome::failed(source_ref, ProcessingStage::Received, err.failure_kind(), err.to_string()),
                );
            }
        };
        let content_sha256 = sha256_hex(&bytes);

        enter(ProcessingStage::Parsing);
        let parsed = self.parser.parse(&bytes, &source_ref);
        drop(bytes);
        let records = match parsed {
            Ok(records) => records,
            Err(err) => {
                return fail(
                    SyncOutcome::failed(source_ref, ProcessingStage::Parsing, FailureKind::Parse, err.to_string())
                        .with_content_sha256(content_sha256),
                );
            }
        };

        enter(ProcessingStage::Registering);
        let tickers_registered = self.register_tickers(&distinct_tickers(&records)).await;

        enter(ProcessingStage::Upserting);
        let rows_affected = match self.repository.batch_upsert(&records).await {
            Ok(rows) => rows,
            Err(err) => {
                return fail(
                    SyncOutcome::failed(source_ref, ProcessingStage::Upserting, FailureKind::Write, err.to_string())
                        .with_content_sha256(content_sha256),
                );
            }
        };

        enter(ProcessingStage::Succeeded);
        info!(
            records = records.len(),
            rows_affected,
            tickers_registered,
            sha256 = %content_sha256,
            "file synced"
        );
        SyncOutcome::succeeded(source_ref, records.len(), rows_affected, tickers_registered)
            .with_content_sha256(content_sha256)
    }

    /// Best effort: registrar errors and panics are logged and count as
    /// zero registrations.
    async fn register_tickers(&self, symbols: &BTreeSet<String>) -> usize {
        if symbols.is_empty() {
            return 0;
        }
        let attempt = AssertUnwindSafe(self.registrar.ensure_registered(symbols))
            .catch_unwind()
            .await;
        match attempt {
            Ok(Ok(ids)) => {
                let resolved = symbols
                    .iter()
                    .filter(|symbol| matches!(ids.get(*symbol), Some(Some(_))))
                    .count();
                if resolved < symbols.len() {
                    warn!(
                        requested = symbols.len(),
                        resolved,
                        "some tickers have no id in the ticker master"
                    );
                }
                resolved
            }
            Ok(Err(err)) => {
                warn!(error = %err, requested = symbols.len(), "ticker registration failed; continuing");
                0
            }
            Err(panic) => {
                warn!(
                    panic = %panic_message(&*panic),
                    requested = symbols.len(),
                    "ticker registrar panicked; continuing"
                );
                0
            }
        }
    }

    pub async fn process_queue_message(&self, body: &str) -> SyncOutcome {
        match AssertUnwindSafe(self.process_notification(body)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(panic = %message, "message processing panicked");
                SyncOutcome::failed(
                    String::new(),
                    ProcessingStage::Received,
                    FailureKind::Internal,
                    format!("internal error while processing message: {message}"),
                )
            }
        }
    }

    async fn process_notification(&self, body: &str) -> SyncOutcome {
        let locations = match parse_notification(body) {
            Ok(locations) => locations,
            Err(err) => return invalid_message(err),
        };
        if locations.len() > 1 {
            debug!(files = locations.len(), "notification announces several objects");
        }

        let mut outcomes = Vec::with_capacity(locations.len());
        for location in &locations {
            outcomes.push(self.process_file(location).await);
        }
        SyncOutcome::merge(outcomes).unwrap_or_else(|| invalid_message(NotificationError::MissingLocation))
    }
}

#[async_trait]
impl MessageProcessor for SyncOrchestrator {
    async fn process_queue_message(&self, body: &str) -> SyncOutcome {
        SyncOrchestrator::process_queue_message(self, body).await
    }
}

fn enter(stage: ProcessingStage) {
    debug!(stage = stage.as_str(), "stage");
}

fn fail(outcome: SyncOutcome) -> SyncOutcome {
    enter(ProcessingStage::Failed);
    outcome
}

fn invalid_message(err: NotificationError) -> SyncOutcome {
    warn!(error = %err, "queue message carries no usable storage location");
    SyncOutcome::failed(
        String::new(),
        ProcessingStage::Received,
        FailureKind::InvalidMessage,
        err.to_string(),
    )
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
