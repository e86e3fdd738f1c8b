//! Batch analysis of one group transcript
//!
//! Participants are analyzed one at a time, in handle order. Cancellation is
//! checked between participants and also races the in-flight analysis; an
//! abandoned analysis persists nothing.

use crate::retry::RetryController;
use crate::storage::identity::IdentityMappingStore;
use crate::storage::records::RecordStore;
use crate::types::{AnalysisRecord, GroupTranscript};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Outcome of one batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Records persisted without an error marker
    pub analyzed: usize,
    /// Records persisted with an error marker, or that failed to persist
    pub failed: usize,
    /// Whether the run stopped early
    pub cancelled: bool,
    /// Every record produced, in processing order
    pub records: Vec<AnalysisRecord>,
}

pub struct BatchAnalyzer {
    controller: Arc<RetryController>,
    store: Arc<dyn RecordStore>,
    mappings: Option<Arc<IdentityMappingStore>>,
}

impl BatchAnalyzer {
    pub fn new(controller: Arc<RetryController>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            controller,
            store,
            mappings: None,
        }
    }

    /// Stamp records with the registered identity their handle maps to
    pub fn with_mappings(mut self, mappings: Arc<IdentityMappingStore>) -> Self {
        self.mappings = Some(mappings);
        self
    }

    /// Analyze and persist every participant of a transcript
    pub async fn run(&self, transcript: &GroupTranscript, cancel: &CancellationToken) -> BatchReport {
        let span = info_span!("batch", group = %transcript.group);
        self.run_inner(transcript, cancel).instrument(span).await
    }

    async fn run_inner(&self, transcript: &GroupTranscript, cancel: &CancellationToken) -> BatchReport {
        let mut report = BatchReport::default();
        let total = transcript.participants.len();

        for (index, (handle, messages)) in transcript.participants.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            info!("Analyzing participant {}/{}: {}", index + 1, total, handle);

            let mut record = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Batch cancelled during analysis of {}", handle);
                    report.cancelled = true;
                    break;
                }
                record = self.controller.analyze(handle, &transcript.group, messages) => record,
            };

            record.registered_identity = self.resolve_identity(&transcript.group, handle).await;

            if let Err(e) = self.store.append(&record).await {
                warn!("Failed to persist analysis record for {}: {}", handle, e);
                report.failed += 1;
                continue;
            }

            if record.is_error() {
                report.failed += 1;
            } else {
                report.analyzed += 1;
            }
            report.records.push(record);
        }

        info!(
            analyzed = report.analyzed,
            failed = report.failed,
            cancelled = report.cancelled,
            "Batch finished"
        );
        report
    }

    async fn resolve_identity(&self, group: &str, handle: &str) -> Option<String> {
        let mappings = self.mappings.as_ref()?;
        match mappings.lookup(group, handle).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Identity lookup failed for {}/{}: {}", group, handle, e);
                None
            }
        }
    }
}
