//! Collabeval - Collaboration Scoring Core
//!
//! Scores each participant of a group chat on five collaboration criteria,
//! using an external language model as the evaluator, and reconciles the
//! resulting history per registered user:
//! - Normalization of free-form model output into schema-complete scores
//! - Bounded retries with temperature escalation
//! - Group-scoped identity mapping with referential integrity
//! - Reconciliation of records written under older storage shapes
//!
//! # Architecture
//!
//! - **Types**: Score schema, records, summaries
//! - **Normalizer / Retry**: Model output to a validated record
//! - **Inference**: The model call seam and an OpenAI-compatible HTTP client
//! - **Storage**: libsql-backed mappings, users and records; legacy JSON files
//! - **Reconciler**: Per-identity and per-group aggregation
//!
//! # Example
//!
//! ```ignore
//! use collabeval_core::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = CollabConfig::load(Some("collabeval.toml".as_ref()))?;
//! let db = Database::open_local(&config.storage.database_path).await?;
//!
//! let client = Arc::new(ChatCompletionsClient::new(config.inference.clone())?);
//! let controller = Arc::new(RetryController::new(client, config.analysis.clone())?);
//! let mappings = Arc::new(IdentityMappingStore::new(&db, Arc::new(RegisteredUsers::new(&db))));
//! let records: Arc<dyn RecordStore> = Arc::new(LibsqlRecordStore::new(&db));
//!
//! let report = BatchAnalyzer::new(controller, records)
//!     .with_mappings(mappings.clone())
//!     .run(&transcript, &CancellationToken::new())
//!     .await;
//!
//! let stores = configured_stores(&db, &config.storage);
//! let summary = HistoricalReconciler::new(mappings, stores)
//!     .summarize("alice")
//!     .await?;
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod inference;
pub mod normalizer;
pub mod reconciler;
pub mod retry;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use batch::{BatchAnalyzer, BatchReport};
pub use config::{AnalysisConfig, CollabConfig, InferenceConfig, StorageConfig};
pub use error::{CollabError, Result};
pub use inference::{ChatCompletionsClient, InferenceClient, InferenceRequest, PromptMessage, Role};
pub use normalizer::ResponseNormalizer;
pub use reconciler::{HistoricalReconciler, HistoricalRecordShape};
pub use retry::{AttemptOutcome, RetryController, TerminalReason, Transition};
pub use storage::identity::{
    IdentityMappingStore, IdentitySource, ImportReport, RegisteredUsers, StaticIdentities,
};
pub use storage::records::{
    configured_stores, JsonDirRecordStore, LibsqlRecordStore, RecordStore, StoredRecord,
};
pub use storage::{ConnectionMode, Database};
pub use types::{
    AggregateSummary, AnalysisFailure, AnalysisRecord, ChatMessage, Criterion, FailureKind,
    GroupSummary, GroupTranscript, HandleRef, IdentityMapping, MemberSummary, ScoreRecord, Scores,
    TimelineEntry,
};
