//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use collabeval_core::{
    AnalysisConfig, ChatMessage, CollabError, Database, GroupTranscript, IdentityMappingStore,
    InferenceClient, InferenceRequest, RegisteredUsers, Result,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Route library logs to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Database in a fresh temp directory
///
/// Keep the `TempDir` alive for the duration of the test.
pub async fn create_test_database() -> (TempDir, Database) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open_local(dir.path().join("collabeval_test.db"))
        .await
        .expect("Failed to create test database");
    (dir, db)
}

/// Mapping store backed by `registered_users`, with the given identities registered
pub async fn create_mapping_store(db: &Database, identities: &[&str]) -> Arc<IdentityMappingStore> {
    let users = RegisteredUsers::new(db);
    for identity in identities {
        users
            .register(identity)
            .await
            .expect("Failed to register identity");
    }
    Arc::new(IdentityMappingStore::new(db, Arc::new(users)))
}

/// Analysis config with short timeouts for tests
pub fn test_analysis_config() -> AnalysisConfig {
    AnalysisConfig {
        request_timeout: Duration::from_secs(5),
        ..AnalysisConfig::default()
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
}

/// Transcript with one message per handle
pub fn transcript(group: &str, handles: &[&str]) -> GroupTranscript {
    let mut transcript = GroupTranscript::new(group);
    for (i, handle) in handles.iter().enumerate() {
        transcript.push(
            *handle,
            ChatMessage {
                sent_at: at(1, 9 + i as u32),
                text: format!("{} proposes splitting the report into sections", handle),
            },
        );
    }
    transcript
}

/// Inference client replaying a fixed script of responses
///
/// Each call pops the next entry; `Err` entries become transport failures.
/// Temperatures of every request are recorded.
pub struct ScriptedClient {
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    temperatures: Mutex<Vec<f32>>,
}

impl ScriptedClient {
    pub fn new<I>(script: I) -> Arc<Self>
    where
        I: IntoIterator<Item = std::result::Result<String, String>>,
    {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            temperatures: Mutex::new(Vec::new()),
        })
    }

    pub fn temperatures(&self) -> Vec<f32> {
        self.temperatures.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn invoke(&self, request: &InferenceRequest, _timeout: Duration) -> Result<String> {
        self.temperatures.lock().unwrap().push(request.temperature);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(CollabError::TransportFailure(message)),
            None => Err(CollabError::TransportFailure("script exhausted".to_string())),
        }
    }
}

pub fn valid_response(feedback: &str, participation: u32) -> std::result::Result<String, String> {
    Ok(format!(
        r#"{{"feedback": "{}", "scores": {{"participation": {}, "initiative": 3}}, "mentions": []}}"#,
        feedback, participation
    ))
}
