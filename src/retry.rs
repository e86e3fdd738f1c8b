//! Retry controller for model analysis
//!
//! Each participant's transcript goes through a bounded sequence of
//! inference attempts:
//!
//! ```text
//! Pending -> Requested -> { Valid | Invalid | Errored } -> Requested (retry) | Terminal
//! ```
//!
//! Each retry raises the sampling temperature by a fixed step up to a cap, so
//! a response stuck at low temperature gets a chance to diverge. Transport
//! failures and content failures both consume an attempt; they differ only in
//! the error marker left on the returned record. A client error outside
//! [`CollabError::is_retryable`] ends the run at once.
//!
//! `analyze` never returns an error: the caller always gets an
//! [`AnalysisRecord`] and must check its `error` field.

use crate::config::AnalysisConfig;
use crate::error::{CollabError, Result};
use crate::inference::{InferenceClient, InferenceRequest, PromptMessage, Role};
use crate::normalizer::{excerpt, ResponseNormalizer};
use crate::types::{
    AnalysisFailure, AnalysisRecord, ChatMessage, Criterion, FailureKind, ScoreRecord, Scores,
};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Result of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Parsed and accepted by the validity predicate
    Valid(ScoreRecord),
    /// Parsed or unparseable content that must be retried
    Invalid {
        record: Option<ScoreRecord>,
        failure: AnalysisFailure,
    },
    /// The inference call itself failed
    Errored {
        failure: AnalysisFailure,
        retryable: bool,
    },
}

impl AttemptOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, AttemptOutcome::Valid(_))
    }
}

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    Valid,
    Exhausted,
    /// The client reported an error that another attempt cannot fix
    Fatal,
}

/// Transition taken after an attempt completes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Retry { attempt: u32, temperature: f32 },
    Terminal(TerminalReason),
}

/// Whether a normalized response is usable
///
/// At least one criterion must be strictly positive and the feedback must be
/// non-blank. A single nonzero criterion is enough.
pub fn is_valid_analysis(record: &ScoreRecord) -> bool {
    record.scores.any_positive() && !record.feedback.trim().is_empty()
}

/// [`is_valid_analysis`] as a typed result
pub fn check_validity(record: &ScoreRecord) -> Result<()> {
    if !record.scores.any_positive() {
        return Err(CollabError::InvalidContent("All scores zero".to_string()));
    }
    if record.feedback.trim().is_empty() {
        return Err(CollabError::InvalidContent("Feedback empty".to_string()));
    }
    Ok(())
}

/// Drives repeated inference attempts for one participant at a time
pub struct RetryController {
    client: Arc<dyn InferenceClient>,
    config: AnalysisConfig,
    normalizer: ResponseNormalizer,
    system_prompt: String,
}

impl RetryController {
    pub fn new(client: Arc<dyn InferenceClient>, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;

        let normalizer =
            ResponseNormalizer::new(config.schema_version.clone(), config.feedback_placeholder.clone());
        let system_prompt = build_system_prompt(&config.schema_version);

        Ok(Self {
            client,
            config,
            normalizer,
            system_prompt,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Sampling temperature for a zero-based attempt index
    pub fn temperature_for_attempt(&self, attempt_index: u32) -> f32 {
        let raised = self.config.base_temperature + attempt_index as f32 * self.config.temperature_step;
        raised.min(self.config.temperature_cap)
    }

    /// Classify the raw result of one inference call
    pub fn classify(&self, response: Result<String>) -> AttemptOutcome {
        let raw = match response {
            Ok(raw) => raw,
            Err(e) => {
                return AttemptOutcome::Errored {
                    retryable: e.is_retryable(),
                    failure: AnalysisFailure {
                        kind: FailureKind::TransportFailure,
                        message: e.to_string(),
                        raw_excerpt: None,
                    },
                }
            }
        };

        match self.normalizer.normalize(&raw) {
            Ok(record) => match check_validity(&record) {
                Ok(()) => AttemptOutcome::Valid(record),
                Err(e) => AttemptOutcome::Invalid {
                    record: Some(record),
                    failure: AnalysisFailure {
                        kind: FailureKind::InvalidContent,
                        message: e.to_string(),
                        raw_excerpt: Some(excerpt(&raw)),
                    },
                },
            },
            Err(CollabError::ParseFailure { excerpt }) => AttemptOutcome::Invalid {
                record: None,
                failure: AnalysisFailure {
                    kind: FailureKind::ParseFailure,
                    message: "No valid JSON found in response".to_string(),
                    raw_excerpt: Some(excerpt),
                },
            },
            Err(e) => AttemptOutcome::Invalid {
                record: None,
                failure: AnalysisFailure {
                    kind: FailureKind::ParseFailure,
                    message: e.to_string(),
                    raw_excerpt: Some(excerpt(&raw)),
                },
            },
        }
    }

    /// Decide what follows a completed attempt (`attempt` is 1-based)
    pub fn transition(&self, attempt: u32, outcome: &AttemptOutcome) -> Transition {
        if outcome.is_valid() {
            Transition::Terminal(TerminalReason::Valid)
        } else if matches!(outcome, AttemptOutcome::Errored { retryable: false, .. }) {
            Transition::Terminal(TerminalReason::Fatal)
        } else if attempt >= self.config.max_attempts {
            Transition::Terminal(TerminalReason::Exhausted)
        } else {
            Transition::Retry {
                attempt: attempt + 1,
                temperature: self.temperature_for_attempt(attempt),
            }
        }
    }

    /// Analyze one participant's messages
    pub async fn analyze(
        &self,
        subject_handle: &str,
        group: &str,
        messages: &[ChatMessage],
    ) -> AnalysisRecord {
        let span = info_span!("analyze", handle = subject_handle, group = group);
        self.run(subject_handle, group, messages).instrument(span).await
    }

    async fn run(&self, subject_handle: &str, group: &str, messages: &[ChatMessage]) -> AnalysisRecord {
        let prompt = vec![
            PromptMessage {
                role: Role::System,
                content: self.system_prompt.clone(),
            },
            PromptMessage {
                role: Role::User,
                content: render_transcript(messages),
            },
        ];

        let mut next = Some((1, self.temperature_for_attempt(0)));
        let mut last: Option<(u32, f32, AttemptOutcome)> = None;
        let mut reason = TerminalReason::Exhausted;

        while let Some((attempt, temperature)) = next {
            debug!(attempt, temperature, "Requesting analysis");

            let request = InferenceRequest {
                model: self.config.model.clone(),
                messages: prompt.clone(),
                temperature,
            };

            let timeout = self.config.request_timeout;
            let response = match tokio::time::timeout(timeout, self.client.invoke(&request, timeout)).await {
                Ok(response) => response,
                Err(_) => Err(CollabError::TransportFailure(format!(
                    "Inference call timed out after {}s",
                    timeout.as_secs_f32()
                ))),
            };

            if let Some(dir) = self.config.interaction_log_dir.as_deref() {
                write_interaction_log(dir, subject_handle, attempt, &request, &response).await;
            }

            let outcome = self.classify(response);
            if let AttemptOutcome::Invalid { failure, .. } | AttemptOutcome::Errored { failure, .. } = &outcome {
                warn!(
                    attempt,
                    kind = %failure.kind,
                    "Attempt {} returned an unusable result: {}",
                    attempt,
                    failure.message
                );
            }

            next = match self.transition(attempt, &outcome) {
                Transition::Retry { attempt, temperature } => Some((attempt, temperature)),
                Transition::Terminal(terminal) => {
                    reason = terminal;
                    None
                }
            };
            last = Some((attempt, temperature, outcome));
        }

        match last {
            Some((attempt, temperature, outcome)) => {
                match reason {
                    TerminalReason::Valid => info!(attempt, temperature, "Analysis accepted"),
                    TerminalReason::Exhausted => warn!(attempts = attempt, "Analysis attempts exhausted"),
                    TerminalReason::Fatal => warn!(attempts = attempt, "Analysis aborted on non-retryable error"),
                }
                self.build_record(subject_handle, group, attempt, temperature, outcome)
            }
            None => self.build_record(
                subject_handle,
                group,
                0,
                self.temperature_for_attempt(0),
                AttemptOutcome::Errored {
                    failure: AnalysisFailure {
                        kind: FailureKind::TransportFailure,
                        message: "No inference attempt was performed".to_string(),
                        raw_excerpt: None,
                    },
                    retryable: false,
                },
            ),
        }
    }

    fn build_record(
        &self,
        subject_handle: &str,
        group: &str,
        attempts: u32,
        temperature: f32,
        outcome: AttemptOutcome,
    ) -> AnalysisRecord {
        let (record, error) = match outcome {
            AttemptOutcome::Valid(record) => (Some(record), None),
            AttemptOutcome::Invalid { record, failure } => (record, Some(failure)),
            AttemptOutcome::Errored { failure, .. } => (None, Some(failure)),
        };

        let (scores, feedback, mentions) = match record {
            Some(r) => (r.scores, r.feedback, r.mentions),
            None => (Scores::zeroed(), String::new(), Vec::new()),
        };

        AnalysisRecord {
            id: Uuid::new_v4(),
            subject_handle: subject_handle.to_string(),
            group: group.to_string(),
            timestamp: Utc::now(),
            scores,
            feedback,
            mentions,
            schema_version: self.config.schema_version.clone(),
            registered_identity: None,
            attempts,
            temperature,
            error,
        }
    }
}

/// System prompt listing the criteria and the exact JSON template
pub fn build_system_prompt(schema_version: &str) -> String {
    let criteria: serde_json::Map<String, serde_json::Value> = Criterion::ALL
        .iter()
        .map(|c| (c.as_str().to_string(), serde_json::Value::from(c.label())))
        .collect();
    let criteria_json = serde_json::to_string_pretty(&criteria).unwrap_or_default();

    let score_lines: Vec<String> = Criterion::ALL
        .iter()
        .map(|c| format!("        \"{}\": 0-5", c.as_str()))
        .collect();

    format!(
        r#"As a team collaboration analyst, evaluate the chat history based on the following dimensions:

1. Detailed feedback with improvement suggestions
2. Skill scores (0-5) in these dimensions:
{criteria_json}

Scoring rules:
1. Analyze message content, not quantity
2. Focus on constructive contributions
3. Pay attention to coordinating organizational behavior
4. Evaluate the effectiveness of problem solving

Return valid JSON format:
{{
    "feedback": "detail analysis...",
    "scores": {{
{scores}
    }},
    "mentions": ["userA", "userB"],
    "version": "{schema_version}"
}}
Rules:
1. Output only JSON. No markdown, explanations, or extra text.
2. Use numeric scores (0-5) only.
3. Do not include any comments or additional formatting.
"#,
        scores = score_lines.join(",\n"),
    )
}

/// Render messages as numbered lines for the user prompt
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            format!(
                "Message {}, time: {}, content: \"{}\"",
                i + 1,
                m.sent_at.to_rfc3339(),
                m.text.replace(['\n', '\r'], " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Serialize)]
struct InteractionLogEntry<'a> {
    timestamp: String,
    subject: &'a str,
    model: &'a str,
    attempt: u32,
    temperature: f32,
    request: &'a InferenceRequest,
    response: Option<&'a str>,
    error: Option<String>,
}

/// Persist one attempt for offline diagnosis; failures are only logged
async fn write_interaction_log(
    dir: &Path,
    subject: &str,
    attempt: u32,
    request: &InferenceRequest,
    response: &Result<String>,
) {
    let now = Utc::now();
    let entry = InteractionLogEntry {
        timestamp: now.to_rfc3339(),
        subject,
        model: &request.model,
        attempt,
        temperature: request.temperature,
        request,
        response: response.as_ref().ok().map(String::as_str),
        error: response.as_ref().err().map(|e| e.to_string()),
    };

    let path: PathBuf = dir.join(format!(
        "{}_{}_{}.json",
        sanitize_file_stem(subject),
        now.format("%Y%m%d_%H%M%S"),
        attempt
    ));

    let written: Result<()> = async {
        fs::create_dir_all(dir).await?;
        let json = serde_json::to_string_pretty(&entry)?;
        fs::write(&path, json).await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        warn!("Failed to write interaction log {}: {}", path.display(), e);
    }
}

/// Replace characters that are unsafe in file names
pub(crate) fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect()
}
