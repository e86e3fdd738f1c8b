//! Core data types for collaboration scoring
//!
//! This module defines the Score Schema (the fixed set of collaboration
//! criteria), the analysis records produced by the retry controller, the
//! identity mappings that bind raw chat handles to registered users, and the
//! derived summaries built by the historical reconciler.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Lowest value a criterion score can take
pub const SCORE_MIN: f64 = 0.0;

/// Highest value a criterion score can take
pub const SCORE_MAX: f64 = 5.0;

/// One collaboration criterion of the Score Schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Participation,
    Initiative,
    ProblemSolving,
    Coordination,
    Responsiveness,
}

impl Criterion {
    /// All criteria in schema order
    pub const ALL: [Criterion; 5] = [
        Criterion::Participation,
        Criterion::Initiative,
        Criterion::ProblemSolving,
        Criterion::Coordination,
        Criterion::Responsiveness,
    ];

    /// Canonical key used in stored and generated JSON
    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::Participation => "participation",
            Criterion::Initiative => "initiative",
            Criterion::ProblemSolving => "problem_solving",
            Criterion::Coordination => "coordination",
            Criterion::Responsiveness => "responsiveness",
        }
    }

    /// Human-readable description shown to the model and in reports
    pub fn label(&self) -> &'static str {
        match self {
            Criterion::Participation => "Discussion participation frequency",
            Criterion::Initiative => "Unsolicited contribution proposal",
            Criterion::ProblemSolving => "Problem solving ability",
            Criterion::Coordination => "Team coordination ability",
            Criterion::Responsiveness => "Response timeliness",
        }
    }

    /// Resolve a field name as written by a model or an older record
    ///
    /// Matching ignores case and treats `-` and spaces like `_`. Vendor
    /// spellings that drifted across model versions are folded onto the
    /// canonical criterion.
    pub fn from_field(name: &str) -> Option<Self> {
        let key = fold_field_name(name);

        match key.as_str() {
            "participation" | "engagement" => Some(Criterion::Participation),
            "initiative" | "proactiveness" | "proactivity" => Some(Criterion::Initiative),
            "problem_solving" | "problemsolving" | "problem_solving_ability" => {
                Some(Criterion::ProblemSolving)
            }
            "coordination" | "teamwork" | "team_coordination" => Some(Criterion::Coordination),
            "responsiveness" | "response_time" | "response_timeliness" | "timeliness" => {
                Some(Criterion::Responsiveness)
            }
            _ => None,
        }
    }

    /// Resolve only the canonical spelling (case, `-` and spaces still folded)
    pub fn from_canonical(name: &str) -> Option<Self> {
        let key = fold_field_name(name);
        Criterion::ALL.into_iter().find(|c| c.as_str() == key)
    }
}

fn fold_field_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-criterion scores, always covering the full Score Schema
///
/// Construction goes through [`Scores::zeroed`] or [`Scores::set`], both of
/// which keep every value inside `[SCORE_MIN, SCORE_MAX]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scores(BTreeMap<Criterion, f64>);

impl Scores {
    /// All criteria present, each at zero
    pub fn zeroed() -> Self {
        Self(Criterion::ALL.iter().map(|c| (*c, SCORE_MIN)).collect())
    }

    /// Set a criterion, clamping into the schema range
    ///
    /// NaN is stored as zero.
    pub fn set(&mut self, criterion: Criterion, value: f64) {
        let value = if value.is_nan() {
            SCORE_MIN
        } else {
            value.clamp(SCORE_MIN, SCORE_MAX)
        };
        self.0.insert(criterion, value);
    }

    pub fn get(&self, criterion: Criterion) -> f64 {
        self.0.get(&criterion).copied().unwrap_or(SCORE_MIN)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// True when at least one criterion is strictly positive
    pub fn any_positive(&self) -> bool {
        self.0.values().any(|v| *v > SCORE_MIN)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Criterion, f64)> + '_ {
        self.0.iter().map(|(c, v)| (*c, *v))
    }

    /// Whether the key set equals the Score Schema exactly
    pub fn covers_schema(&self) -> bool {
        self.0.len() == Criterion::ALL.len() && Criterion::ALL.iter().all(|c| self.0.contains_key(c))
    }
}

impl Default for Scores {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Normalized model response for one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub scores: Scores,
    pub feedback: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    pub version: String,
}

/// Why an analysis ended without a valid result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No parseable payload in the model response
    ParseFailure,
    /// Parsed, but rejected by the validity predicate
    InvalidContent,
    /// The inference call itself failed or timed out
    TransportFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ParseFailure => write!(f, "parse_failure"),
            FailureKind::InvalidContent => write!(f, "invalid_content"),
            FailureKind::TransportFailure => write!(f, "transport_failure"),
        }
    }
}

/// Error marker attached to an analysis record that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_excerpt: Option<String>,
}

/// One scored evaluation of one participant's messages
///
/// Immutable once produced. Callers must check [`AnalysisRecord::error`]
/// before trusting the scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub subject_handle: String,
    pub group: String,
    pub timestamp: DateTime<Utc>,
    pub scores: Scores,
    pub feedback: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    pub schema_version: String,
    /// Registered identity the handle resolved to when the record was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_identity: Option<String>,
    /// Number of inference attempts performed (1-based)
    pub attempts: u32,
    /// Sampling temperature of the attempt whose result this is
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisFailure>,
}

impl AnalysisRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Binds a raw chat handle to a registered identity within one group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub group: String,
    pub original_handle: String,
    pub registered_identity: String,
}

/// A (group, raw handle) pair a registered identity has been mapped from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub group: String,
    pub original_handle: String,
}

/// One data point of a user's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub scores: Scores,
    pub group: String,
    pub original_handle: String,
}

/// Aggregated history for one registered identity
///
/// Built fresh by each reconciler call and owned by its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub identity: String,
    pub groups: BTreeSet<String>,
    pub total_reports: usize,
    pub average_scores: BTreeMap<Criterion, f64>,
    /// Newest first
    pub timeline: Vec<TimelineEntry>,
    /// Feedback texts aligned with `timeline`
    pub feedback_history: Vec<String>,
}

/// Group-level roll-up of member summaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: String,
    pub members: Vec<MemberSummary>,
    /// Identities mapped into the group with no usable records
    pub unreported: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub identity: String,
    pub report_count: usize,
    pub average_scores: BTreeMap<Criterion, f64>,
}

/// One chat message as supplied by the transcript source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sent_at: DateTime<Utc>,
    pub text: String,
}

/// Cleaned transcript of one group, keyed by raw handle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupTranscript {
    pub group: String,
    pub participants: BTreeMap<String, Vec<ChatMessage>>,
}

impl GroupTranscript {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            participants: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, handle: impl Into<String>, message: ChatMessage) {
        self.participants.entry(handle.into()).or_default().push(message);
    }
}

/// Derive the group name from a chat export file name
///
/// Exports are named `<group>_<anything>.<ext>`; the prefix before the first
/// underscore is the group. Falls back to `default_group`.
pub fn group_from_export_name(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let file_name = normalized.rsplit('/').next().unwrap_or_default();
    match file_name.split('_').next() {
        Some(prefix) if !prefix.is_empty() && prefix != file_name => prefix.to_string(),
        _ => "default_group".to_string(),
    }
}
