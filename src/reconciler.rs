//! Historical reconciliation
//!
//! Reads every persisted record a registered identity can be linked to,
//! across all groups and raw handles it was ever mapped from, and folds
//! them into one [`AggregateSummary`].
//!
//! Stored documents come in more than one shape. [`HistoricalRecordShape`]
//! detects which one a document uses and maps it onto canonical scores and
//! feedback; everything downstream works on that canonical form only.

use crate::error::{CollabError, Result};
use crate::normalizer::merge_scores;
use crate::storage::identity::IdentityMappingStore;
use crate::storage::records::{RecordStore, StoredRecord, FILE_TIMESTAMP_FORMAT};
use crate::types::{
    AggregateSummary, Criterion, GroupSummary, HandleRef, MemberSummary, Scores, TimelineEntry,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keys that may carry the subject handle, in priority order
const HANDLE_KEYS: &[&str] = &["talker", "subject_handle", "original_id"];

/// Storage shape of one historical document
#[derive(Debug, Clone, PartialEq)]
pub enum HistoricalRecordShape {
    /// Scores nested under `scores`, feedback beside them
    LegacyScores {
        scores: Map<String, Value>,
        feedback: Option<String>,
    },
    /// Scores nested under `evaluation`, with `comments` inside it
    Evaluation {
        evaluation: Map<String, Value>,
        feedback: Option<String>,
    },
    /// Feedback only
    Unscored { feedback: Option<String> },
}

impl HistoricalRecordShape {
    /// Detect the shape of an `analysis` object
    pub fn detect(analysis: &Map<String, Value>) -> std::result::Result<Self, String> {
        let feedback = analysis
            .get("feedback")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(scores) = analysis.get("scores") {
            return match scores {
                Value::Object(scores) => Ok(Self::LegacyScores {
                    scores: scores.clone(),
                    feedback,
                }),
                other => Err(format!("'scores' is not an object: {}", other)),
            };
        }

        if let Some(evaluation) = analysis.get("evaluation") {
            return match evaluation {
                Value::Object(evaluation) => Ok(Self::Evaluation {
                    evaluation: evaluation.clone(),
                    feedback,
                }),
                other => Err(format!("'evaluation' is not an object: {}", other)),
            };
        }

        Ok(Self::Unscored { feedback })
    }

    /// Source field -> canonical field renames applied before alias lookup
    pub fn field_mapping(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::LegacyScores { .. } => &[("response_time", "responsiveness")],
            Self::Evaluation { .. } => &[("comments", "feedback"), ("response_time", "responsiveness")],
            Self::Unscored { .. } => &[],
        }
    }

    /// Canonical scores (`None` when the shape carries no score data) and feedback
    pub fn into_canonical(self) -> (Option<Scores>, String) {
        let mapping = self.field_mapping();

        match self {
            Self::LegacyScores { scores, feedback } => {
                let mut container = remap(scores, mapping);
                container.remove("feedback");
                (Some(merge_scores(Some(&container))), feedback.unwrap_or_default())
            }
            Self::Evaluation {
                evaluation,
                feedback,
            } => {
                let mut container = remap(evaluation, mapping);
                let inner = match container.remove("feedback") {
                    Some(Value::String(s)) => Some(s),
                    _ => None,
                };
                (
                    Some(merge_scores(Some(&container))),
                    inner.or(feedback).unwrap_or_default(),
                )
            }
            Self::Unscored { feedback } => (None, feedback.unwrap_or_default()),
        }
    }
}

fn remap(container: Map<String, Value>, mapping: &[(&str, &str)]) -> Map<String, Value> {
    container
        .into_iter()
        .map(|(key, value)| {
            let key = mapping
                .iter()
                .find(|(from, _)| *from == key)
                .map(|(_, to)| to.to_string())
                .unwrap_or(key);
            (key, value)
        })
        .collect()
}

/// One stored document in canonical form
#[derive(Debug, Clone, PartialEq)]
struct HistoricalRecord {
    handle: String,
    group: Option<String>,
    timestamp: DateTime<Utc>,
    scores: Option<Scores>,
    feedback: String,
}

impl HistoricalRecord {
    /// Records with no score and no feedback carry no information
    fn is_informative(&self) -> bool {
        let total = self.scores.as_ref().map(Scores::total).unwrap_or(0.0);
        total > 0.0 || !self.feedback.trim().is_empty()
    }
}

/// A canonical record attributed to one group
#[derive(Debug, Clone)]
struct Attributed {
    group: String,
    record: HistoricalRecord,
}

/// Parse one stored document; `Ok(None)` for records carrying an error marker
fn parse_stored(stored: &StoredRecord) -> Result<Option<HistoricalRecord>> {
    let corrupt = |reason: String| CollabError::RecordCorrupt {
        source_ref: stored.source_ref.clone(),
        reason,
    };

    let document: Value = serde_json::from_str(&stored.document)
        .map_err(|e| corrupt(format!("invalid JSON: {}", e)))?;
    let Value::Object(root) = document else {
        return Err(corrupt("document is not an object".to_string()));
    };

    let analysis = match root.get("analysis") {
        Some(Value::Object(analysis)) => analysis,
        Some(_) => return Err(corrupt("'analysis' is not an object".to_string())),
        None => &root,
    };

    if analysis.get("error").is_some_and(|e| !e.is_null()) {
        return Ok(None);
    }

    let handle = HANDLE_KEYS
        .iter()
        .find_map(|key| root.get(*key).and_then(Value::as_str))
        .ok_or_else(|| corrupt("missing subject handle".to_string()))?
        .to_string();

    let timestamp = root
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .or_else(|| timestamp_from_source(&stored.source_ref))
        .ok_or_else(|| corrupt("missing timestamp".to_string()))?;

    let group = root
        .get("group")
        .and_then(Value::as_str)
        .filter(|g| !g.is_empty())
        .map(str::to_string);

    let (scores, feedback) = HistoricalRecordShape::detect(analysis)
        .map_err(corrupt)?
        .into_canonical();

    Ok(Some(HistoricalRecord {
        handle,
        group,
        timestamp,
        scores,
        feedback,
    }))
}

/// RFC 3339, or naive ISO-8601 read as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Timestamp embedded in a `<handle>_<YYYYmmdd_HHMMSS>` file name
fn timestamp_from_source(source_ref: &str) -> Option<DateTime<Utc>> {
    let stem = Path::new(source_ref).file_stem()?.to_str()?;
    let parts: Vec<&str> = stem.split('_').collect();

    parts.windows(2).rev().find_map(|pair| {
        let candidate = format!("{}_{}", pair[0], pair[1]);
        NaiveDateTime::parse_from_str(&candidate, FILE_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// Per-criterion sums over records with score data, divided by their count
fn average_scores<'a, I>(records: I) -> BTreeMap<Criterion, f64>
where
    I: IntoIterator<Item = &'a HistoricalRecord>,
{
    let mut sums: BTreeMap<Criterion, f64> = Criterion::ALL.iter().map(|c| (*c, 0.0)).collect();
    let mut scored = 0usize;

    for scores in records.into_iter().filter_map(|r| r.scores.as_ref()) {
        scored += 1;
        for (criterion, value) in scores.iter() {
            *sums.entry(criterion).or_insert(0.0) += value;
        }
    }

    if scored > 0 {
        for value in sums.values_mut() {
            *value /= scored as f64;
        }
    }
    sums
}

/// Builds aggregate summaries from every configured record store
pub struct HistoricalReconciler {
    mappings: Arc<IdentityMappingStore>,
    stores: Vec<Arc<dyn RecordStore>>,
}

impl HistoricalReconciler {
    pub fn new(mappings: Arc<IdentityMappingStore>, stores: Vec<Arc<dyn RecordStore>>) -> Self {
        Self { mappings, stores }
    }

    /// Aggregate history of one registered identity
    pub async fn summarize(&self, identity: &str) -> Result<AggregateSummary> {
        let refs = self.mappings.lookup_all_for_identity(identity).await?;
        if refs.is_empty() {
            return Err(CollabError::NoRecordsFound(format!("identity {}", identity)));
        }

        let mut records = self.collect(&refs).await?;
        if records.is_empty() {
            return Err(CollabError::NoRecordsFound(format!("identity {}", identity)));
        }
        records.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));

        let average_scores = average_scores(records.iter().map(|a| &a.record));
        let feedback_history = records.iter().map(|a| a.record.feedback.clone()).collect();
        let timeline = records
            .iter()
            .map(|a| TimelineEntry {
                date: a.record.timestamp.date_naive(),
                timestamp: a.record.timestamp,
                scores: a.record.scores.clone().unwrap_or_default(),
                group: a.group.clone(),
                original_handle: a.record.handle.clone(),
            })
            .collect();

        info!(
            "Summarized {} records across {} handles for {}",
            records.len(),
            refs.len(),
            identity
        );

        Ok(AggregateSummary {
            identity: identity.to_string(),
            groups: refs.iter().map(|r| r.group.clone()).collect(),
            total_reports: records.len(),
            average_scores,
            timeline,
            feedback_history,
        })
    }

    /// Per-member averages for one group, from records written in that group
    pub async fn summarize_group(&self, group: &str) -> Result<GroupSummary> {
        let identities: BTreeSet<String> = self
            .mappings
            .list_group(group)
            .await?
            .into_iter()
            .map(|m| m.registered_identity)
            .collect();

        let mut members = Vec::new();
        let mut unreported = Vec::new();

        for identity in identities {
            let refs = self.mappings.lookup_all_for_identity(&identity).await?;
            let in_group: Vec<HistoricalRecord> = self
                .collect(&refs)
                .await?
                .into_iter()
                .filter(|a| a.group == group)
                .map(|a| a.record)
                .collect();

            if in_group.is_empty() {
                unreported.push(identity);
                continue;
            }

            members.push(MemberSummary {
                identity,
                report_count: in_group.len(),
                average_scores: average_scores(&in_group),
            });
        }

        if members.is_empty() {
            return Err(CollabError::NoRecordsFound(format!("group {}", group)));
        }

        Ok(GroupSummary {
            group: group.to_string(),
            members,
            unreported,
        })
    }

    /// Load, parse, scope and filter every record reachable from `refs`
    async fn collect(&self, refs: &BTreeSet<HandleRef>) -> Result<Vec<Attributed>> {
        let handles: Vec<String> = refs
            .iter()
            .map(|r| r.original_handle.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut attributed = Vec::new();

        for store in &self.stores {
            for stored in store.load_all_for_handles(&handles).await? {
                let record = match parse_stored(&stored) {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        warn!("Skipping failed analysis record {}", stored.source_ref);
                        continue;
                    }
                    Err(e) => {
                        warn!("Skipping record: {}", e);
                        continue;
                    }
                };

                let group = match &record.group {
                    Some(group) => {
                        let key = HandleRef {
                            group: group.clone(),
                            original_handle: record.handle.clone(),
                        };
                        if !refs.contains(&key) {
                            debug!(
                                "Record {} belongs to unmapped {}/{}",
                                stored.source_ref, group, record.handle
                            );
                            continue;
                        }
                        group.clone()
                    }
                    None => match refs.iter().find(|r| r.original_handle == record.handle) {
                        Some(r) => r.group.clone(),
                        None => continue,
                    },
                };

                if !record.is_informative() {
                    debug!("Dropping empty record {}", stored.source_ref);
                    continue;
                }

                attributed.push(Attributed { group, record });
            }
        }

        Ok(attributed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(source_ref: &str, document: Value) -> StoredRecord {
        StoredRecord {
            source_ref: source_ref.to_string(),
            document: document.to_string(),
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_detect_shapes() {
        let legacy = object(json!({"scores": {"participation": 4}}));
        assert!(matches!(
            HistoricalRecordShape::detect(&legacy).unwrap(),
            HistoricalRecordShape::LegacyScores { .. }
        ));

        let evaluation = object(json!({"evaluation": {"participation": 2, "comments": "ok"}}));
        assert!(matches!(
            HistoricalRecordShape::detect(&evaluation).unwrap(),
            HistoricalRecordShape::Evaluation { .. }
        ));

        let unscored = object(json!({"feedback": "just words"}));
        assert_eq!(
            HistoricalRecordShape::detect(&unscored).unwrap(),
            HistoricalRecordShape::Unscored {
                feedback: Some("just words".to_string())
            }
        );

        assert!(HistoricalRecordShape::detect(&object(json!({"scores": [1, 2]}))).is_err());
    }

    #[test]
    fn test_evaluation_comments_become_feedback() {
        let shape = HistoricalRecordShape::detect(&object(json!({
            "evaluation": {"participation": "2", "response_time": 3, "comments": "ok"}
        })))
        .unwrap();

        let (scores, feedback) = shape.into_canonical();
        let scores = scores.unwrap();
        assert_eq!(feedback, "ok");
        assert_eq!(scores.get(Criterion::Participation), 2.0);
        assert_eq!(scores.get(Criterion::Responsiveness), 3.0);
        assert!(scores.covers_schema());
    }

    #[test]
    fn test_legacy_non_numeric_scores_default_to_zero() {
        let shape = HistoricalRecordShape::detect(&object(json!({
            "scores": {"participation": "n/a", "initiative": 9},
            "feedback": "fine"
        })))
        .unwrap();

        let (scores, feedback) = shape.into_canonical();
        let scores = scores.unwrap();
        assert_eq!(feedback, "fine");
        assert_eq!(scores.get(Criterion::Participation), 0.0);
        assert_eq!(scores.get(Criterion::Initiative), 5.0);
    }

    #[test]
    fn test_parse_stored_reads_root_when_analysis_missing() {
        let record = parse_stored(&stored(
            "legacy.json",
            json!({
                "original_id": "wx_1",
                "timestamp": "2024-11-02T08:30:00",
                "evaluation": {"coordination": 4, "comments": "ok"}
            }),
        ))
        .unwrap()
        .unwrap();

        assert_eq!(record.handle, "wx_1");
        assert_eq!(record.group, None);
        assert_eq!(record.feedback, "ok");
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 11, 2, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_stored_skips_error_marker() {
        let result = parse_stored(&stored(
            "analysis_records:1",
            json!({
                "talker": "wx_1",
                "timestamp": "2025-01-01T00:00:00Z",
                "analysis": {"scores": {}, "feedback": "", "error": {"kind": "parse_failure", "message": "x"}}
            }),
        ))
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_parse_stored_corrupt_documents() {
        let err = parse_stored(&stored("bad.json", json!("text"))).unwrap_err();
        assert!(matches!(err, CollabError::RecordCorrupt { .. }));

        let truncated = StoredRecord {
            source_ref: "half.json".to_string(),
            document: "{\"talker\": \"wx_1\", ".to_string(),
        };
        assert!(parse_stored(&truncated).is_err());

        let no_timestamp = parse_stored(&stored(
            "analysis_records:2",
            json!({"talker": "wx_1", "analysis": {"feedback": "f"}}),
        ))
        .unwrap_err();
        assert!(no_timestamp.to_string().contains("missing timestamp"));
    }

    #[test]
    fn test_timestamp_falls_back_to_file_name() {
        let record = parse_stored(&stored(
            "/data/records/wx_1_20240315_142500.json",
            json!({"talker": "wx_1", "analysis": {"feedback": "f"}}),
        ))
        .unwrap()
        .unwrap();

        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 3, 15, 14, 25, 0).unwrap());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2025-02-01T10:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-02-01T09:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-02-01 09:00:00.000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_informative_filter() {
        let mut record = HistoricalRecord {
            handle: "wx_1".to_string(),
            group: None,
            timestamp: Utc::now(),
            scores: Some(Scores::zeroed()),
            feedback: String::new(),
        };
        assert!(!record.is_informative());

        record.scores.as_mut().unwrap().set(Criterion::Initiative, 0.5);
        assert!(record.is_informative());

        record.scores = None;
        record.feedback = "quiet but present".to_string();
        assert!(record.is_informative());
    }

    #[test]
    fn test_average_ignores_unscored_records() {
        let mut scored = Scores::zeroed();
        scored.set(Criterion::Participation, 4.0);

        let records = vec![
            HistoricalRecord {
                handle: "a".to_string(),
                group: None,
                timestamp: Utc::now(),
                scores: Some(scored),
                feedback: String::new(),
            },
            HistoricalRecord {
                handle: "a".to_string(),
                group: None,
                timestamp: Utc::now(),
                scores: None,
                feedback: "words".to_string(),
            },
        ];

        let averages = average_scores(&records);
        assert_eq!(averages[&Criterion::Participation], 4.0);
        assert_eq!(averages.len(), Criterion::ALL.len());
    }
}
