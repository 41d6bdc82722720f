//! Diagnostic report reconciliation.
//!
//! A user has one live [`DiagnosticReport`] holding the current value of
//! every known test plus the superseded values inside each test's history.
//! [`merge`] folds a newly extracted report into the stored one: new data
//! wins as "current", old data is archived, and tests absent from the new
//! report are carried forward untouched. The merge is pure; per-user
//! serialization of the surrounding read-modify-write belongs to the
//! caller (see `ReportService`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural validation failure of an incoming extracted report. The
/// stored report is never modified when this is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportValidationError {
    #[error("extracted report must be a JSON object")]
    NotAnObject,

    #[error("extracted report is missing the required `results` array")]
    MissingResults,

    #[error("`results` must be an array")]
    ResultsNotArray,

    #[error("result {index}: {reason}")]
    InvalidResult { index: usize, reason: String },
}

/// A superseded test value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub date: DateTime<Utc>,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Current state of one test plus everything it has superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(rename = "testName")]
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// The live longitudinal report document. Only the most recent version is
/// stored; history lives inside each test result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub user_id: String,
    pub results: Vec<TestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinical_findings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_impressions: Option<String>,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

/// One test tuple from the extraction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedResult {
    #[serde(rename = "testName")]
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<String>,
}

/// Validated output of the (out-of-scope) extraction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedReport {
    pub results: Vec<ExtractedResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinical_findings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_impressions: Option<String>,
}

impl ExtractedReport {
    /// Validate a loosely-typed extraction payload at the boundary.
    ///
    /// Requires a JSON object with a `results` array whose entries each
    /// carry a non-empty `testName` and `value`. Narrative fields
    /// (`clinicalFindings`, `diagnosticImpressions`) are optional.
    ///
    /// # Errors
    /// Returns [`ReportValidationError`] describing the first structural
    /// problem found.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ReportValidationError> {
        let object = value
            .as_object()
            .ok_or(ReportValidationError::NotAnObject)?;

        let results_value = object
            .get("results")
            .or_else(|| object.get("result"))
            .ok_or(ReportValidationError::MissingResults)?;
        let raw_results = results_value
            .as_array()
            .ok_or(ReportValidationError::ResultsNotArray)?;

        let mut results = Vec::with_capacity(raw_results.len());
        for (index, raw) in raw_results.iter().enumerate() {
            let entry = raw
                .as_object()
                .ok_or_else(|| ReportValidationError::InvalidResult {
                    index,
                    reason: "must be an object".to_string(),
                })?;

            let name = non_empty_string(entry.get("testName").or_else(|| entry.get("name")))
                .ok_or_else(|| ReportValidationError::InvalidResult {
                    index,
                    reason: "missing or empty `testName`".to_string(),
                })?;
            let value = non_empty_string(entry.get("value")).ok_or_else(|| {
                ReportValidationError::InvalidResult {
                    index,
                    reason: "missing or empty `value`".to_string(),
                }
            })?;

            results.push(ExtractedResult {
                name,
                value,
                unit: optional_string(entry.get("unit")),
                reference_range: optional_string(entry.get("referenceRange")),
                status: optional_string(entry.get("status")),
                interpretation: optional_string(entry.get("interpretation")),
            });
        }

        Ok(Self {
            results,
            clinical_findings: optional_string(object.get("clinicalFindings")),
            diagnostic_impressions: optional_string(object.get("diagnosticImpressions")),
        })
    }
}

fn non_empty_string(value: Option<&serde_json::Value>) -> Option<String> {
    value
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn optional_string(value: Option<&serde_json::Value>) -> Option<String> {
    value
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Result of a merge plus which test names changed, for observability.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub report: DiagnosticReport,
    pub tests_updated: Vec<String>,
    pub tests_added: Vec<String>,
    /// Whether `clinicalFindings`/`diagnosticImpressions` were replaced.
    pub narrative_changed: bool,
}

impl MergeOutcome {
    /// Whether the merge produced a new report version.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.tests_updated.is_empty() || !self.tests_added.is_empty() || self.narrative_changed
    }
}

/// Reconcile an incoming extracted report against the stored one.
///
/// Rules:
/// - no existing report: the incoming data becomes version 1 with empty
///   histories;
/// - a test present in both with a changed value/status: the existing
///   value is pushed onto the test's history (stamped with the existing
///   report's `last_updated`), and the incoming tuple becomes current;
/// - a test present in both with an unchanged value and status is left
///   alone — no history entry, no version bump on its account — which
///   makes re-merging the same document a no-op;
/// - tests only in the existing report are carried forward; tests only in
///   the incoming one are added with empty history;
/// - narrative fields are replaced when the incoming report provides a
///   different value, and count as a change.
///
/// When nothing changed at all, the existing report is returned untouched
/// (same version, same `last_updated`).
#[must_use]
pub fn merge(
    existing: Option<&DiagnosticReport>,
    incoming: &ExtractedReport,
    user_id: &str,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let Some(existing) = existing else {
        let results: Vec<TestResult> = incoming.results.iter().map(fresh_result).collect();
        let tests_added = results.iter().map(|r| r.name.clone()).collect();
        return MergeOutcome {
            report: DiagnosticReport {
                user_id: user_id.to_string(),
                results,
                clinical_findings: incoming.clinical_findings.clone(),
                diagnostic_impressions: incoming.diagnostic_impressions.clone(),
                version: 1,
                last_updated: now,
            },
            tests_updated: Vec::new(),
            tests_added,
            narrative_changed: false,
        };
    };

    let mut results = existing.results.clone();
    let mut index: HashMap<String, usize> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.clone(), i))
        .collect();

    let mut tests_updated = Vec::new();
    let mut tests_added = Vec::new();

    for incoming_result in &incoming.results {
        match index.get(&incoming_result.name) {
            Some(&i) => {
                let current = &mut results[i];
                if current.value == incoming_result.value
                    && current.status == incoming_result.status
                {
                    // Unchanged: skip the history push so re-merging the
                    // same document cannot grow history.
                    continue;
                }

                let archived = HistoryEntry {
                    date: existing.last_updated,
                    value: current.value.clone(),
                    status: current.status.clone(),
                };
                current.history.push(archived);
                current.value = incoming_result.value.clone();
                current.status = incoming_result.status.clone();
                current.unit = incoming_result.unit.clone();
                current.reference_range = incoming_result.reference_range.clone();
                current.interpretation = incoming_result.interpretation.clone();
                tests_updated.push(incoming_result.name.clone());
            }
            None => {
                index.insert(incoming_result.name.clone(), results.len());
                results.push(fresh_result(incoming_result));
                tests_added.push(incoming_result.name.clone());
            }
        }
    }

    let clinical_findings = pick_narrative(&existing.clinical_findings, &incoming.clinical_findings);
    let diagnostic_impressions = pick_narrative(
        &existing.diagnostic_impressions,
        &incoming.diagnostic_impressions,
    );
    let narrative_changed = clinical_findings != existing.clinical_findings
        || diagnostic_impressions != existing.diagnostic_impressions;

    if tests_updated.is_empty() && tests_added.is_empty() && !narrative_changed {
        return MergeOutcome {
            report: existing.clone(),
            tests_updated,
            tests_added,
            narrative_changed: false,
        };
    }

    MergeOutcome {
        report: DiagnosticReport {
            user_id: existing.user_id.clone(),
            results,
            clinical_findings,
            diagnostic_impressions,
            version: existing.version + 1,
            last_updated: now,
        },
        tests_updated,
        tests_added,
        narrative_changed,
    }
}

fn fresh_result(extracted: &ExtractedResult) -> TestResult {
    TestResult {
        name: extracted.name.clone(),
        value: extracted.value.clone(),
        unit: extracted.unit.clone(),
        reference_range: extracted.reference_range.clone(),
        status: extracted.status.clone(),
        interpretation: extracted.interpretation.clone(),
        history: Vec::new(),
    }
}

fn pick_narrative(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    match incoming {
        Some(text) if !text.is_empty() => Some(text.clone()),
        _ => existing.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn extracted(pairs: &[(&str, &str)]) -> ExtractedReport {
        ExtractedReport {
            results: pairs
                .iter()
                .map(|(name, value)| ExtractedResult {
                    name: (*name).to_string(),
                    value: (*value).to_string(),
                    unit: None,
                    reference_range: None,
                    status: Some("normal".to_string()),
                    interpretation: None,
                })
                .collect(),
            clinical_findings: None,
            diagnostic_impressions: None,
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_first_report_is_version_one() {
        let outcome = merge(None, &extracted(&[("RBC", "4.5")]), "user-1", at(2025, 12, 1));

        assert_eq!(outcome.report.version, 1);
        assert_eq!(outcome.report.results.len(), 1);
        assert!(outcome.report.results[0].history.is_empty());
        assert_eq!(outcome.tests_added, vec!["RBC"]);
        assert!(outcome.tests_updated.is_empty());
    }

    #[test]
    fn test_history_preserved_on_update() {
        // Existing {RBC: 4.5 on 2025-12-01} at version 1; incoming
        // {RBC: 4.8, Platelets: 250}.
        let first = merge(None, &extracted(&[("RBC", "4.5")]), "user-1", at(2025, 12, 1)).report;
        let outcome = merge(
            Some(&first),
            &extracted(&[("RBC", "4.8"), ("Platelets", "250")]),
            "user-1",
            at(2025, 12, 26),
        );

        let merged = &outcome.report;
        assert_eq!(merged.version, 2);

        let rbc = merged
            .results
            .iter()
            .find(|r| r.name == "RBC")
            .expect("RBC carried");
        assert_eq!(rbc.value, "4.8");
        assert_eq!(rbc.history.len(), 1);
        assert_eq!(rbc.history[0].value, "4.5");
        assert_eq!(rbc.history[0].date, at(2025, 12, 1));

        let platelets = merged
            .results
            .iter()
            .find(|r| r.name == "Platelets")
            .expect("Platelets added");
        assert_eq!(platelets.value, "250");
        assert!(platelets.history.is_empty());

        assert_eq!(outcome.tests_updated, vec!["RBC"]);
        assert_eq!(outcome.tests_added, vec!["Platelets"]);
    }

    #[test]
    fn test_merge_is_additive_union() {
        let first = merge(
            None,
            &extracted(&[("RBC", "4.5"), ("WBC", "7.1")]),
            "user-1",
            at(2025, 12, 1),
        )
        .report;
        let merged = merge(
            Some(&first),
            &extracted(&[("WBC", "7.4"), ("Platelets", "250")]),
            "user-1",
            at(2025, 12, 26),
        )
        .report;

        let mut names: Vec<&str> = merged.results.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Platelets", "RBC", "WBC"]);

        // RBC was absent from the incoming report: carried forward untouched.
        let rbc = merged.results.iter().find(|r| r.name == "RBC").expect("RBC");
        assert_eq!(rbc.value, "4.5");
        assert!(rbc.history.is_empty());
    }

    #[test]
    fn test_remerging_same_document_is_a_noop() {
        let incoming = extracted(&[("RBC", "4.8"), ("Platelets", "250")]);
        let first = merge(None, &extracted(&[("RBC", "4.5")]), "user-1", at(2025, 12, 1)).report;
        let once = merge(Some(&first), &incoming, "user-1", at(2025, 12, 26));
        let twice = merge(Some(&once.report), &incoming, "user-1", at(2025, 12, 27));

        assert!(!twice.changed());
        assert_eq!(twice.report, once.report);
        assert_eq!(twice.report.version, 2);
        let rbc = twice
            .report
            .results
            .iter()
            .find(|r| r.name == "RBC")
            .expect("RBC");
        assert_eq!(rbc.history.len(), 1);
    }

    #[test]
    fn test_status_change_alone_archives_old_value() {
        let first = merge(None, &extracted(&[("HbA1c", "6.1")]), "user-1", at(2026, 1, 5)).report;

        let mut incoming = extracted(&[("HbA1c", "6.1")]);
        incoming.results[0].status = Some("abnormal".to_string());
        let outcome = merge(Some(&first), &incoming, "user-1", at(2026, 2, 5));

        assert_eq!(outcome.report.version, 2);
        let test = &outcome.report.results[0];
        assert_eq!(test.status.as_deref(), Some("abnormal"));
        assert_eq!(test.history.len(), 1);
        assert_eq!(test.history[0].status.as_deref(), Some("normal"));
    }

    #[test]
    fn test_narrative_replacement_bumps_version() {
        let mut incoming = extracted(&[("RBC", "4.5")]);
        incoming.clinical_findings = Some("Unremarkable".to_string());
        let first = merge(None, &incoming, "user-1", at(2025, 12, 1)).report;

        incoming.clinical_findings = Some("Mild anemia".to_string());
        let outcome = merge(Some(&first), &incoming, "user-1", at(2025, 12, 26));

        assert_eq!(outcome.report.version, 2);
        assert_eq!(
            outcome.report.clinical_findings.as_deref(),
            Some("Mild anemia")
        );
        // No test changed; only the narrative did, which still counts.
        assert!(outcome.tests_updated.is_empty());
        assert!(outcome.narrative_changed);
        assert!(outcome.changed());
    }

    #[test]
    fn test_from_json_accepts_well_formed_payload() {
        let payload = serde_json::json!({
            "results": [
                {
                    "testName": "RBC Count",
                    "value": "4.8",
                    "unit": "million/mcL",
                    "referenceRange": "4.5-5.5",
                    "status": "normal",
                    "interpretation": "Within range"
                }
            ],
            "clinicalFindings": "Unremarkable",
            "diagnosticImpressions": "Healthy"
        });

        let report = ExtractedReport::from_json(&payload).expect("valid payload");
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].name, "RBC Count");
        assert_eq!(report.results[0].unit.as_deref(), Some("million/mcL"));
        assert_eq!(report.clinical_findings.as_deref(), Some("Unremarkable"));
    }

    #[test]
    fn test_from_json_rejects_malformed_payloads() {
        assert_eq!(
            ExtractedReport::from_json(&serde_json::json!("not an object")),
            Err(ReportValidationError::NotAnObject)
        );
        assert_eq!(
            ExtractedReport::from_json(&serde_json::json!({"clinicalFindings": "x"})),
            Err(ReportValidationError::MissingResults)
        );
        assert_eq!(
            ExtractedReport::from_json(&serde_json::json!({"results": "nope"})),
            Err(ReportValidationError::ResultsNotArray)
        );
        assert!(matches!(
            ExtractedReport::from_json(&serde_json::json!({
                "results": [{"testName": "", "value": "1"}]
            })),
            Err(ReportValidationError::InvalidResult { index: 0, .. })
        ));
        assert!(matches!(
            ExtractedReport::from_json(&serde_json::json!({
                "results": [{"testName": "RBC"}]
            })),
            Err(ReportValidationError::InvalidResult { index: 0, .. })
        ));
    }

    #[test]
    fn test_from_json_accepts_empty_results() {
        let report = ExtractedReport::from_json(&serde_json::json!({"results": []}))
            .expect("empty results are a no-op, not an error");
        assert!(report.results.is_empty());
    }
}
