//! Retrieval-augmented security review.
//!
//! Each review unit (a file, or a window of a long file) is sent to the
//! analysis endpoint together with related code from other files of the same
//! project. The reply is parsed leniently into [`Finding`]s whose line numbers
//! are checked against the unit and, when missing or out of range, recovered
//! from the reported snippet. An optional second pass asks the model to
//! confirm or reject each finding.
pub mod finding;
pub mod locate;
pub mod parse;
pub mod prompt;

pub use finding::{Confidence, ConfidenceLevel, Finding, Severity};
pub use parse::{ParseFailure, RawFinding};

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::context::{ContextAssembler, Focal};
use crate::indexer::Chunker;
use crate::indexer::ScannedFile;
use crate::llm::{CompletionService, Prompt};
use crate::resilience::{Orchestrator, ServiceError};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error("unrecognised validation verdict: {0}")]
    Verdict(String),
}

/// A contiguous piece of one file submitted in a single analysis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewUnit {
    pub path: String,
    pub language: String,
    /// 1-based file line of the first line of `text`.
    pub start_line: usize,
    pub text: String,
}

impl ReviewUnit {
    pub fn end_line(&self) -> usize {
        self.start_line + self.text.lines().count().max(1) - 1
    }

    /// Text of file lines `start..=end`, if they fall inside the unit.
    fn lines(&self, start: usize, end: usize) -> Option<String> {
        if start < self.start_line || end > self.end_line() || end < start {
            return None;
        }
        let lines: Vec<&str> = self
            .text
            .lines()
            .skip(start - self.start_line)
            .take(end - start + 1)
            .collect();
        Some(lines.join("\n"))
    }
}

/// Split a file into review units of at most `unit_lines` lines.
pub fn review_units(file: &ScannedFile, unit_lines: usize) -> Vec<ReviewUnit> {
    if file.content.trim().is_empty() {
        return Vec::new();
    }
    let unit_lines = unit_lines.max(1);
    let whole = ReviewUnit {
        path: file.relative_path.clone(),
        language: file.language.to_string(),
        start_line: 1,
        text: file.content.clone(),
    };
    if file.content.lines().count() <= unit_lines {
        return vec![whole];
    }

    Chunker::new(unit_lines, unit_lines / 10, unit_lines, 0)
        .chunk(&file.content, None)
        .into_iter()
        .map(|c| ReviewUnit {
            path: file.relative_path.clone(),
            language: file.language.to_string(),
            start_line: c.start_line,
            text: c.text,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct UnitOutcome {
    pub findings: Vec<Finding>,
    pub parse_failure: Option<ParseFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub path: String,
    pub start_line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitParseFailure {
    pub path: String,
    pub start_line: usize,
    pub error: String,
    pub raw_response: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RunMetadata {
    pub project_id: String,
    pub analysis_model: String,
    pub files_scanned: usize,
    pub units_analyzed: usize,
    pub findings: usize,
    pub validated: bool,
    pub failures: Vec<UnitFailure>,
    pub parse_failures: Vec<UnitParseFailure>,
    /// Units never started, as `path:start_line`.
    pub skipped: Vec<String>,
    pub aborted: bool,
    pub duration_ms: u64,
}

/// What the reporter receives.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub findings: Vec<Finding>,
    pub metadata: RunMetadata,
}

enum UnitResult {
    Done(ReviewUnit, UnitOutcome),
    Failed(UnitFailure),
    Skipped(String),
}

#[derive(Clone)]
pub struct Analyzer {
    llm: Arc<dyn CompletionService>,
    orchestrator: Arc<Orchestrator>,
    context: ContextAssembler,
    settings: AnalysisConfig,
}

impl Analyzer {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        orchestrator: Arc<Orchestrator>,
        context: ContextAssembler,
        settings: AnalysisConfig,
    ) -> Self {
        Self {
            llm,
            orchestrator,
            context,
            settings,
        }
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        self.orchestrator
            .call(|| async { self.llm.complete(prompt).await })
            .await
    }

    /// Review one unit. Only service errors fail the call; an unparseable
    /// reply is reported in the outcome.
    pub async fn analyze(
        &self,
        project_id: &str,
        unit: &ReviewUnit,
    ) -> Result<UnitOutcome, ServiceError> {
        let evidence = self
            .context
            .assemble(
                project_id,
                Focal::Text {
                    text: &unit.text,
                    path: Some(&unit.path),
                    lines: Some((unit.start_line, unit.end_line())),
                },
                self.settings.top_k_context,
                self.settings.context_char_budget,
            )
            .await;
        debug!(
            "Reviewing {}:{} with {} related chunks",
            unit.path,
            unit.start_line,
            evidence.len()
        );

        let prompt = prompt::review_prompt(unit, &evidence);
        let raw = self.complete(&prompt).await?;

        match parse::parse_findings(&raw) {
            Ok(items) => Ok(UnitOutcome {
                findings: items.into_iter().map(|r| to_finding(r, unit)).collect(),
                parse_failure: None,
            }),
            Err(failure) => {
                warn!(
                    "Could not parse model response for {}:{}: {}",
                    unit.path, unit.start_line, failure.error
                );
                Ok(UnitOutcome {
                    findings: Vec::new(),
                    parse_failure: Some(failure),
                })
            }
        }
    }

    /// Ask the model to confirm `finding`. `Ok(None)` means it was rejected.
    pub async fn validate(
        &self,
        finding: &Finding,
        unit: &ReviewUnit,
    ) -> Result<Option<Finding>, AnalysisError> {
        let raw = self
            .complete(&prompt::validation_prompt(finding, unit))
            .await?;
        let value = parse::parse_json(&raw)?;
        apply_verdict(finding, &value)
    }

    async fn process_unit(
        &self,
        project_id: &str,
        unit: &ReviewUnit,
        validate: bool,
    ) -> Result<UnitOutcome, ServiceError> {
        let mut outcome = self.analyze(project_id, unit).await?;
        if !validate || outcome.findings.is_empty() {
            return Ok(outcome);
        }

        let mut kept = Vec::with_capacity(outcome.findings.len());
        for finding in outcome.findings {
            match self.validate(&finding, unit).await {
                Ok(Some(revised)) => kept.push(revised),
                Ok(None) => debug!("Validation rejected \"{}\" in {}", finding.issue, unit.path),
                Err(e) => {
                    warn!("Validation failed for \"{}\", keeping it: {e}", finding.issue);
                    kept.push(finding);
                }
            }
        }
        outcome.findings = kept;
        Ok(outcome)
    }

    async fn run_unit(
        &self,
        project_id: &str,
        unit: ReviewUnit,
        validate: bool,
        cancel: &CancellationToken,
    ) -> UnitResult {
        if cancel.is_cancelled() {
            return UnitResult::Skipped(format!("{}:{}", unit.path, unit.start_line));
        }
        match self.process_unit(project_id, &unit, validate).await {
            Ok(outcome) => UnitResult::Done(unit, outcome),
            Err(e) => {
                if e.is_circuit_open() {
                    error!("Analysis endpoint unavailable, aborting run: {e}");
                    cancel.cancel();
                } else {
                    warn!("Failed to analyze {}:{}: {e}", unit.path, unit.start_line);
                }
                UnitResult::Failed(UnitFailure {
                    path: unit.path,
                    start_line: unit.start_line,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Review every file, `analysis.batch_size` units at a time.
    pub async fn review(
        &self,
        project_id: &str,
        files: &[ScannedFile],
        validate: bool,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let units: Vec<ReviewUnit> = files
            .iter()
            .flat_map(|f| review_units(f, self.settings.unit_lines))
            .collect();
        info!(
            "Reviewing {} files as {} units (validation {})",
            files.len(),
            units.len(),
            if validate { "on" } else { "off" }
        );

        let mut metadata = RunMetadata {
            project_id: project_id.to_string(),
            analysis_model: self.llm.model_id().to_string(),
            files_scanned: files.len(),
            validated: validate,
            ..Default::default()
        };

        let results: Vec<UnitResult> = stream::iter(units)
            .map(|unit| self.run_unit(project_id, unit, validate, cancel))
            .buffer_unordered(self.settings.batch_size.max(1))
            .collect()
            .await;

        let mut findings = Vec::new();
        for result in results {
            match result {
                UnitResult::Done(unit, outcome) => {
                    metadata.units_analyzed += 1;
                    findings.extend(outcome.findings);
                    if let Some(failure) = outcome.parse_failure {
                        metadata.parse_failures.push(UnitParseFailure {
                            path: unit.path,
                            start_line: unit.start_line,
                            error: failure.error,
                            raw_response: failure.raw,
                        });
                    }
                }
                UnitResult::Failed(failure) => metadata.failures.push(failure),
                UnitResult::Skipped(unit) => metadata.skipped.push(unit),
            }
        }

        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.line_start.cmp(&b.line_start))
        });
        metadata
            .failures
            .sort_by(|a, b| (&a.path, a.start_line).cmp(&(&b.path, b.start_line)));
        metadata
            .parse_failures
            .sort_by(|a, b| (&a.path, a.start_line).cmp(&(&b.path, b.start_line)));
        metadata.skipped.sort();
        metadata.aborted = cancel.is_cancelled();
        metadata.findings = findings.len();
        metadata.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Review finished: {} findings from {} units, {} failed, {} unparseable, {} skipped in {}ms",
            metadata.findings,
            metadata.units_analyzed,
            metadata.failures.len(),
            metadata.parse_failures.len(),
            metadata.skipped.len(),
            metadata.duration_ms
        );
        RunReport { findings, metadata }
    }
}

/// Lines the model reported, if they lie inside the unit.
fn reported_lines(raw: &RawFinding, unit: &ReviewUnit) -> Option<(usize, usize)> {
    let start = usize::try_from(raw.line_start?).ok()?;
    let end = raw
        .line_end
        .and_then(|e| usize::try_from(e).ok())
        .unwrap_or(start);
    let range = unit.start_line..=unit.end_line();
    (range.contains(&start) && range.contains(&end) && start <= end).then_some((start, end))
}

fn to_finding(raw: RawFinding, unit: &ReviewUnit) -> Finding {
    let snippet = raw.code_snippet.clone().unwrap_or_default();
    let lines = reported_lines(&raw, unit)
        .or_else(|| locate::locate(&snippet, &unit.text, unit.start_line));
    let code_snippet = match lines {
        Some((start, end)) if snippet.trim().is_empty() => unit.lines(start, end).unwrap_or_default(),
        _ => snippet,
    };

    Finding {
        id: Uuid::new_v4(),
        issue: raw.issue.unwrap_or_else(|| "Unknown issue".to_string()),
        severity: raw
            .severity
            .as_deref()
            .and_then(Severity::parse)
            .unwrap_or(Severity::Medium),
        confidence: raw
            .confidence
            .map(Confidence::from_score)
            .unwrap_or_default(),
        file_path: unit.path.clone(),
        line_start: lines.map(|(s, _)| s),
        line_end: lines.map(|(_, e)| e),
        code_snippet,
        reasoning: raw.reasoning.unwrap_or_default(),
        mitigation: raw.mitigation.unwrap_or_default(),
        cwe_id: raw.cwe_id,
        tags: raw.tags,
    }
}

/// Apply a `{"verdict": ...}` reply. The boolean `is_valid` form is
/// accepted as well.
fn apply_verdict(finding: &Finding, reply: &Value) -> Result<Option<Finding>, AnalysisError> {
    let confirmed = match (reply.get("verdict"), reply.get("is_valid")) {
        (Some(Value::String(v)), _) => match v.trim().to_ascii_lowercase().as_str() {
            "confirmed" | "confirm" | "valid" | "true_positive" => true,
            "rejected" | "reject" | "invalid" | "false_positive" => false,
            other => return Err(AnalysisError::Verdict(other.to_string())),
        },
        (_, Some(Value::Bool(valid))) => *valid,
        _ => return Err(AnalysisError::Verdict(reply.to_string())),
    };
    if !confirmed {
        return Ok(None);
    }

    let mut revised = finding.clone();
    let severity = reply
        .get("severity")
        .or_else(|| reply.get("adjusted_severity"))
        .and_then(Value::as_str)
        .and_then(Severity::parse);
    if let Some(severity) = severity {
        revised.severity = severity;
    }
    if let Some(score) = reply.get("confidence").and_then(Value::as_f64) {
        revised.confidence = Confidence::from_score(score);
    }
    if !revised.tags.iter().any(|t| t == "validated") {
        revised.tags.push("validated".to_string());
    }
    Ok(Some(revised))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::embedder::EmbeddingClient;
    use crate::embedder::mock::MockEmbedder;
    use crate::indexer::fingerprint::fingerprint;
    use crate::llm::mock::ScriptedCompletion;
    use crate::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy};
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    fn orchestrator(name: &str, failure_threshold: u32) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            name,
            Arc::new(CircuitBreaker::new(
                name,
                BreakerConfig {
                    failure_threshold,
                    ..BreakerConfig::default()
                },
            )),
            RetryPolicy::none(),
            Duration::from_secs(5),
        ))
    }

    fn analyzer(llm: Arc<ScriptedCompletion>, settings: AnalysisConfig) -> Analyzer {
        let db = Arc::new(TokioMutex::new(Db::open_in_memory("mock", 32).unwrap()));
        let embedder = EmbeddingClient::new(
            Arc::new(MockEmbedder::new(32)),
            orchestrator("embedding", 5),
            8,
        );
        let context = ContextAssembler::new(db, embedder, 0.9);
        Analyzer::new(llm, orchestrator("analysis", 2), context, settings)
    }

    fn file(path: &str, content: &str) -> ScannedFile {
        ScannedFile {
            relative_path: path.to_string(),
            language: "python",
            fingerprint: fingerprint(content),
            content: content.to_string(),
        }
    }

    fn unit(text: &str, start_line: usize) -> ReviewUnit {
        ReviewUnit {
            path: "app.py".to_string(),
            language: "python".to_string(),
            start_line,
            text: text.to_string(),
        }
    }

    const VULN: &str = "import sqlite3\n\ndef find(uid):\n    q = \"SELECT * FROM users WHERE id=\" + uid\n    return sqlite3.connect('x').execute(q)\n";

    #[test]
    fn test_review_units_split_long_files() {
        let short = file("a.py", "x = 1\ny = 2\n");
        assert_eq!(review_units(&short, 10).len(), 1);

        let long_text: String = (1..=25).map(|i| format!("v{i} = {i}\n")).collect();
        let units = review_units(&file("b.py", &long_text), 10);
        assert!(units.len() > 2);
        assert_eq!(units[0].start_line, 1);
        assert!(units.iter().all(|u| u.text.lines().count() <= 10));
        assert_eq!(units.last().unwrap().end_line(), 25);

        assert!(review_units(&file("c.py", "  \n"), 10).is_empty());
    }

    #[test]
    fn test_to_finding_defaults_and_line_resolution() {
        let u = unit(VULN, 10);
        let raw = RawFinding {
            issue: Some("SQL injection".to_string()),
            code_snippet: Some("q = \"SELECT * FROM users WHERE id=\" + uid".to_string()),
            line_start: Some(400),
            ..Default::default()
        };
        let f = to_finding(raw, &u);
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.confidence.score, 0.7);
        assert_eq!((f.line_start, f.line_end), (Some(13), Some(13)));

        let in_range = RawFinding {
            line_start: Some(12),
            line_end: Some(14),
            ..Default::default()
        };
        let f = to_finding(in_range, &u);
        assert_eq!((f.line_start, f.line_end), (Some(12), Some(14)));
        assert_eq!(f.issue, "Unknown issue");
        assert!(f.code_snippet.starts_with("def find(uid):"));

        let lost = RawFinding {
            code_snippet: Some("eval(payload)".to_string()),
            ..Default::default()
        };
        let f = to_finding(lost, &u);
        assert_eq!((f.line_start, f.line_end), (None, None));
    }

    #[tokio::test]
    async fn test_analyze_parses_findings() {
        let reply = r#"{"reviews": [{"issue": "SQL injection", "severity": "critical", "confidence": 0.95,
            "code_snippet": "q = \"SELECT * FROM users WHERE id=\" + uid", "cwe_id": "CWE-89"}]}"#;
        let llm = Arc::new(ScriptedCompletion::from_responses([Ok(reply.to_string())]));
        let a = analyzer(llm.clone(), AnalysisConfig::default());

        let outcome = a.analyze("p", &unit(VULN, 1)).await.unwrap();
        assert!(outcome.parse_failure.is_none());
        let f = &outcome.findings[0];
        assert_eq!(f.severity, Severity::Critical);
        assert_eq!(f.confidence.level, ConfidenceLevel::High);
        assert_eq!(f.line_start, Some(4));
        assert_eq!(f.cwe_id.as_deref(), Some("CWE-89"));

        let prompts = llm.prompts();
        assert!(prompts[0].user.contains("   4 |     q = \"SELECT"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_recorded() {
        let llm = Arc::new(ScriptedCompletion::from_responses([Ok(
            "Sorry, I cannot help with that.".to_string(),
        )]));
        let a = analyzer(llm, AnalysisConfig::default());

        let report = a
            .review("p", &[file("app.py", VULN)], false, &CancellationToken::new())
            .await;
        assert!(report.findings.is_empty());
        assert_eq!(report.metadata.units_analyzed, 1);
        assert_eq!(report.metadata.parse_failures.len(), 1);
        assert_eq!(
            report.metadata.parse_failures[0].raw_response,
            "Sorry, I cannot help with that."
        );
    }

    #[tokio::test]
    async fn test_validation_confirms_revises_and_rejects() {
        let reply = r#"{"reviews": [
            {"issue": "kept", "severity": "low", "code_snippet": "def find(uid):"},
            {"issue": "dropped", "severity": "high"},
            {"issue": "errored", "severity": "medium"}
        ]}"#;
        let llm = Arc::new(ScriptedCompletion::with_responder(move |prompt: &Prompt| {
            if !prompt.user.contains("REPORTED FINDING") {
                return Ok(reply.to_string());
            }
            if prompt.user.contains("\"kept\"") {
                Ok(r#"{"verdict": "confirmed", "severity": "high", "confidence": 0.9}"#.to_string())
            } else if prompt.user.contains("\"dropped\"") {
                Ok(r#"{"verdict": "rejected", "reasoning": "sanitized upstream"}"#.to_string())
            } else {
                Ok("maybe?".to_string())
            }
        }));
        let a = analyzer(llm, AnalysisConfig::default());

        let report = a
            .review("p", &[file("app.py", VULN)], true, &CancellationToken::new())
            .await;
        let issues: Vec<&str> = report.findings.iter().map(|f| f.issue.as_str()).collect();
        assert_eq!(issues, vec!["kept", "errored"]);
        let kept = &report.findings[0];
        assert_eq!(kept.severity, Severity::High);
        assert_eq!(kept.confidence.score, 0.9);
        assert!(kept.tags.contains(&"validated".to_string()));
        assert_eq!(report.findings[1].severity, Severity::Medium);
        assert!(report.metadata.validated);
    }

    #[tokio::test]
    async fn test_open_circuit_aborts_review() {
        let llm = Arc::new(ScriptedCompletion::with_responder(|_| {
            Err(ServiceError::Connection("refused".to_string()))
        }));
        let settings = AnalysisConfig {
            batch_size: 1,
            ..AnalysisConfig::default()
        };
        let a = analyzer(llm, settings);
        let files: Vec<ScannedFile> = (0..5).map(|i| file(&format!("f{i}.py"), VULN)).collect();

        let report = a
            .review("p", &files, false, &CancellationToken::new())
            .await;
        assert!(report.metadata.aborted);
        // Two failures open the breaker; the third call fails fast and aborts.
        assert_eq!(report.metadata.failures.len(), 3);
        assert_eq!(report.metadata.skipped.len(), 2);
        assert_eq!(report.metadata.units_analyzed, 0);
    }

    #[test]
    fn test_apply_verdict_forms() {
        let base = to_finding(
            RawFinding {
                issue: Some("x".to_string()),
                ..Default::default()
            },
            &unit(VULN, 1),
        );
        let legacy = serde_json::json!({"is_valid": true, "adjusted_severity": "critical"});
        let revised = apply_verdict(&base, &legacy).unwrap().unwrap();
        assert_eq!(revised.severity, Severity::Critical);

        let rejected = serde_json::json!({"is_valid": false});
        assert!(apply_verdict(&base, &rejected).unwrap().is_none());

        let unknown = serde_json::json!({"verdict": "unsure"});
        assert!(matches!(
            apply_verdict(&base, &unknown),
            Err(AnalysisError::Verdict(_))
        ));
    }
}
