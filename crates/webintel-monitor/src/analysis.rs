//! Change analysis.
//!
//! The analyzer is a seam: the pipeline only needs something that turns the
//! previous and current content of a page into an [`AnalysisOutput`]. The
//! built-in [`HeuristicAnalyzer`] is deterministic and needs no network.

use serde::{Deserialize, Serialize};

/// Minimum absolute change in character count that raises a risk flag.
pub const LARGE_CONTENT_DELTA: usize = 500;

const SENSITIVE_KEYWORDS: &[&str] = &["password", "credential"];

/// Structured result of analyzing one content change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub summary: String,
    pub detected_changes: Vec<String>,
    pub risk_flags: Vec<String>,
}

/// Produces an [`AnalysisOutput`] for a content change.
pub trait Analyzer: Send + Sync {
    fn analyze(
        &self,
        url: &str,
        previous_content: Option<&str>,
        current_content: &str,
    ) -> AnalysisOutput;
}

/// Rule-based analyzer.
///
/// Change labels:
/// - `initial_capture` when there is no previous content
/// - `no_textual_change` when previous and current are identical
/// - `content_changed` otherwise
///
/// Risk flags, raised only for `content_changed`:
/// - `large_content_delta` when the character count moved by more than
///   [`LARGE_CONTENT_DELTA`]
/// - `sensitive_keywords_detected` when the current content mentions a
///   password or credential (case-insensitive)
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalyzer;

impl Analyzer for HeuristicAnalyzer {
    fn analyze(
        &self,
        url: &str,
        previous_content: Option<&str>,
        current_content: &str,
    ) -> AnalysisOutput {
        let mut detected_changes = Vec::new();
        let mut risk_flags = Vec::new();

        match previous_content {
            None => detected_changes.push("initial_capture".to_string()),
            Some(previous) if previous == current_content => {
                detected_changes.push("no_textual_change".to_string())
            }
            Some(previous) => {
                detected_changes.push("content_changed".to_string());

                let delta = current_content.chars().count().abs_diff(previous.chars().count());
                if delta > LARGE_CONTENT_DELTA {
                    risk_flags.push("large_content_delta".to_string());
                }

                let lowered = current_content.to_lowercase();
                if SENSITIVE_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
                    risk_flags.push("sensitive_keywords_detected".to_string());
                }
            }
        }

        let flags = if risk_flags.is_empty() {
            "none".to_string()
        } else {
            risk_flags.join(", ")
        };
        let summary = format!(
            "Analyzed monitor content for {url}. Detected: {}. Risk flags: {flags}.",
            detected_changes.join(", ")
        );

        AnalysisOutput {
            summary,
            detected_changes,
            risk_flags,
        }
    }
}
