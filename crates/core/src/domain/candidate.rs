use serde::{Deserialize, Serialize};

use crate::domain::cpt::normalize_code;

/// A text span (or structured pointer) supporting a code. Opaque to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
}

/// A suggested billing code. Downstream stages never mutate a candidate: they
/// build a successor with [`CodeCandidate::superseded_by`], which carries the
/// evidence forward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeCandidate {
    code: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    evidence: Vec<EvidenceSpan>,
}

impl CodeCandidate {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self {
            code: normalize_code(code.as_ref()),
            confidence: 0.0,
            reason: None,
            evidence: Vec::new(),
        }
    }

    pub fn scored(code: impl AsRef<str>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            code: normalize_code(code.as_ref()),
            confidence: confidence.clamp(0.0, 1.0),
            reason: Some(reason.into()),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<EvidenceSpan>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// A zero confidence means nothing upstream scored the candidate.
    pub fn is_scored(&self) -> bool {
        self.confidence > 0.0
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn evidence(&self) -> &[EvidenceSpan] {
        &self.evidence
    }

    pub fn superseded_by(&self, code: impl AsRef<str>, reason: impl Into<String>) -> Self {
        Self {
            code: normalize_code(code.as_ref()),
            confidence: self.confidence,
            reason: Some(reason.into()),
            evidence: self.evidence.clone(),
        }
    }

    pub fn rescored(&self, confidence: f64) -> Self {
        Self { confidence: confidence.clamp(0.0, 1.0), ..self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::{CodeCandidate, EvidenceSpan};

    #[test]
    fn superseding_keeps_evidence_and_original_intact() {
        let original = CodeCandidate::scored("+31636", 0.7, "stent placed").with_evidence(vec![
            EvidenceSpan {
                source: "note".to_string(),
                text: "stent deployed in left main bronchus".to_string(),
                start: Some(10),
                end: Some(46),
            },
        ]);

        let successor = original.superseded_by("+31637", "hierarchy:31636->31637");

        assert_eq!(original.code(), "31636");
        assert_eq!(successor.code(), "31637");
        assert_eq!(successor.reason(), Some("hierarchy:31636->31637"));
        assert_eq!(successor.evidence(), original.evidence());
        assert!((successor.confidence() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn unscored_candidates_default_to_zero_confidence() {
        let candidate = CodeCandidate::new("31622");
        assert!(!candidate.is_scored());
        assert!(candidate.reason().is_none());
    }
}
