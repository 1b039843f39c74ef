//! Keyword-based detection of OS dialogs blocking the target app.

use crate::core::matcher::{normalize, normalized_blob};
use crate::core::types::OcrLine;

pub const DEFAULT_MODAL_KEYWORDS: &[&str] = &[
    "open",
    "save",
    "cancel",
    "replace",
    "don’t save",
    "dont save",
    "are you sure",
    "missing",
    "locate",
    "authorization",
    "plugin",
];

/// Minimum line confidence considered when looking for dialog keywords.
pub const MODAL_MIN_CONF: f64 = 0.55;

/// Reports a modal as present when any keyword occurs in the normalized text
/// of the modal region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalDetector {
    keywords: Vec<String>,
}

impl ModalDetector {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        let keywords = keywords
            .iter()
            .filter_map(|k| normalize(k.as_ref()))
            .collect();
        Self { keywords }
    }

    /// The keyword that matched, if any.
    pub fn detect(&self, lines: &[OcrLine]) -> Option<&str> {
        let blob = normalized_blob(lines, MODAL_MIN_CONF);
        if blob.is_empty() {
            return None;
        }
        self.keywords
            .iter()
            .find(|k| blob.contains(k.as_str()))
            .map(String::as_str)
    }
}

impl Default for ModalDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MODAL_KEYWORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Rect;

    fn line(text: &str, confidence: f64) -> OcrLine {
        OcrLine {
            text: text.to_string(),
            confidence,
            bbox: Rect::new(0, 0, 40, 12),
        }
    }

    #[test]
    fn detects_keywords_across_lines() {
        let detector = ModalDetector::default();
        let lines = vec![line("Are you", 0.9), line("sure?", 0.9)];
        assert_eq!(detector.detect(&lines), Some("are you sure"));
    }

    #[test]
    fn ignores_low_confidence_and_unrelated_text() {
        let detector = ModalDetector::default();
        assert_eq!(detector.detect(&[line("Save", 0.2)]), None);
        assert_eq!(detector.detect(&[line("Arrangement View", 0.9)]), None);
        assert_eq!(detector.detect(&[]), None);
    }

    #[test]
    fn custom_keywords_are_normalized() {
        let detector = ModalDetector::new(&["  License   EXPIRED "]);
        assert_eq!(
            detector.detect(&[line("Your license expired", 0.9)]),
            Some("license expired")
        );
    }
}
