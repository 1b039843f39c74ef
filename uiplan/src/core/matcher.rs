//! Text normalization and scoring against recognized lines.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::core::types::{MatchMode, OcrLine};

/// Score given to a `contains` hit where the target is a substring.
pub const CONTAINS_SCORE: f64 = 0.95;

/// A recognized line chosen for a target, with its index in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub index: usize,
    pub line: OcrLine,
    pub score: f64,
}

/// Normalize text for comparison: NFKC, lowercase, bullets and dashes to
/// spaces, whitespace collapsed. Returns `None` when nothing is left.
pub fn normalize(text: &str) -> Option<String> {
    static SEPARATORS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[\s·•∙—–]+").unwrap());

    let folded = text.nfkc().collect::<String>().to_lowercase();
    let collapsed = SEPARATORS.replace_all(&folded, " ");
    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn tokens(normalized: &str) -> BTreeSet<&str> {
    normalized.split(' ').filter(|t| !t.is_empty()).collect()
}

/// Token overlap `|A ∩ B| / max(|A|, |B|)`.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    let denom = a.len().max(b.len());
    if denom == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / denom as f64
}

/// Score two already-normalized strings.
pub fn score(line: &str, target: &str, mode: MatchMode) -> f64 {
    match mode {
        MatchMode::Exact => {
            if line == target {
                1.0
            } else {
                0.0
            }
        }
        MatchMode::Contains => {
            if line.contains(target) {
                CONTAINS_SCORE
            } else {
                token_overlap(line, target)
            }
        }
        MatchMode::Fuzzy => token_overlap(line, target),
    }
}

/// Pick the best line for `target`.
///
/// Lines under `min_conf` or empty after normalization are skipped. Only a
/// positive score can win; ties keep the earliest line.
pub fn best_match(
    lines: &[OcrLine],
    target: &str,
    mode: MatchMode,
    min_conf: f64,
) -> Option<TextMatch> {
    let target = normalize(target)?;
    let mut best: Option<TextMatch> = None;
    for (index, line) in lines.iter().enumerate() {
        if line.confidence < min_conf {
            continue;
        }
        let Some(normalized) = normalize(&line.text) else {
            continue;
        };
        let candidate = score(&normalized, &target, mode);
        if candidate <= 0.0 {
            continue;
        }
        if best.as_ref().is_none_or(|b| candidate > b.score) {
            best = Some(TextMatch {
                index,
                line: line.clone(),
                score: candidate,
            });
        }
    }
    best
}

/// First token (in the given order) with a `contains` match.
pub fn first_token_match<'a>(
    lines: &[OcrLine],
    tokens: &'a [String],
    min_conf: f64,
) -> Option<(&'a str, TextMatch)> {
    tokens.iter().find_map(|token| {
        best_match(lines, token, MatchMode::Contains, min_conf).map(|m| (token.as_str(), m))
    })
}

/// All lines at or above `min_conf`, normalized and joined with spaces.
pub fn normalized_blob(lines: &[OcrLine], min_conf: f64) -> String {
    lines
        .iter()
        .filter(|line| line.confidence >= min_conf)
        .filter_map(|line| normalize(&line.text))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Rect;

    fn line(text: &str, confidence: f64) -> OcrLine {
        OcrLine {
            text: text.to_string(),
            confidence,
            bbox: Rect::new(0, 0, 10, 10),
        }
    }

    #[test]
    fn normalize_folds_case_width_and_separators() {
        assert_eq!(normalize("  Don’t • SAVE — now ").as_deref(), Some("don’t save now"));
        assert_eq!(normalize("ＣＡＮＣＥＬ").as_deref(), Some("cancel"));
        assert_eq!(normalize(" · – ").as_deref(), None);
    }

    /// Exact mode picks the first line, not a later line containing the target.
    #[test]
    fn exact_prefers_identical_line() {
        let lines = vec![line("Cancel", 0.9), line("Cancel All", 0.9)];
        let chosen = best_match(&lines, "Cancel", MatchMode::Exact, 0.5).expect("match");
        assert_eq!(chosen.index, 0);
        assert_eq!(chosen.line.text, "Cancel");
        assert_eq!(chosen.score, 1.0);
    }

    #[test]
    fn contains_scores_substring_above_overlap() {
        let lines = vec![line("Save As", 0.9), line("Don't Save Changes", 0.9)];
        let chosen = best_match(&lines, "don't save", MatchMode::Contains, 0.5).expect("match");
        assert_eq!(chosen.index, 1);
        assert_eq!(chosen.score, CONTAINS_SCORE);
    }

    #[test]
    fn fuzzy_uses_token_overlap() {
        assert_eq!(token_overlap("serum 2 preset", "serum preset"), 2.0 / 3.0);
        let lines = vec![line("Operator", 0.9), line("Serum Preset Browser", 0.9)];
        let chosen = best_match(&lines, "serum preset", MatchMode::Fuzzy, 0.5).expect("match");
        assert_eq!(chosen.index, 1);
    }

    #[test]
    fn low_confidence_and_zero_scores_never_match() {
        let lines = vec![line("Cancel", 0.3), line("Open", 0.9)];
        assert!(best_match(&lines, "Cancel", MatchMode::Exact, 0.5).is_none());
        assert!(best_match(&lines, "   ", MatchMode::Fuzzy, 0.0).is_none());
    }

    #[test]
    fn ties_keep_earliest_line() {
        let lines = vec![line("kick one", 0.9), line("kick two", 0.9)];
        let chosen = best_match(&lines, "kick", MatchMode::Fuzzy, 0.5).expect("match");
        assert_eq!(chosen.index, 0);
    }

    #[test]
    fn first_token_match_respects_token_order() {
        let lines = vec![line("Replace existing file?", 0.8)];
        let tokens = vec!["open".to_string(), "replace".to_string()];
        let (token, chosen) = first_token_match(&lines, &tokens, 0.65).expect("match");
        assert_eq!(token, "replace");
        assert_eq!(chosen.index, 0);
    }
}
