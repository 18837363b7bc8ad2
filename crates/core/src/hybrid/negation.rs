use regex::Regex;

/// Decides whether a context window around a positive phrase is negated.
/// Swappable so a model-backed detector can replace the regex one.
pub trait NegationDetector: Send + Sync {
    fn is_negated(&self, window: &str, negative_phrases: &[String]) -> bool;
}

/// Matches configured negative phrases as whole words, case-insensitively,
/// tolerating any run of whitespace between words.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexNegationDetector;

impl NegationDetector for RegexNegationDetector {
    fn is_negated(&self, window: &str, negative_phrases: &[String]) -> bool {
        negative_phrases.iter().filter(|phrase| !phrase.trim().is_empty()).any(|phrase| {
            match phrase_pattern(phrase) {
                Some(pattern) => pattern.is_match(window),
                None => window.to_lowercase().contains(&phrase.trim().to_lowercase()),
            }
        })
    }
}

/// Word-bounded, whitespace-tolerant pattern for a phrase. `None` for blank
/// phrases or when the pattern fails to compile.
pub fn phrase_pattern(phrase: &str) -> Option<Regex> {
    let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
    if words.is_empty() {
        return None;
    }
    let body = words.join(r"\s+");
    let starts_word = phrase.trim_start().chars().next().is_some_and(is_word_char);
    let ends_word = phrase.trim_end().chars().last().is_some_and(is_word_char);
    let pattern = format!(
        "(?i){}{}{}",
        if starts_word { r"\b" } else { "" },
        body,
        if ends_word { r"\b" } else { "" }
    );
    Regex::new(&pattern).ok()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Slice of `text` spanning `radius` characters on each side of the byte
/// range `start..end`, cut on char boundaries.
pub fn context_window(text: &str, start: usize, end: usize, radius: usize) -> &str {
    let before =
        text[..start].char_indices().rev().nth(radius.saturating_sub(1)).map(|(index, _)| index);
    let from = if radius == 0 { start } else { before.unwrap_or(0) };
    let to = text[end..]
        .char_indices()
        .nth(radius)
        .map(|(index, _)| end + index)
        .unwrap_or(text.len());
    &text[from..to]
}

#[cfg(test)]
mod tests {
    use super::{context_window, phrase_pattern, NegationDetector, RegexNegationDetector};

    fn phrases(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn negative_phrase_matches_across_whitespace_and_case() {
        let detector = RegexNegationDetector;
        assert!(detector
            .is_negated("The stent was\n NOT placed today", &phrases(&["stent was not placed"])));
        assert!(!detector.is_negated("stent was placed", &phrases(&["stent was not placed"])));
    }

    #[test]
    fn whole_words_only() {
        let detector = RegexNegationDetector;
        assert!(!detector.is_negated("nobal lavage", &phrases(&["no bal"])));
        assert!(detector.is_negated("there was no bal today", &phrases(&["no bal"])));
    }

    #[test]
    fn blank_phrases_never_negate() {
        assert!(phrase_pattern("   ").is_none());
        assert!(!RegexNegationDetector.is_negated("anything", &phrases(&[])));
        assert!(!RegexNegationDetector.is_negated("anything", &phrases(&["  "])));
        assert!(!RegexNegationDetector.is_negated("anything", &phrases(&["", "\t"])));
        assert!(RegexNegationDetector.is_negated("no bal today", &phrases(&[" ", "no bal"])));
    }

    #[test]
    fn window_is_bounded_and_char_safe() {
        let text = "ééééé radial ebus ééééé";
        let start = text.find("radial").expect("phrase");
        let end = start + "radial ebus".len();

        assert_eq!(context_window(text, start, end, 2), "é radial ebus é");
        assert_eq!(context_window(text, start, end, 500), text);
        assert_eq!(context_window(text, start, end, 0), "radial ebus");
    }
}
