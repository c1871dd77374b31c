//! Repairs responses where the generator emitted the same content twice.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

const HALF_MIN_CHARS: usize = 100;
const HALF_SIMILARITY_THRESHOLD: f64 = 0.8;
const CONTAINMENT_SCORE: f64 = 0.9;
const PREFIX_PROBE_CHARS: usize = 50;
const SIGNATURE_CHARS: usize = 150;
const MIN_WORD_CHARS: usize = 4;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph break pattern is valid"));

/// Drops repeated paragraphs, or failing that, a duplicated second half.
///
/// A repeated paragraph is the more precise signal, so the halves check only
/// runs when no paragraph repeats. Returns the input unchanged when nothing
/// looks duplicated.
pub fn remove_duplicate_content(text: &str) -> String {
    if let Some(deduped) = dedupe_paragraphs(text) {
        return deduped;
    }
    collapse_repeated_halves(text).unwrap_or_else(|| text.to_string())
}

fn collapse_repeated_halves(text: &str) -> Option<String> {
    let (first, second) = text.split_at(halves_cut(text));
    let (first, second) = (first.trim(), second.trim());

    if first.chars().count() <= HALF_MIN_CHARS || second.chars().count() <= HALF_MIN_CHARS {
        return None;
    }
    (similarity(first, second) > HALF_SIMILARITY_THRESHOLD).then(|| first.to_string())
}

/// Char midpoint of `text`, moved back to the start of the word it would split.
fn halves_cut(text: &str) -> usize {
    let total_chars = text.chars().count();
    let midpoint = text
        .char_indices()
        .nth(total_chars / 2)
        .map_or(text.len(), |(index, _)| index);

    let (before, after) = text.split_at(midpoint);
    let splits_word = before.chars().next_back().is_some_and(char::is_alphanumeric)
        && after.chars().next().is_some_and(char::is_alphanumeric);
    if !splits_word {
        return midpoint;
    }
    before
        .char_indices()
        .rev()
        .find(|(_, ch)| !ch.is_alphanumeric())
        .map_or(midpoint, |(index, ch)| index + ch.len_utf8())
}

fn dedupe_paragraphs(text: &str) -> Option<String> {
    let sections: Vec<&str> = PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|section| !section.is_empty())
        .collect();

    let mut seen = HashSet::new();
    let kept: Vec<&str> = sections
        .iter()
        .copied()
        .filter(|section| seen.insert(section_signature(section)))
        .collect();

    (kept.len() < sections.len()).then(|| kept.join("\n\n"))
}

fn section_signature(section: &str) -> String {
    collapse_whitespace(&section.to_lowercase())
        .chars()
        .take(SIGNATURE_CHARS)
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cheap lexical overlap score in `[0, 1]`.
///
/// Containment (or a shared opening) scores 0.9 outright. Otherwise the
/// score is the Dice coefficient over words longer than three characters.
/// This is not an edit distance and is only meaningful against the 0.8
/// duplicate threshold.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = collapse_whitespace(&a.to_lowercase());
    let b = collapse_whitespace(&b.to_lowercase());
    let (longer, shorter) = if a.chars().count() >= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    if shorter.is_empty() {
        return 0.0;
    }

    let probe: String = shorter.chars().take(PREFIX_PROBE_CHARS).collect();
    if longer.contains(shorter.as_str()) || longer.starts_with(probe.as_str()) {
        return CONTAINMENT_SCORE;
    }

    let longer_words = significant_words(&longer);
    let shorter_words = significant_words(&shorter);
    if longer_words.is_empty() || shorter_words.is_empty() {
        return 0.0;
    }

    let longer_set: HashSet<&str> = longer_words.iter().copied().collect();
    let shorter_set: HashSet<&str> = shorter_words.iter().copied().collect();
    let common = shorter_set.intersection(&longer_set).count();
    let score = (2 * common) as f64 / (longer_words.len() + shorter_words.len()) as f64;
    score.min(1.0)
}

fn significant_words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| word.chars().count() >= MIN_WORD_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_ANSWER: &str = "Linear regression models the relationship between a dependent \
        variable and one or more explanatory variables by fitting a straight line that \
        minimises the sum of squared residuals.";

    #[test]
    fn test_repeated_halves_keep_first_half() {
        assert!(LONG_ANSWER.len() > HALF_MIN_CHARS);
        let doubled = format!("{LONG_ANSWER}{LONG_ANSWER}");
        assert_eq!(remove_duplicate_content(&doubled), LONG_ANSWER);
    }

    #[test]
    fn test_repeated_halves_with_separator_are_trimmed() {
        let doubled = format!("{LONG_ANSWER}\n\n{LONG_ANSWER}\n");
        assert_eq!(remove_duplicate_content(&doubled), LONG_ANSWER);
    }

    #[test]
    fn test_long_repeated_paragraph_keeps_short_middle_section() {
        let text = format!("{LONG_ANSWER}\n\nRemember this.\n\n{LONG_ANSWER}");
        assert_eq!(
            remove_duplicate_content(&text),
            format!("{LONG_ANSWER}\n\nRemember this.")
        );
    }

    #[test]
    fn test_halves_cut_never_splits_a_word() {
        assert_eq!(halves_cut("ab cdefgh"), 3);
        assert_eq!(halves_cut("abc def"), 3);
        assert_eq!(halves_cut("abcdefgh"), 4);
        assert_eq!(halves_cut("one.two."), 4);
        assert_eq!(halves_cut(""), 0);
    }

    #[test]
    fn test_short_halves_skip_the_halves_check() {
        let text = "Short answer. Short answer.";
        assert_eq!(remove_duplicate_content(text), text);
    }

    #[test]
    fn test_repeated_paragraph_is_dropped_in_order() {
        let a = "Moles count particles.";
        let b = "Avogadro's number is 6.022e23.";
        let text = format!("{a}\n\n{b}\n\n{a}");
        assert_eq!(remove_duplicate_content(&text), format!("{a}\n\n{b}"));
    }

    #[test]
    fn test_paragraph_signature_ignores_case_and_spacing() {
        let text = "Key   idea here.\n\nOther point.\n\n  key idea\nHERE.  ";
        assert_eq!(
            remove_duplicate_content(text),
            "Key   idea here.\n\nOther point."
        );
    }

    #[test]
    fn test_distinct_text_is_returned_unchanged() {
        let text = "First point.\n\n\n\nSecond point.\n";
        assert_eq!(remove_duplicate_content(text), text);
        assert_eq!(remove_duplicate_content(""), "");
    }

    #[test]
    fn test_similarity_containment_scores_high() {
        assert_eq!(similarity("the mole", "Defining THE   mole precisely"), 0.9);
    }

    #[test]
    fn test_similarity_word_overlap() {
        let score = similarity(
            "energy transfers through conduction quickly",
            "energy passes through radiation slowly",
        );
        // five qualifying words each, two shared
        assert!((score - 0.4).abs() < 1e-9, "score was {score}");
        assert_eq!(similarity("a b c", "the cat sat on a mat"), 0.0);
        assert_eq!(similarity("", "anything"), 0.0);
    }

    #[test]
    fn test_different_halves_are_not_collapsed() {
        let text = format!(
            "{LONG_ANSWER} Meanwhile, correlation coefficients summarise how strongly two \
             quantities move together without implying any causal direction whatsoever."
        );
        assert_eq!(remove_duplicate_content(&text), text);
    }
}
