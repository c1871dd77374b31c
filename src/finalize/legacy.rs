//! Secondary repair pass for text that never carried `<<< >>>` markup,
//! e.g. messages restored from storage or generated before the markup
//! convention existed.

use regex::{Captures, Regex};
use std::sync::LazyLock;

const MAX_MERGE_ROUNDS: usize = 16;

static DOUBLE_PARENTHESIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\(([^()\n]+?)\)\)").expect("double parenthesis pattern is valid")
});

static OPERATOR_SPLIT_SPANS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(^|[^$\\])\$([^$\n]+)\$[ \t]*(\\times|\\cdot|\\div|[-+=<>*/×÷·])[ \t]*\$([^$\n]+)\$",
    )
    .expect("operator split pattern is valid")
});

/// Applies the fallback repairs in order: delimiters inside brace groups are
/// stripped, `((x))` becomes `$x$`, and `$a$ + $b$` becomes `$a + b$`.
pub fn repair_legacy_math(text: &str) -> String {
    let unbraced = strip_delimiters_in_braces(text);
    let converted = convert_double_parentheses(&unbraced);
    merge_operator_split_spans(&converted)
}

/// Drops `$` found at any brace depth; depth resets at each line break.
fn strip_delimiters_in_braces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                out.push(ch);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '{' => {
                depth += 1;
                out.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                out.push(ch);
            }
            '\n' => {
                depth = 0;
                out.push(ch);
            }
            '$' if depth > 0 => {}
            _ => out.push(ch),
        }
    }
    out
}

fn convert_double_parentheses(text: &str) -> String {
    DOUBLE_PARENTHESIS
        .replace_all(text, |caps: &Captures| format!("${}$", caps[1].trim()))
        .into_owned()
}

fn merge_operator_split_spans(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_MERGE_ROUNDS {
        let merged = OPERATOR_SPLIT_SPANS
            .replace_all(&current, |caps: &Captures| {
                format!(
                    "{}${} {} {}$",
                    &caps[1],
                    caps[2].trim(),
                    &caps[3],
                    caps[4].trim()
                )
            })
            .into_owned();
        if merged == current {
            break;
        }
        current = merged;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_spans_around_operator_are_merged() {
        assert_eq!(repair_legacy_math("so $a$ + $b$ holds"), "so $a + b$ holds");
        assert_eq!(repair_legacy_math("$x$=$2$"), "$x = 2$");
        assert_eq!(
            repair_legacy_math(r"$a$ \times $b$ - $c$"),
            r"$a \times b - c$"
        );
    }

    #[test]
    fn test_spans_without_operator_stay_separate() {
        assert_eq!(repair_legacy_math("$a$ and $b$"), "$a$ and $b$");
    }

    #[test]
    fn test_display_blocks_are_not_merged() {
        let text = "$$a$$ + $$b$$";
        assert_eq!(repair_legacy_math(text), text);
    }

    #[test]
    fn test_delimiters_inside_braces_are_stripped() {
        assert_eq!(
            repair_legacy_math(r"$\frac{$S_{xy}$}{$S_{xx}$}$"),
            r"$\frac{S_{xy}}{S_{xx}}$"
        );
    }

    #[test]
    fn test_double_parentheses_become_inline_math() {
        assert_eq!(repair_legacy_math("area ((pi r^2)) here"), "area $pi r^2$ here");
        assert_eq!(repair_legacy_math("f((x))"), "f$x$");
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        let text = "No math here (really) {just braces}.";
        assert_eq!(repair_legacy_math(text), text);
    }
}
