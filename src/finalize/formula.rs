//! Converts the generator's `<<< ... >>>` formula markup into `$`/`$$`
//! delimiters and repairs malformed delimiter pairs.
//!
//! Every pass is a pure string transform. Running [`normalize_formulas`] on
//! its own output returns that output unchanged.

use aho_corasick::AhoCorasick;
use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::debug;

const DISPLAY_MIN_CHARS: usize = 41;
const DISPLAY_EQUATION_MIN_CHARS: usize = 16;
const MAX_NORMALIZE_ROUNDS: usize = 16;

static FORMULA_MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<<<(.*?)>>>").expect("formula markup pattern is valid"));

static ROLE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^(?:[ \t]*assistant:[ \t]*)+").expect("role prefix pattern is valid")
});

static DISPLAY_CONSTRUCTS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new([
        r"\frac",
        r"\dfrac",
        r"\tfrac",
        r"\sum",
        r"\overline",
        r"\bar{",
        r"\times",
        r"\cdot",
        r"\dot{",
        r"\rightarrow",
        r"\leftarrow",
        r"\Rightarrow",
        r"\leftrightarrow",
        r"\longrightarrow",
        r"\rightleftharpoons",
    ])
    .expect("display construct patterns are valid")
});

/// Runs every normalization pass in order, repeating until the text stops
/// changing.
///
/// A repair can expose another one (a collapsed delimiter that leaves a role
/// prefix at a line start, markup nested inside markup), so a single round is
/// not always a fixed point.
pub fn normalize_formulas(text: &str) -> String {
    let mut current = normalize_round(text);
    for _ in 1..MAX_NORMALIZE_ROUNDS {
        let next = normalize_round(&current);
        if next == current {
            return current;
        }
        current = next;
    }
    debug!(rounds = MAX_NORMALIZE_ROUNDS, "formula normalization did not settle");
    current
}

fn normalize_round(text: &str) -> String {
    let expanded = expand_formula_markup(text);
    let stripped = strip_role_prefixes(&expanded);

    let mut tokens = tokenize(&stripped);
    repair_mismatched_pairs(&mut tokens);
    close_dangling_block(&mut tokens);
    let tokens = collapse_nested_delimiters(tokens);
    let tokens = demote_single_variable_blocks(tokens);
    let tokens = separate_inline_delimiters(tokens);
    render(&tokens)
}

pub fn has_formula_markup(text: &str) -> bool {
    FORMULA_MARKUP.is_match(text)
}

/// Replaces `<<<formula>>>` with `$$formula$$` or `$formula$`.
pub fn expand_formula_markup(text: &str) -> String {
    FORMULA_MARKUP
        .replace_all(text, |caps: &Captures| {
            let formula = caps[1].trim();
            if formula.is_empty() {
                String::new()
            } else if is_display_formula(formula) {
                format!("$${formula}$$")
            } else {
                format!("${formula}$")
            }
        })
        .into_owned()
}

fn is_display_formula(formula: &str) -> bool {
    let chars = formula.chars().count();
    DISPLAY_CONSTRUCTS.is_match(formula)
        || (formula.contains('=') && chars >= DISPLAY_EQUATION_MIN_CHARS)
        || formula.contains('\n')
        || chars >= DISPLAY_MIN_CHARS
}

/// Removes `assistant:` role prefixes at the start of the text and of every line.
pub fn strip_role_prefixes(text: &str) -> String {
    ROLE_PREFIX.replace_all(text, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Inline,
    Block,
}

impl Token {
    fn is_delimiter(&self) -> bool {
        !matches!(self, Token::Text(_))
    }

    fn ends_paragraph(&self) -> bool {
        matches!(self, Token::Text(text) if text.contains("\n\n"))
    }
}

/// Splits text into literal runs and `$`/`$$` delimiters. `\$` stays literal.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                current.push(ch);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '$' => {
                if !current.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut current)));
                }
                if chars.peek() == Some(&'$') {
                    chars.next();
                    tokens.push(Token::Block);
                } else {
                    tokens.push(Token::Inline);
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        tokens.push(Token::Text(current));
    }
    tokens
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Inline => out.push('$'),
            Token::Block => out.push_str("$$"),
        }
    }
    out
}

fn next_delimiter(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&index| tokens[index].is_delimiter())
}

fn next_block(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&index| tokens[index] == Token::Block)
}

/// Counts `$$` delimiters from `from` up to the next blank line.
fn blocks_in_paragraph(tokens: &[Token], from: usize) -> usize {
    tokens
        .get(from..)
        .unwrap_or_default()
        .iter()
        .take_while(|token| !token.ends_paragraph())
        .filter(|token| **token == Token::Block)
        .count()
}

/// `$$a$` becomes `$$a$$` and `$a$$` becomes `$a$`.
///
/// A delimiter is only rewritten when the `$$` delimiters left in its
/// paragraph cannot pair up without it, so `$$a$b$$` is left for the
/// nested-pair pass and `$5 ... $$y$$` keeps its display block.
fn repair_mismatched_pairs(tokens: &mut [Token]) {
    let mut index = 0;
    while index < tokens.len() {
        match tokens[index] {
            Token::Text(_) => index += 1,
            Token::Block => {
                let Some(close) = next_delimiter(tokens, index + 1) else {
                    break;
                };
                if tokens[close] == Token::Inline {
                    if blocks_in_paragraph(tokens, close + 1) % 2 == 1 {
                        index = next_block(tokens, close + 1).map_or(tokens.len(), |k| k + 1);
                        continue;
                    }
                    tokens[close] = Token::Block;
                }
                index = close + 1;
            }
            Token::Inline => {
                let Some(close) = next_delimiter(tokens, index + 1) else {
                    break;
                };
                if tokens[close] == Token::Block {
                    if blocks_in_paragraph(tokens, close + 1) % 2 == 1 {
                        // Stray `$`; the `$$` opens a real display block.
                        index = close;
                        continue;
                    }
                    tokens[close] = Token::Inline;
                }
                index = close + 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct PairScan {
    block_pairs: Vec<(usize, usize)>,
    nested_inline: Vec<usize>,
    unclosed: Option<usize>,
}

/// Pairs delimiters left to right; `$` inside an open `$$` is nested.
fn scan_pairs(tokens: &[Token]) -> PairScan {
    let mut scan = PairScan::default();
    // (index, is_block) of the delimiter currently waiting for its partner
    let mut open: Option<(usize, bool)> = None;

    for (index, token) in tokens.iter().enumerate() {
        let is_block = match token {
            Token::Text(_) => continue,
            Token::Block => true,
            Token::Inline => false,
        };
        match open {
            Some((start, true)) if is_block => {
                scan.block_pairs.push((start, index));
                open = None;
            }
            Some((_, true)) => scan.nested_inline.push(index),
            Some((_, false)) if !is_block => open = None,
            _ => open = Some((index, is_block)),
        }
    }

    scan.unclosed = match open {
        Some((index, true)) => Some(index),
        _ => None,
    };
    scan
}

/// Closes a `$$` that has no delimiter anywhere after it.
///
/// The closing pair goes right after the run of content that follows the
/// opener, ending at whitespace or sentence punctuation, or at the end of the
/// text when there is no such run.
fn close_dangling_block(tokens: &mut Vec<Token>) {
    let Some(opener) = scan_pairs(tokens).unclosed else {
        return;
    };
    if next_delimiter(tokens, opener + 1).is_some() {
        return;
    }

    let tail: String = tokens
        .drain(opener + 1..)
        .map(|token| match token {
            Token::Text(text) => text,
            _ => String::new(),
        })
        .collect();

    let mut split = match content_run_end(&tail) {
        0 => tail.len(),
        run_end => run_end,
    };
    // A closer written right after a lone `\` would read back as `\$`.
    if ends_with_lone_backslash(&tail[..split]) {
        split -= 1;
    }

    let (run, rest) = tail.split_at(split);
    if !run.is_empty() {
        tokens.push(Token::Text(run.to_string()));
    }
    tokens.push(Token::Block);
    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
}

/// Byte offset where the run of formula content starting at `text` ends.
/// Escape pairs such as `\,` belong to the run.
fn content_run_end(text: &str) -> usize {
    let mut chars = text.char_indices();
    while let Some((index, ch)) = chars.next() {
        if ch == '\\' {
            chars.next();
        } else if ch.is_whitespace() || matches!(ch, '.' | ',' | ';' | ':' | '!' | '?') {
            return index;
        }
    }
    text.len()
}

/// True when the final `\` of `text` has nothing left to escape.
fn ends_with_lone_backslash(text: &str) -> bool {
    let mut chars = text.chars();
    let mut lone = false;
    while let Some(ch) = chars.next() {
        lone = ch == '\\' && chars.next().is_none();
    }
    lone
}

/// `$$a$b$$` becomes `$$ab$$`.
fn collapse_nested_delimiters(tokens: Vec<Token>) -> Vec<Token> {
    let nested = scan_pairs(&tokens).nested_inline;
    if nested.is_empty() {
        return tokens;
    }
    tokens
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !nested.contains(index))
        .map(|(_, token)| token)
        .collect()
}

/// `$$x$$` becomes `$x$`.
fn demote_single_variable_blocks(mut tokens: Vec<Token>) -> Vec<Token> {
    for (open, close) in scan_pairs(&tokens).block_pairs {
        if close != open + 2 {
            continue;
        }
        let Token::Text(content) = &tokens[open + 1] else {
            continue;
        };
        let trimmed = content.trim();
        let mut chars = trimmed.chars();
        let variable = match (chars.next(), chars.next()) {
            (Some(ch), None) if ch.is_ascii_lowercase() => ch,
            _ => continue,
        };
        tokens[open] = Token::Inline;
        tokens[open + 1] = Token::Text(variable.to_string());
        tokens[close] = Token::Inline;
    }
    tokens
}

/// `$` followed directly by another delimiter would render as `$$`, so a
/// space keeps the two apart.
fn separate_inline_delimiters(tokens: Vec<Token>) -> Vec<Token> {
    let mut separated = Vec::with_capacity(tokens.len());
    let mut after_inline = false;
    for token in tokens {
        if after_inline && token.is_delimiter() {
            separated.push(Token::Text(" ".to_string()));
        }
        after_inline = token == Token::Inline;
        separated.push(token);
    }
    separated
}
