//! # Query DSL Parser
//!
//! Parses a compact query string into a [`QuerySpec`].
//!
//! Syntax (every clause optional, keywords case-insensitive):
//! ```text
//! SEARCH "cafe" WHERE status = active AND category IN (food, drink) AND rating >= 3
//!     ORDER BY rating DESC, name PAGE 0 SIZE 10
//! SEARCH cafe WHERE status = * SHOW 12
//! ```
//!
//! - `field = *` is the match-all filter; a quoted `"*"` is a literal value.
//! - `>=` and `<=` on the same field merge into one inclusive range.
//! - `PAGE` is zero-based. `SHOW n` reveals the first `n` matches instead.
//! - Input without any clause keyword is taken as bare search text.

use crate::spec::{Filter, PageSpec, QuerySpec, SortDirection, SortKey, SpecError, DEFAULT_PAGE_SIZE};
use crate::value::Value;
use std::collections::btree_map::Entry;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("clause {0} appears more than once")]
    DuplicateClause(&'static str),
    #[error("unexpected text before the first clause: '{0}'")]
    LeadingText(String),
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("cannot parse condition: '{0}'")]
    Condition(String),
    #[error("operator '{op}' is not supported in '{condition}' (use =, IN, >= or <=)")]
    UnsupportedOperator { op: String, condition: String },
    #[error("conflicting filters on '{0}'")]
    ConflictingFilter(String),
    #[error("invalid number for {clause}: '{value}'")]
    InvalidNumber { clause: &'static str, value: String },
    #[error("invalid sort key '{0}'")]
    InvalidSortKey(String),
    #[error("SHOW cannot be combined with PAGE or SIZE")]
    MixedPaging,
    #[error(transparent)]
    Spec(#[from] SpecError),
}

const KEYWORDS: [&str; 6] = ["SEARCH", "WHERE", "ORDER BY", "PAGE", "SIZE", "SHOW"];

/// Parse a raw query string into a validated [`QuerySpec`].
pub fn parse(input: &str) -> Result<QuerySpec, ParseError> {
    let input = input.trim();
    let clauses = split_clauses(input)?;

    if clauses.is_empty() {
        return Ok(QuerySpec::search(unquote(input)));
    }

    let mut spec = QuerySpec::default();
    let mut page: Option<usize> = None;
    let mut size: Option<usize> = None;
    let mut show: Option<usize> = None;

    for (keyword, body) in clauses {
        match keyword {
            "SEARCH" => spec.search = unquote(body).to_string(),
            "WHERE" => {
                for part in split_and(body) {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let (field, filter) = parse_condition(part)?;
                    add_filter(&mut spec, field, filter)?;
                }
            }
            "ORDER BY" => spec.sort = parse_order(body)?,
            "PAGE" => page = Some(parse_count(keyword, body)?),
            "SIZE" => size = Some(parse_count(keyword, body)?),
            "SHOW" => show = Some(parse_count(keyword, body)?),
            _ => unreachable!("keyword list and match arms disagree"),
        }
    }

    spec.page = match (show, page, size) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => return Err(ParseError::MixedPaging),
        (Some(visible_count), None, None) => PageSpec::Reveal { visible_count },
        (None, None, None) => PageSpec::default(),
        (None, index, size) => PageSpec::Indexed {
            index: index.unwrap_or(0),
            size: size.unwrap_or(DEFAULT_PAGE_SIZE),
        },
    };

    spec.validate()?;
    Ok(spec)
}

// =============================================================================
// Clause splitting
// =============================================================================

/// Split `input` into `(keyword, body)` pairs. Keywords inside quotes, and
/// keywords used as a field name (followed by an operator), are not clause
/// boundaries.
fn split_clauses(input: &str) -> Result<Vec<(&'static str, &str)>, ParseError> {
    let mut marks: Vec<(usize, &'static str)> = Vec::new();
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;

    for (i, c) in input.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None if opens_quote(prev, c) => quote = Some(c),
            None if prev.map_or(true, char::is_whitespace) => {
                if let Some(kw) = keyword_at(input, i) {
                    marks.push((i, kw));
                }
            }
            None => {}
        }
        prev = Some(c);
    }
    if quote.is_some() {
        return Err(ParseError::UnterminatedQuote);
    }
    let Some(&(first, _)) = marks.first() else {
        return Ok(Vec::new());
    };

    let leading = input[..first].trim();
    if !leading.is_empty() {
        return Err(ParseError::LeadingText(leading.to_string()));
    }

    let mut clauses = Vec::with_capacity(marks.len());
    for (n, &(start, kw)) in marks.iter().enumerate() {
        if clauses.iter().any(|(seen, _)| *seen == kw) {
            return Err(ParseError::DuplicateClause(kw));
        }
        let end = marks.get(n + 1).map_or(input.len(), |&(next, _)| next);
        clauses.push((kw, input[start + kw.len()..end].trim()));
    }
    Ok(clauses)
}

/// Quotes open a literal only at the start of a token, so the apostrophe in
/// `Joe's` is plain text.
fn opens_quote(prev: Option<char>, c: char) -> bool {
    matches!(c, '"' | '\'')
        && prev.map_or(true, |p| {
            p.is_whitespace() || matches!(p, '(' | ',' | '=' | '<' | '>')
        })
}

fn keyword_at(input: &str, pos: usize) -> Option<&'static str> {
    let rest = &input[pos..];
    KEYWORDS.iter().copied().find(|kw| {
        let Some(head) = rest.get(..kw.len()) else {
            return false;
        };
        if !head.eq_ignore_ascii_case(kw) {
            return false;
        }
        let after = &rest[kw.len()..];
        if !after.chars().next().map_or(true, char::is_whitespace) {
            return false;
        }
        // `size = large` names a field, it does not start a SIZE clause.
        let next = after.trim_start();
        !(next.starts_with(['=', '>', '<', '!']) || starts_with_word(next, "IN"))
    })
}

fn starts_with_word(s: &str, word: &str) -> bool {
    s.get(..word.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(word))
        && s[word.len()..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '(')
}

/// Split on `AND` outside quotes and parentheses.
fn split_and(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut prev: Option<char> = None;
    let mut last = 0;
    let mut skip_to = 0;

    for (i, c) in s.char_indices() {
        if i < skip_to {
            continue;
        }
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                _ if opens_quote(prev, c) => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if prev.is_some_and(char::is_whitespace)
                    && depth == 0
                    && starts_with_and(&s[i..]) =>
                {
                    parts.push(&s[last..i]);
                    last = i + 3;
                    skip_to = last;
                }
                _ => {}
            },
        }
        prev = Some(c);
    }
    parts.push(&s[last..]);
    parts
}

fn starts_with_and(s: &str) -> bool {
    s.get(..3).is_some_and(|head| head.eq_ignore_ascii_case("AND"))
        && s[3..].chars().next().is_some_and(char::is_whitespace)
}

// =============================================================================
// Conditions
// =============================================================================

fn parse_condition(part: &str) -> Result<(String, Filter), ParseError> {
    let (pos, op) =
        find_operator(part).ok_or_else(|| ParseError::Condition(part.to_string()))?;

    let field = unquote(part[..pos].trim()).to_string();
    let rest = part[pos + op.len()..].trim();
    if field.is_empty() || rest.is_empty() {
        return Err(ParseError::Condition(part.to_string()));
    }

    let filter = match op {
        "=" if rest == "*" => Filter::All,
        "=" => Filter::Eq(parse_value(rest)),
        "IN" => {
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| ParseError::Condition(part.to_string()))?;
            let values = split_commas(inner)
                .into_iter()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(parse_value)
                .collect();
            Filter::AnyOf(values)
        }
        ">=" => Filter::Range {
            min: Some(parse_value(rest)),
            max: None,
        },
        "<=" => Filter::Range {
            min: None,
            max: Some(parse_value(rest)),
        },
        other => {
            return Err(ParseError::UnsupportedOperator {
                op: other.to_string(),
                condition: part.to_string(),
            })
        }
    };
    Ok((field, filter))
}

/// First comparison operator outside quotes.
fn find_operator(part: &str) -> Option<(usize, &'static str)> {
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;

    for (i, c) in part.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            prev = Some(c);
            continue;
        }
        let rest = &part[i..];
        let found = match c {
            _ if opens_quote(prev, c) => {
                quote = Some(c);
                None
            }
            '>' | '<' | '!' if rest[1..].starts_with('=') => Some(match c {
                '>' => ">=",
                '<' => "<=",
                _ => "!=",
            }),
            '>' => Some(">"),
            '<' => Some("<"),
            '=' => Some("="),
            _ if prev.is_some_and(char::is_whitespace) && starts_with_word(rest, "IN") => {
                Some("IN")
            }
            _ => None,
        };
        if let Some(op) = found {
            return Some((i, op));
        }
        prev = Some(c);
    }
    None
}

fn add_filter(spec: &mut QuerySpec, field: String, filter: Filter) -> Result<(), ParseError> {
    match spec.filters.entry(field) {
        Entry::Vacant(slot) => {
            slot.insert(filter);
            Ok(())
        }
        Entry::Occupied(mut slot) => {
            let merged = match (slot.get(), &filter) {
                (
                    Filter::Range { min: Some(lo), max: None },
                    Filter::Range { min: None, max: Some(hi) },
                )
                | (
                    Filter::Range { min: None, max: Some(hi) },
                    Filter::Range { min: Some(lo), max: None },
                ) => Filter::Range {
                    min: Some(lo.clone()),
                    max: Some(hi.clone()),
                },
                _ => return Err(ParseError::ConflictingFilter(slot.key().clone())),
            };
            slot.insert(merged);
            Ok(())
        }
    }
}

fn split_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;
    let mut last = 0;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if opens_quote(prev, c) => quote = Some(c),
            None if c == ',' => {
                parts.push(&s[last..i]);
                last = i + 1;
            }
            None => {}
        }
        prev = Some(c);
    }
    parts.push(&s[last..]);
    parts
}

// =============================================================================
// ORDER BY / paging
// =============================================================================

fn parse_order(body: &str) -> Result<Vec<SortKey>, ParseError> {
    split_commas(body)
        .into_iter()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|key| {
            let mut tokens = key.split_whitespace();
            let field = tokens.next().map(unquote).unwrap_or_default();
            let direction = match tokens.next() {
                None => SortDirection::Asc,
                Some(d) if d.eq_ignore_ascii_case("ASC") => SortDirection::Asc,
                Some(d) if d.eq_ignore_ascii_case("DESC") => SortDirection::Desc,
                Some(_) => return Err(ParseError::InvalidSortKey(key.to_string())),
            };
            if tokens.next().is_some() {
                return Err(ParseError::InvalidSortKey(key.to_string()));
            }
            Ok(SortKey {
                field: field.to_string(),
                direction,
            })
        })
        .collect()
}

fn parse_count(clause: &'static str, body: &str) -> Result<usize, ParseError> {
    body.parse::<usize>().map_err(|_| ParseError::InvalidNumber {
        clause,
        value: body.to_string(),
    })
}

// =============================================================================
// Values
// =============================================================================

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Quoted values are always text; bare values are read as numbers or
/// booleans when they look like one.
fn parse_value(s: &str) -> Value {
    let unquoted = unquote(s);
    if unquoted.len() != s.len() {
        return Value::Text(unquoted.to_string());
    }
    let numeric = s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if let Ok(n) = s.parse::<i64>() {
        Value::Number(n as f64)
    } else if let Some(n) = numeric.then(|| s.parse::<f64>().ok()).flatten() {
        Value::Number(n)
    } else if s == "true" {
        Value::Bool(true)
    } else if s == "false" {
        Value::Bool(false)
    } else {
        Value::Text(s.to_string())
    }
}
