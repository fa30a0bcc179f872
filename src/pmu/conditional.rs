//! Rewriting of `a if cond else b` formulas into the `cond ? a : b` form understood by
//! [`MetricExpr`](super::MetricExpr).

use crate::{Error, Result};

/// Lexical token of a formula, spanning `start..end` of the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Open,
    Close,
    If,
    Else,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: Kind,
    start: usize,
    end: usize,
}

/// Split `input` into parentheses, `if`/`else` keywords and other text.
///
/// Bracketed variables are single tokens, so keywords and parentheses inside them are ignored.
fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = vec![];
    let mut chars = input.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let kind = match c {
            '(' => Some(Kind::Open),
            ')' => Some(Kind::Close),
            _ => None,
        };
        if let Some(kind) = kind {
            chars.next();
            tokens.push(Token {
                kind,
                start,
                end: start + 1,
            });
            continue;
        }
        let mut end = start;
        let mut in_brackets = false;
        while let Some(&(i, c)) = chars.peek() {
            if !in_brackets && (c.is_whitespace() || c == '(' || c == ')') {
                break;
            }
            match c {
                '[' => in_brackets = true,
                ']' => in_brackets = false,
                _ => {}
            }
            end = i + c.len_utf8();
            chars.next();
        }
        let kind = match &input[start..end] {
            "if" => Kind::If,
            "else" => Kind::Else,
            _ => Kind::Text,
        };
        tokens.push(Token { kind, start, end });
    }
    tokens
}

/// Join formula pieces with single spaces, skipping empty ones and hugging parentheses.
fn join(pieces: &[&str]) -> String {
    let mut out = String::new();
    for piece in pieces.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if !out.is_empty() && !out.ends_with('(') && !piece.starts_with(')') {
            out.push(' ');
        }
        out.push_str(piece);
    }
    out
}

/// Rewrite the leftmost `if`/`else` of `input`.
fn rewrite_first(input: &str) -> Result<String> {
    let tokens = tokenize(input);
    let if_idx = match tokens.iter().position(|t| t.kind == Kind::If) {
        Some(i) => i,
        None => return Ok(input.to_string()),
    };

    // The true branch starts after the innermost unclosed '(' to the left.
    let mut balance = 0i32;
    let mut expr1_start = 0;
    for t in tokens[..if_idx].iter().rev() {
        match t.kind {
            Kind::Close => balance += 1,
            Kind::Open => balance -= 1,
            _ => continue,
        }
        if balance < 0 {
            expr1_start = t.end;
            break;
        }
    }

    // The condition runs up to the `else` at the same nesting level.
    let mut balance = 0i32;
    let mut else_idx = None;
    for (i, t) in tokens.iter().enumerate().skip(if_idx + 1) {
        match t.kind {
            Kind::Open => balance += 1,
            Kind::Close => balance -= 1,
            Kind::Else if balance == 0 => {
                else_idx = Some(i);
                break;
            }
            _ => {}
        }
        if balance < 0 {
            break;
        }
    }
    let else_idx = else_idx.ok_or_else(|| Error::Conditional(format!("if without else: {}", input)))?;

    // The false branch ends before the first ')' closing an enclosing group.
    let mut balance = 0i32;
    let mut expr2_end = input.len();
    for t in &tokens[else_idx + 1..] {
        match t.kind {
            Kind::Open => balance += 1,
            Kind::Close => balance -= 1,
            _ => continue,
        }
        if balance < 0 {
            expr2_end = t.start;
            break;
        }
    }

    let expr0 = &input[..expr1_start];
    let expr1 = &input[expr1_start..tokens[if_idx].start];
    let cond = &input[tokens[if_idx].end..tokens[else_idx].start];
    let expr2 = &input[tokens[else_idx].end..expr2_end];
    let expr3 = &input[expr2_end..];
    if expr1.trim().is_empty() || cond.trim().is_empty() || expr2.trim().is_empty() {
        return Err(Error::Conditional(format!("missing operand: {}", input)));
    }
    Ok(join(&[expr0, cond, "?", expr1, ":", expr2, expr3]))
}

/// Rewrite every `<expr1> if <cond> else <expr2>` of `input` into `<cond> ? <expr1> : <expr2>`.
///
/// Occurrences are rewritten left to right, one per `if` keyword in the original text.
pub fn rewrite_conditionals(input: &str) -> Result<String> {
    let count = tokenize(input)
        .iter()
        .filter(|t| t.kind == Kind::If)
        .count();
    let mut out = input.to_string();
    for _ in 0..count {
        out = rewrite_first(&out)?;
    }
    Ok(out)
}

/// Normalise spaced comparison operators and single-character logical operators.
pub fn normalize_operators(input: &str) -> String {
    input
        .replace("> =", ">=")
        .replace("< =", "<=")
        .replace(" & ", " && ")
        .replace(" | ", " || ")
}

/// Full textual transformation applied to metric and threshold formulas.
pub fn transform_expression(input: &str) -> Result<String> {
    Ok(normalize_operators(&rewrite_conditionals(input)?))
}
