use super::token::Token;
use crate::error::{BuildError, Result};

fn whitespace(s: &str) -> (Option<Token>, usize) {
    let c = s.chars().next().unwrap();
    if matches!(c, ' ' | '\t') {
        (Some(Token::Whitespace), 1)
    } else {
        (None, 0)
    }
}

fn operator(s: &str) -> (Option<Token>, usize) {
    let c = s.chars().next().unwrap();
    match c {
        '=' => (Some(Token::Equal), 1),
        ',' => (Some(Token::Comma), 1),
        '(' => (Some(Token::LeftP), 1),
        ')' => (Some(Token::RightP), 1),
        '{' => (Some(Token::BlockStart), 1),
        '}' => (Some(Token::BlockEnd), 1),
        _ => (None, 0),
    }
}

fn string(s: &str) -> (Option<Token>, usize) {
    if !s.starts_with('"') {
        return (None, 0);
    }
    let mut bytes = vec![];
    let mut chars = s.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return (Some(Token::Str(bytes)), i + 1),
            '\\' => match chars.next() {
                Some((_, 'n')) => bytes.push(b'\n'),
                Some((_, 't')) => bytes.push(b'\t'),
                Some((_, '0')) => bytes.push(0),
                Some((_, '\\')) => bytes.push(b'\\'),
                Some((_, '"')) => bytes.push(b'"'),
                _ => return (None, 0),
            },
            c => bytes.extend(c.to_string().as_bytes()),
        }
    }
    // Unterminated string; let the caller report the line.
    (None, 0)
}

fn number(s: &str) -> (Option<Token>, usize) {
    let negative = s.starts_with('-');
    let body = if negative { &s[1..] } else { s };

    let (digits, radix, prefix) = if let Some(hex) = body.strip_prefix("0x") {
        (hex, 16, 2)
    } else {
        (body, 10, 0)
    };

    let mut i = 0;
    for c in digits.chars() {
        if !c.is_digit(radix) {
            break;
        }
        i += 1;
    }
    if i == 0 {
        return (None, 0);
    }

    match i64::from_str_radix(&digits[..i], radix) {
        Ok(value) => {
            let value = if negative { -value } else { value };
            let consumed = i + prefix + usize::from(negative);
            (Some(Token::Number(value)), consumed)
        }
        Err(_) => (None, 0),
    }
}

fn identifier(s: &str) -> (Option<Token>, usize) {
    let first = s.chars().next().unwrap();
    if !first.is_alphabetic() && first != '_' && first != '.' {
        return (None, 0);
    }
    // Byte offset of the first non-identifier char; identifiers may
    // contain multi-byte chars, so counting chars would split them.
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_alphanumeric() && !matches!(c, '_' | '.' | '$'))
        .map_or(s.len(), |(i, _)| i);
    (Some(Token::Ident(s[..end].to_string())), end)
}

type TokenFn = fn(&str) -> (Option<Token>, usize);

fn scan_token(s: &str) -> (Option<Token>, usize) {
    let scanners: &[TokenFn] = &[operator, string, number, identifier, whitespace];
    for scanner in scanners {
        let (token, advanced) = scanner(s);
        if token.is_some() {
            return (token, advanced);
        }
    }
    (None, 0)
}

/// Cuts a `;` comment, ignoring semicolons inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if in_string => escaped = !escaped,
            '"' if !escaped => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => escaped = false,
        }
    }
    line
}

/// Scans one source line. Comments start with `;` and run to end of line.
pub fn scan_line(line: &str, line_no: usize) -> Result<Vec<Token>> {
    let line = strip_comment(line);

    let mut tokens = vec![];
    let mut start = 0;
    while start < line.len() {
        let (token, advanced) = scan_token(&line[start..]);
        let Some(token) = token else {
            return Err(BuildError::Parse {
                line: line_no,
                message: format!("invalid lexeme at {:?}", &line[start..]),
            });
        };
        if token != Token::Whitespace {
            tokens.push(token);
        }
        start += advanced;
    }
    Ok(tokens)
}
