//! S-expression reader.
//!
//! ```text
//! ; comment to end of line
//! (define xs = '(1 2 . 3))   ; 'x is (quote x), a dotted tail ends a list
//! (echo @xs)                 ; @x is (splice x)
//! (obj::method "a\tb")       ; a::b is the member pair (a . b)
//! #t #f                      ; booleans
//! %scope 12%                 ; handle of a live opaque value
//! ```
//!
//! Every other token, numbers included, reads as a symbol. Numbers take
//! their value when arithmetic asks for it.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, satisfy},
    combinator::{not, value},
    error::ErrorKind,
    sequence::terminated,
};

use crate::cell::Cell;
use crate::handle;
use crate::{MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

fn is_token_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '\'' | '"' | ';')
}

/// An error no other alternative can recover from.
fn fail<T>(input: &str, kind: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Failure(nom::error::Error::new(input, kind)))
}

/// Once a form's opening character is consumed, its errors are final.
fn commit<T>(result: IResult<&str, T>) -> IResult<&str, T> {
    result.map_err(|error| match error {
        nom::Err::Error(e) => nom::Err::Failure(e),
        other => other,
    })
}

/// Skips whitespace and comments.
fn blank(input: &str) -> &str {
    let mut rest = input.trim_start();
    while let Some(comment) = rest.strip_prefix(';') {
        rest = comment
            .find('\n')
            .map_or("", |end| &comment[end..])
            .trim_start();
    }
    rest
}

fn parse_bool(input: &str) -> IResult<&str, Cell> {
    terminated(
        alt((
            value(Cell::boolean(true), tag("#t")),
            value(Cell::boolean(false), tag("#f")),
        )),
        not(satisfy(is_token_char)),
    )
    .parse(input)
}

/// `%tag token%`, resolved against the handle table.
fn parse_handle(input: &str) -> IResult<&str, Cell> {
    let (rest, _) = char('%').parse(input)?;
    let (rest, name) = take_while1(|c: char| c.is_ascii_lowercase()).parse(rest)?;
    let (rest, _) = char(' ').parse(rest)?;
    let (rest, token) = digit1.parse(rest)?;
    let (rest, _) = char('%').parse(rest)?;
    match token.parse().ok().and_then(|token| handle::deref(name, token)) {
        Some(cell) => Ok((rest, cell)),
        None => Err(nom::Err::Failure(nom::error::Error::new(input, ErrorKind::Verify))),
    }
}

/// Symbols, with `a::b::c` read as nested member pairs.
fn parse_atom(input: &str) -> IResult<&str, Cell> {
    let (rest, token) = take_while1(is_token_char).parse(input)?;
    if token.contains("::") && token.split("::").all(|part| !part.is_empty()) {
        let mut parts = token.split("::");
        let first = Cell::symbol(parts.next().unwrap_or_default());
        let member = parts.fold(first, |object, name| Cell::cons(object, Cell::symbol(name)));
        return Ok((rest, member));
    }
    Ok((rest, Cell::symbol(token)))
}

fn parse_string(input: &str) -> IResult<&str, Cell> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut text = String::new();

    loop {
        let mut chars = remaining.chars();
        match chars.next() {
            Some('"') => return Ok((chars.as_str(), Cell::string(&text))),
            Some('\\') => {
                match chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(_) => return fail(remaining, ErrorKind::Escaped),
                    None => return fail(chars.as_str(), ErrorKind::Eof),
                }
                remaining = chars.as_str();
            }
            Some(ch) => {
                text.push(ch);
                remaining = chars.as_str();
            }
            None => return fail(remaining, ErrorKind::Eof),
        }
    }
}

fn is_dot(input: &str) -> bool {
    input
        .strip_prefix('.')
        .is_some_and(|rest| rest.chars().next().is_none_or(|c| !is_token_char(c)))
}

fn parse_list(input: &str, depth: usize) -> IResult<&str, Cell> {
    let (mut input, _) = char('(').parse(input)?;
    if depth + 1 >= MAX_PARSE_DEPTH {
        return fail(input, ErrorKind::TooLarge);
    }
    let mut items = Vec::new();
    let mut tail = Cell::null();

    loop {
        let rest = blank(input);
        if let Some(rest) = rest.strip_prefix(')') {
            input = rest;
            break;
        }
        if is_dot(rest) && !items.is_empty() {
            let (rest, last) = commit(parse_sexpr(&rest[1..], depth + 1))?;
            let (rest, _) = commit(char(')').parse(blank(rest)))?;
            tail = last;
            input = rest;
            break;
        }
        if rest.is_empty() {
            return fail(rest, ErrorKind::Eof);
        }
        let (rest, item) = commit(parse_sexpr(rest, depth + 1))?;
        items.push(item);
        input = rest;
    }

    let list = items
        .into_iter()
        .rev()
        .fold(tail, |tail, item| Cell::cons(item, tail));
    Ok((input, list))
}

/// `'x` and `@x`.
fn parse_prefixed(input: &str, depth: usize) -> IResult<&str, Cell> {
    let (rest, prefix) = alt((char('\''), char('@'))).parse(input)?;
    let (rest, expr) = commit(parse_sexpr(rest, depth + 1))?;
    let form = if prefix == '\'' { "quote" } else { "splice" };
    Ok((rest, Cell::list(vec![Cell::symbol(form), expr])))
}

fn parse_sexpr(input: &str, depth: usize) -> IResult<&str, Cell> {
    if depth >= MAX_PARSE_DEPTH {
        return fail(input, ErrorKind::TooLarge);
    }
    let input = blank(input);
    if input.is_empty() {
        return fail(input, ErrorKind::Eof);
    }
    alt((
        |input| parse_prefixed(input, depth),
        |input| parse_list(input, depth),
        parse_string,
        parse_bool,
        parse_handle,
        parse_atom,
    ))
    .parse(input)
}

fn line_of(text: &str, offset: usize) -> usize {
    1 + text[..offset].matches('\n').count()
}

fn to_parse_error(text: &str, error: nom::Err<nom::error::Error<&str>>, line: usize) -> ParseError {
    let (position, code) = match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => (text.len() - e.input.len(), e.code),
        nom::Err::Incomplete(_) => (text.len(), ErrorKind::Eof),
    };
    let (kind, message) = match code {
        ErrorKind::TooLarge => (
            ParseErrorKind::TooDeeplyNested,
            format!("expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
        ),
        ErrorKind::Verify => (
            ParseErrorKind::StaleHandle,
            "handle names no live value".to_string(),
        ),
        ErrorKind::Eof => (ParseErrorKind::Incomplete, "unexpected end of input".to_string()),
        ErrorKind::Escaped => (
            ParseErrorKind::InvalidSyntax,
            "unknown escape sequence".to_string(),
        ),
        _ if text[position..].starts_with(')') => {
            (ParseErrorKind::InvalidSyntax, "unexpected ')'".to_string())
        }
        _ => (ParseErrorKind::InvalidSyntax, "invalid syntax".to_string()),
    };
    ParseError::new(kind, message, line).with_context(text, position)
}

/// Reads top-level forms from `text`, handing each to `sink` together with
/// the line it starts on. Stops early when `sink` returns `false`.
pub fn parse(text: &str, mut sink: impl FnMut(Cell, usize) -> bool) -> Result<(), ParseError> {
    let mut rest = text;
    loop {
        rest = blank(rest);
        if rest.is_empty() {
            return Ok(());
        }
        let line = line_of(text, text.len() - rest.len());
        if rest.starts_with(')') {
            let offset = text.len() - rest.len();
            return Err(ParseError::new(ParseErrorKind::InvalidSyntax, "unexpected ')'", line)
                .with_context(text, offset));
        }
        match parse_sexpr(rest, 0) {
            Ok((next, form)) => {
                if !sink(form, line) {
                    return Ok(());
                }
                rest = next;
            }
            Err(error) => return Err(to_parse_error(text, error, line)),
        }
    }
}

/// Every top-level form with its starting line.
pub fn parse_all(text: &str) -> Result<Vec<(Cell, usize)>, ParseError> {
    let mut forms = Vec::new();
    parse(text, |form, line| {
        forms.push((form, line));
        true
    })?;
    Ok(forms)
}

/// Exactly one form.
pub fn parse_one(text: &str) -> Result<Cell, ParseError> {
    let mut forms = parse_all(text)?;
    match forms.len() {
        1 => Ok(forms.remove(0).0),
        0 => Err(ParseError::new(ParseErrorKind::Incomplete, "no expression", 1)),
        _ => Err(ParseError::new(
            ParseErrorKind::InvalidSyntax,
            "expected a single expression",
            forms[1].1,
        )),
    }
}
