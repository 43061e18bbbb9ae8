//! Shell-style splitting of string-form `command` entries.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_till, take_till1},
    character::complete::{anychar, char, multispace0, multispace1},
    combinator::map,
    multi::{fold_many1, separated_list0},
    sequence::{delimited, preceded},
};

fn single_quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('\''), take_till(|c| c == '\''), char('\'')),
        String::from,
    )
    .parse(input)
}

/// Double quotes keep whitespace; a backslash escapes `"`, `\`, `$` and `` ` ``.
fn double_quoted(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"').parse(input)?;
    let mut result = String::new();
    let mut chars = input.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((&input[idx + 1..], result)),
            '\\' => match chars.peek() {
                Some(&(_, next @ ('"' | '\\' | '$' | '`'))) => {
                    result.push(next);
                    let _ = chars.next();
                }
                _ => result.push('\\'),
            },
            c => result.push(c),
        }
    }
    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn escaped_char(input: &str) -> IResult<&str, String> {
    map(preceded(char('\\'), anychar), String::from).parse(input)
}

fn bare(input: &str) -> IResult<&str, String> {
    map(
        take_till1(|c: char| c.is_whitespace() || matches!(c, '\'' | '"' | '\\')),
        String::from,
    )
    .parse(input)
}

fn word(input: &str) -> IResult<&str, String> {
    fold_many1(
        alt((single_quoted, double_quoted, escaped_char, bare)),
        String::new,
        |mut acc, part| {
            acc.push_str(&part);
            acc
        },
    )
    .parse(input)
}

/// Splits `input` into words the way a POSIX shell would, without
/// performing any expansion.
///
/// # Errors
///
/// Returns a message if a quote is left unterminated.
pub fn split(input: &str) -> Result<Vec<String>, String> {
    let (rest, words) = delimited(multispace0, separated_list0(multispace1, word), multispace0)
        .parse(input)
        .map_err(|e| format!("invalid command \"{input}\": {e}"))?;
    if rest.is_empty() {
        Ok(words)
    } else {
        Err(format!("invalid command \"{input}\": unterminated quote"))
    }
}
