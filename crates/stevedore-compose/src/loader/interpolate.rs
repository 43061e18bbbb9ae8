//! Variable interpolation in compose files, parsed with `nom`.
//!
//! Supports `$VAR`, `${VAR}`, the default/required/alternate operators
//! (`:-`, `-`, `:?`, `?`, `:+`, `+`) and the `$$` escape. Operator words
//! may themselves contain interpolations.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till1, take_while, take_while1},
    character::complete::char,
    combinator::{cut, map, opt, recognize, value},
    sequence::{pair, preceded},
};

/// A piece of an interpolated string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    /// Text copied verbatim.
    Literal(&'a str),
    /// `$$`, producing a single `$`.
    Escaped,
    /// `$NAME` or `${NAME}`.
    Variable(&'a str),
    /// `${NAME<op>word}`.
    Substitution {
        name: &'a str,
        operator: Operator,
        word: &'a str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// `:-`
    DefaultIfUnsetOrEmpty,
    /// `-`
    DefaultIfUnset,
    /// `:?`
    RequiredNonEmpty,
    /// `?`
    Required,
    /// `:+`
    AlternateIfNonEmpty,
    /// `+`
    AlternateIfSet,
}

fn literal(input: &str) -> IResult<&str, Segment<'_>> {
    map(take_till1(|c| c == '$'), Segment::Literal).parse(input)
}

fn escaped(input: &str) -> IResult<&str, Segment<'_>> {
    value(Segment::Escaped, tag("$$")).parse(input)
}

fn variable_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn bare_variable(input: &str) -> IResult<&str, Segment<'_>> {
    map(preceded(char('$'), variable_name), Segment::Variable).parse(input)
}

fn operator(input: &str) -> IResult<&str, Operator> {
    alt((
        value(Operator::DefaultIfUnsetOrEmpty, tag(":-")),
        value(Operator::RequiredNonEmpty, tag(":?")),
        value(Operator::AlternateIfNonEmpty, tag(":+")),
        value(Operator::DefaultIfUnset, tag("-")),
        value(Operator::Required, tag("?")),
        value(Operator::AlternateIfSet, tag("+")),
    ))
    .parse(input)
}

/// Consumes up to the `}` closing the current substitution, skipping
/// nested `${...}` groups.
fn operator_word(input: &str) -> IResult<&str, &str> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' if depth == 0 => return Ok((&input[i..], &input[..i])),
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn braced(input: &str) -> IResult<&str, Segment<'_>> {
    let (input, _) = tag("${").parse(input)?;
    let (input, name) = cut(variable_name).parse(input)?;
    let (input, op) = opt(operator).parse(input)?;
    let (input, segment) = match op {
        Some(operator) => {
            let (input, word) = operator_word(input)?;
            (
                input,
                Segment::Substitution {
                    name,
                    operator,
                    word,
                },
            )
        }
        None => (input, Segment::Variable(name)),
    };
    let (input, _) = cut(char('}')).parse(input)?;
    Ok((input, segment))
}

fn lone_dollar(input: &str) -> IResult<&str, Segment<'_>> {
    value(Segment::Literal("$"), char('$')).parse(input)
}

fn segment(input: &str) -> IResult<&str, Segment<'_>> {
    alt((literal, escaped, braced, bare_variable, lone_dollar)).parse(input)
}

/// Replaces every variable reference in `input` using `lookup`.
///
/// Unset variables without an operator expand to the empty string.
///
/// # Errors
///
/// Returns a message if the template is malformed or a required variable
/// (`:?` / `?`) is missing.
pub fn interpolate<F>(input: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut remaining = input;

    while !remaining.is_empty() {
        let (rest, seg) = segment(remaining)
            .map_err(|e| format!("invalid interpolation format for \"{input}\": {e}"))?;
        match seg {
            Segment::Literal(text) => out.push_str(text),
            Segment::Escaped => out.push('$'),
            Segment::Variable(name) => {
                if let Some(val) = lookup(name) {
                    out.push_str(&val);
                } else {
                    tracing::warn!(
                        variable = name,
                        "variable is not set, defaulting to a blank string"
                    );
                }
            }
            Segment::Substitution {
                name,
                operator,
                word,
            } => out.push_str(&substitute(name, operator, word, lookup)?),
        }
        remaining = rest;
    }

    Ok(out)
}

fn substitute<F>(name: &str, operator: Operator, word: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let current = lookup(name);
    let non_empty = current.as_deref().is_some_and(|v| !v.is_empty());
    match operator {
        Operator::DefaultIfUnsetOrEmpty if !non_empty => interpolate(word, lookup),
        Operator::DefaultIfUnset if current.is_none() => interpolate(word, lookup),
        Operator::RequiredNonEmpty if !non_empty => Err(required_message(name, word, lookup)?),
        Operator::Required if current.is_none() => Err(required_message(name, word, lookup)?),
        Operator::AlternateIfNonEmpty => {
            if non_empty {
                interpolate(word, lookup)
            } else {
                Ok(String::new())
            }
        }
        Operator::AlternateIfSet => {
            if current.is_some() {
                interpolate(word, lookup)
            } else {
                Ok(String::new())
            }
        }
        _ => Ok(current.unwrap_or_default()),
    }
}

fn required_message<F>(name: &str, word: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let detail = interpolate(word, lookup)?;
    if detail.is_empty() {
        Ok(format!("required variable {name} is missing a value"))
    } else {
        Ok(format!("required variable {name} is missing a value: {detail}"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env() -> HashMap<&'static str, &'static str> {
        HashMap::from([("TAG", "15"), ("EMPTY", ""), ("PORT", "8080")])
    }

    fn run(input: &str) -> Result<String, String> {
        let env = env();
        interpolate(input, &|name: &str| env.get(name).map(ToString::to_string))
    }

    #[test]
    fn plain_text_is_unchanged() {
        assert_eq!(run("postgres:latest").expect("ok"), "postgres:latest");
    }

    #[test]
    fn bare_and_braced_variables() {
        assert_eq!(run("postgres:$TAG").expect("ok"), "postgres:15");
        assert_eq!(run("${PORT}:80").expect("ok"), "8080:80");
    }

    #[test]
    fn unset_variable_is_blank() {
        assert_eq!(run("a${MISSING}b").expect("ok"), "ab");
    }

    #[test]
    fn escaped_dollar() {
        assert_eq!(run("echo $$HOME").expect("ok"), "echo $HOME");
    }

    #[test]
    fn default_operators_distinguish_empty_from_unset() {
        assert_eq!(run("${EMPTY:-x}").expect("ok"), "x");
        assert_eq!(run("${EMPTY-x}").expect("ok"), "");
        assert_eq!(run("${MISSING-x}").expect("ok"), "x");
        assert_eq!(run("${TAG:-x}").expect("ok"), "15");
    }

    #[test]
    fn nested_default() {
        assert_eq!(run("${MISSING:-${PORT}}").expect("ok"), "8080");
        assert_eq!(run("${MISSING:-${OTHER:-9090}}").expect("ok"), "9090");
    }

    #[test]
    fn required_variable_errors() {
        let err = run("${MISSING:?set MISSING first}").unwrap_err();
        assert!(err.contains("MISSING"), "got: {err}");
        assert!(err.contains("set MISSING first"), "got: {err}");
        assert!(run("${EMPTY?}").is_ok());
        assert!(run("${EMPTY:?}").is_err());
    }

    #[test]
    fn alternate_operators() {
        assert_eq!(run("${TAG:+on}").expect("ok"), "on");
        assert_eq!(run("${EMPTY:+on}").expect("ok"), "");
        assert_eq!(run("${EMPTY+on}").expect("ok"), "on");
        assert_eq!(run("${MISSING+on}").expect("ok"), "");
    }

    #[test]
    fn trailing_dollar_is_literal() {
        assert_eq!(run("cost: 5$").expect("ok"), "cost: 5$");
    }

    #[test]
    fn unterminated_brace_is_an_error() {
        assert!(run("${TAG").is_err());
        assert!(run("${1BAD}").is_err());
    }
}
