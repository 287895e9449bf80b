//! Command-string parsing.
//!
//! Every queue carries commands as strings of the form `method(arg, ...)`
//! so they can be logged verbatim into the events dataset. This module
//! turns such a string into a method name and a list of typed arguments.

use super::Value;
use crate::error::{AppResult, DaqError};

/// A parsed command, ready to hand to `Driver::call`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: String,
    pub args: Vec<Value>,
}

fn valid_method_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true)
}

/// Split an argument list at top-level commas, honouring quotes and
/// nested brackets.
fn split_args(text: &str) -> AppResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' | '[' | '{' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' | '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(DaqError::Command(format!("unbalanced brackets: {text:?}")));
                    }
                    current.push(c);
                }
                ',' if depth == 0 => {
                    parts.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() || depth != 0 {
        return Err(DaqError::Command(format!("unterminated argument: {text:?}")));
    }
    let tail = current.trim();
    if tail.is_empty() {
        if !parts.is_empty() {
            return Err(DaqError::Command(format!("trailing comma in {text:?}")));
        }
    } else {
        parts.push(tail.to_string());
    }
    if parts.iter().any(String::is_empty) {
        return Err(DaqError::Command(format!("empty argument in {text:?}")));
    }
    Ok(parts)
}

fn parse_literal(text: &str) -> Value {
    match text {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        _ => {}
    }
    if (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
        || (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
    {
        return Value::Str(text[1..text.len() - 1].to_string());
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    // Bare words and bracketed expressions pass through as strings; the
    // driver decides what to make of them.
    Value::Str(text.to_string())
}

impl Command {
    /// Parse `method(arg, ...)`. A bare `method` (no parentheses) is a
    /// zero-argument call.
    pub fn parse(text: &str) -> AppResult<Self> {
        let text = text.trim();
        let (name, args) = match text.find('(') {
            None => (text, Vec::new()),
            Some(open) => {
                if !text.ends_with(')') {
                    return Err(DaqError::Command(format!(
                        "missing closing parenthesis: {text:?}"
                    )));
                }
                let inner = &text[open + 1..text.len() - 1];
                (&text[..open], split_args(inner)?)
            }
        };
        if !valid_method_name(name) {
            return Err(DaqError::Command(format!("invalid method name: {name:?}")));
        }
        Ok(Command {
            method: name.to_string(),
            args: args.iter().map(|a| parse_literal(a)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_literals() {
        let cmd = Command::parse("SetPoint(1, 2.5, 'abc', True)").unwrap();
        assert_eq!(cmd.method, "SetPoint");
        assert_eq!(
            cmd.args,
            vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Str("abc".into()),
                Value::Bool(true),
            ]
        );
    }

    #[test]
    fn zero_argument_forms() {
        assert_eq!(Command::parse("ReadValue()").unwrap().args, Vec::<Value>::new());
        assert_eq!(Command::parse("ReadValue").unwrap().method, "ReadValue");
    }

    #[test]
    fn quoted_commas_stay_in_one_argument() {
        let cmd = Command::parse("Configure('a, b', 3)").unwrap();
        assert_eq!(cmd.args[0], Value::Str("a, b".into()));
        assert_eq!(cmd.args[1], Value::Int(3));
    }

    #[test]
    fn nested_structures_pass_through() {
        let cmd = Command::parse("SetRamp([1, 2, 3])").unwrap();
        assert_eq!(cmd.args, vec![Value::Str("[1, 2, 3]".into())]);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(Command::parse("bad name()").is_err());
        assert!(Command::parse("1method()").is_err());
        assert!(Command::parse("f(1,)").is_err());
        assert!(Command::parse("f('open").is_err());
        assert!(Command::parse("f(1").is_err());
        assert!(Command::parse("f; drop()").is_err());
    }
}
