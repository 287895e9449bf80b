//! Sequence parameter expansion.
//!
//! A node's `parameters` string expands into the list of argument texts
//! its function is called with, one step per entry. A small set of
//! generator forms is recognised; anything else is comma-split into
//! literal values. `$N`, `$devN` and `$fnN` placeholders are substituted
//! from the ancestor chain before expansion.

use crate::error::{AppResult, DaqError};

/// Ancestor context available to substitutions, outermost first.
#[derive(Debug, Clone)]
pub struct Ancestor {
    pub device: String,
    pub function: String,
    pub parameter: String,
}

/// Render a float the way the step text expects it.
fn fmt(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn parse_f64(text: &str) -> AppResult<f64> {
    text.trim()
        .parse()
        .map_err(|_| DaqError::Sequencer(format!("not a number: {text:?}")))
}

fn parse_usize(text: &str) -> AppResult<usize> {
    text.trim()
        .parse()
        .map_err(|_| DaqError::Sequencer(format!("not a count: {text:?}")))
}

/// Split at top-level commas, honouring brackets and quotes.
fn split_top(text: &str) -> Vec<String> {
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
    let tail = current.trim();
    if !tail.is_empty() {
        parts.push(tail.to_string());
    }
    parts
}

/// Extract `inner` from `head(inner)`; `None` when `text` is not that call.
fn call_body<'a>(text: &'a str, head: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(head)?.trim_start();
    let rest = rest.strip_prefix('(')?;
    rest.strip_suffix(')')
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Substitute ancestor placeholders. `$devN`/`$fnN`/`$N` refer to the
/// N-th ancestor (1-based, outermost first).
pub fn substitute(text: &str, ancestors: &[Ancestor]) -> String {
    let mut out = text.to_string();
    // longest markers first so `$dev1` is not eaten by `$1`
    for (i, a) in ancestors.iter().enumerate() {
        let n = i + 1;
        out = out.replace(&format!("$dev{n}"), &a.device);
        out = out.replace(&format!("$fn{n}"), &a.function);
    }
    for (i, a) in ancestors.iter().enumerate() {
        let n = i + 1;
        out = out.replace(&format!("${n}"), &a.parameter);
    }
    out
}

/// Expand a parameters string into the list of argument texts.
pub fn expand(parameters: &str, parent_info: &[String]) -> AppResult<Vec<String>> {
    let text = parameters.trim();
    if text.is_empty() {
        return Ok(vec![String::new()]);
    }
    if let Some(rest) = text.strip_prefix("args:") {
        return Ok(vec![rest.trim().to_string()]);
    }
    if text == "parent_info" || text == "parent_info()" {
        return Ok(vec![format!("'{}'", parent_info.join("; "))]);
    }
    if let Some(body) = call_body(text, "linspace") {
        let args = split_top(body);
        if args.len() != 3 {
            return Err(DaqError::Sequencer(format!("linspace takes 3 args: {text:?}")));
        }
        let (a, b) = (parse_f64(&args[0])?, parse_f64(&args[1])?);
        let n = parse_usize(&args[2])?;
        return Ok(linspace(a, b, n).into_iter().map(fmt).collect());
    }
    if let Some(body) = call_body(text, "logspace") {
        let args = split_top(body);
        if args.len() != 3 {
            return Err(DaqError::Sequencer(format!("logspace takes 3 args: {text:?}")));
        }
        let (a, b) = (parse_f64(&args[0])?, parse_f64(&args[1])?);
        let n = parse_usize(&args[2])?;
        return Ok(linspace(a, b, n)
            .into_iter()
            .map(|e| fmt(10f64.powf(e)))
            .collect());
    }
    if let Some(body) = call_body(text, "range") {
        let args: Vec<i64> = split_top(body)
            .iter()
            .map(|a| {
                a.trim()
                    .parse()
                    .map_err(|_| DaqError::Sequencer(format!("range takes integers: {text:?}")))
            })
            .collect::<AppResult<_>>()?;
        let (start, stop, step) = match args.as_slice() {
            [stop] => (0, *stop, 1),
            [start, stop] => (*start, *stop, 1),
            [start, stop, step] if *step != 0 => (*start, *stop, *step),
            _ => return Err(DaqError::Sequencer(format!("bad range: {text:?}"))),
        };
        let mut out = Vec::new();
        let mut v = start;
        while (step > 0 && v < stop) || (step < 0 && v > stop) {
            out.push(v.to_string());
            v += step;
        }
        return Ok(out);
    }
    if let Some(body) = call_body(text, "arange") {
        let args = split_top(body);
        if args.len() != 3 {
            return Err(DaqError::Sequencer(format!("arange takes 3 args: {text:?}")));
        }
        let (start, stop, step) =
            (parse_f64(&args[0])?, parse_f64(&args[1])?, parse_f64(&args[2])?);
        if step == 0.0 || !step.is_finite() {
            return Err(DaqError::Sequencer(format!("bad arange step: {text:?}")));
        }
        let mut out = Vec::new();
        let mut i = 0u64;
        loop {
            let v = start + step * i as f64;
            if (step > 0.0 && v >= stop) || (step < 0.0 && v <= stop) {
                break;
            }
            out.push(fmt(v));
            i += 1;
        }
        return Ok(out);
    }
    if let Some(body) = call_body(text, "array") {
        let body = body.trim();
        let body = body
            .strip_prefix('[')
            .and_then(|b| b.strip_suffix(']'))
            .unwrap_or(body);
        return Ok(split_top(body));
    }
    if text.starts_with("dict(") && text.ends_with(')') {
        // passed through whole; the driver parses the structure
        return Ok(vec![format!("'{text}'")]);
    }
    Ok(split_top(text))
}
