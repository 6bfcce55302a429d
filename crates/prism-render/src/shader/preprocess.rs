//! Define handling for shader sources.
//!
//! Supports `#ifdef NAME`, `#ifndef NAME`, `#else` and `#endif` (nestable).
//! A define written `NAME=VALUE` additionally replaces every whole-word
//! occurrence of `NAME` in active lines with `VALUE`. Removed lines are kept
//! as empty lines so compiler diagnostics keep their line numbers.

use std::collections::HashMap;

struct Frame {
    parent_active: bool,
    condition: bool,
    seen_else: bool,
}

/// Applies `defines` to `source`.
pub fn preprocess(source: &str, defines: &[String]) -> Result<String, String> {
    let mut names: HashMap<&str, Option<&str>> = HashMap::new();
    for define in defines {
        let define = define.trim();
        if define.is_empty() {
            continue;
        }
        match define.split_once('=') {
            Some((name, value)) => names.insert(name.trim(), Some(value.trim())),
            None => names.insert(define, None),
        };
    }

    let mut stack: Vec<Frame> = Vec::new();
    let mut active = true;
    let mut out = String::with_capacity(source.len());

    for (number, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(rest) = directive(trimmed, "#ifdef").or_else(|| directive(trimmed, "#ifndef")) {
            let name = rest.trim();
            if name.is_empty() {
                return Err(format!("line {}: missing define name", number + 1));
            }
            let defined = names.contains_key(name);
            let condition = if trimmed.starts_with("#ifdef") {
                defined
            } else {
                !defined
            };
            stack.push(Frame {
                parent_active: active,
                condition,
                seen_else: false,
            });
            active = active && condition;
        } else if directive(trimmed, "#else").is_some() {
            let frame = stack
                .last_mut()
                .ok_or_else(|| format!("line {}: #else without #ifdef", number + 1))?;
            if frame.seen_else {
                return Err(format!("line {}: duplicate #else", number + 1));
            }
            frame.seen_else = true;
            active = frame.parent_active && !frame.condition;
        } else if directive(trimmed, "#endif").is_some() {
            let frame = stack
                .pop()
                .ok_or_else(|| format!("line {}: #endif without #ifdef", number + 1))?;
            active = frame.parent_active;
        } else if active {
            out.push_str(&substitute(line, &names));
        }
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(format!("{} unterminated #ifdef block(s)", stack.len()));
    }
    Ok(out)
}

fn directive<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

fn substitute(line: &str, names: &HashMap<&str, Option<&str>>) -> String {
    if names.values().all(Option::is_none) {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len());
    let mut word = String::new();
    let flush = |word: &mut String, out: &mut String| {
        match names.get(word.as_str()) {
            Some(Some(value)) => out.push_str(value),
            _ => out.push_str(word),
        }
        word.clear();
    };
    for c in line.chars() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
        } else {
            flush(&mut word, &mut out);
            out.push(c);
        }
    }
    flush(&mut word, &mut out);
    out
}
