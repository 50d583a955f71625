//! Text helpers for composing C source.

pub fn escape_c_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn sanitize_symbol(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (idx, ch) in value.chars().enumerate() {
        let is_valid = ch.is_ascii_alphanumeric() || ch == '_';
        if idx == 0 && ch.is_ascii_digit() {
            out.push('_');
        }
        out.push(if is_valid { ch } else { '_' });
    }
    if out.is_empty() {
        out.push_str("op");
    }
    out
}

pub fn is_c_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// `math.h` becomes `#include <math.h>`; quoted or bracketed names are kept.
pub fn include_line(header: &str) -> String {
    let header = header.trim();
    if header.starts_with('<') || header.starts_with('"') {
        format!("#include {header}")
    } else {
        format!("#include <{header}>")
    }
}

pub fn push_line(module: &mut String, indent: usize, line: &str) {
    push_block(module, indent, line);
}

/// Appends `block` re-indented to `indent` levels, stripping its common
/// leading whitespace and surrounding blank lines.
pub fn push_block(module: &mut String, indent: usize, block: &str) {
    if block.trim().is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
    let mut lines: Vec<&str> = block.split('\n').collect();
    while matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    while matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }

    let mut min_indent = usize::MAX;
    for line in &lines {
        if line.trim().is_empty() {
            continue;
        }
        let count = line.chars().take_while(|c| *c == ' ' || *c == '\t').count();
        min_indent = min_indent.min(count);
    }
    if min_indent == usize::MAX {
        min_indent = 0;
    }

    for line in lines {
        let trimmed = if line.len() >= min_indent {
            &line[min_indent..]
        } else {
            line.trim_start()
        };
        let trimmed = trimmed.trim_end();
        if trimmed.is_empty() {
            module.push('\n');
            continue;
        }
        module.push_str(&pad);
        module.push_str(trimmed);
        module.push('\n');
    }
}

/// Wraps a fragment in its own C scope, or emits nothing for empty text.
pub fn push_scoped(module: &mut String, indent: usize, comment: &str, block: &str) {
    if block.trim().is_empty() {
        return;
    }
    push_line(module, indent, &format!("/* {comment} */"));
    push_line(module, indent, "{");
    push_block(module, indent + 1, block);
    push_line(module, indent, "}");
}
