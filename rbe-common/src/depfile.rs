//! Path rewriting for Makefile-style dependency files.
//!
//! Only the paths change; whitespace, line continuations and rule
//! separators are written back as they were.

use std::io;
use std::path::Path;

fn flush<F: Fn(&str) -> String>(token: &mut String, out: &mut String, transform: &F) {
    if token.is_empty() {
        return;
    }
    if token == ":" {
        out.push(':');
    } else if let Some(path) = token.strip_suffix(':') {
        out.push_str(&transform(path));
        out.push(':');
    } else {
        out.push_str(&transform(token));
    }
    token.clear();
}

/// Apply `transform` to every target and dependency path in `text`.
pub fn transform_paths<F: Fn(&str) -> String>(text: &str, transform: F) -> String {
    let mut out = String::with_capacity(text.len());
    let mut token = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('\n') => {
                    flush(&mut token, &mut out, &transform);
                    chars.next();
                    out.push_str("\\\n");
                }
                Some(' ') => {
                    chars.next();
                    token.push_str("\\ ");
                }
                _ => token.push('\\'),
            },
            c if c.is_whitespace() => {
                flush(&mut token, &mut out, &transform);
                out.push(c);
            }
            c => token.push(c),
        }
    }
    flush(&mut token, &mut out, &transform);
    out
}

/// Rewrite the paths of `dep_file`, writing to `output` (or in place).
pub fn rewrite_depfile<F: Fn(&str) -> String>(
    dep_file: &Path,
    transform: F,
    output: Option<&Path>,
) -> io::Result<()> {
    let text = std::fs::read_to_string(dep_file)?;
    std::fs::write(output.unwrap_or(dep_file), transform_paths(&text, transform))
}
