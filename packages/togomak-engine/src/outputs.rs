//! The outputs env file.
//!
//! Stages receive `TOGOMAK_OUTPUTS=<tempdir>/togomak.env` and append
//! `K=V` lines to it. The scheduler re-reads the file between layers
//! (single-threaded) and publishes the entries as the `output` namespace, so
//! values exported in layer L are visible to every later layer.

use crate::pipeline::OUTPUT_ENV_FILE;
use crate::RunContext;
use std::path::Path;
use togomak_expr::{Diagnostic, Diagnostics, Value};
use tracing::{trace, warn};

/// Parse a strict `K=V` env file. Values may be double-quoted (with `\n`,
/// `\t`, `\"`, `\\` escapes) or single-quoted (literal). Blank lines and
/// `#` comments are ignored.
pub fn parse_env(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(eq) = line.find('=') else {
            return Err(format!("line {}: expected K=V, got {:?}", lineno + 1, raw));
        };
        let (key, value) = line.split_at(eq);
        let key = key.trim_end();
        let value = &value[1..];
        if key.is_empty()
            || !key
                .chars()
                .enumerate()
                .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        {
            return Err(format!("line {}: invalid key {:?}", lineno + 1, key));
        }
        out.push((key.to_string(), unquote(value.trim(), lineno + 1)?));
    }
    Ok(out)
}

fn unquote(value: &str, lineno: usize) -> Result<String, String> {
    if let Some(inner) = value.strip_prefix('"') {
        let Some(inner) = inner.strip_suffix('"') else {
            return Err(format!("line {}: unterminated double quote", lineno));
        };
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => return Err(format!("line {}: dangling escape", lineno)),
            }
        }
        return Ok(out);
    }
    if let Some(inner) = value.strip_prefix('\'') {
        let Some(inner) = inner.strip_suffix('\'') else {
            return Err(format!("line {}: unterminated single quote", lineno));
        };
        return Ok(inner.to_string());
    }
    Ok(value.to_string())
}

/// Refresh the `output` namespace from the on-disk env file. A missing file
/// is not an error; the first layer legitimately runs before any stage has
/// exported anything.
pub fn refresh(run: &RunContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let path = run.tempdir.join(OUTPUT_ENV_FILE);
    trace!(file = %path.display(), "refreshing output namespace");

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            run.ctx.set_namespace("output", Value::Object(Default::default()));
            return diags;
        }
        Err(e) => {
            warn!("could not open {}, ignoring: {}", path.display(), e);
            return diags;
        }
    };
    match parse_env(&content) {
        Ok(entries) => {
            let object = Value::object_of(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect::<Vec<_>>(),
            );
            run.ctx.set_namespace("output", object);
        }
        Err(e) => diags.push(Diagnostic::error(
            "could not parse outputs env file",
            format!("{}: {}", path.display(), e),
        )),
    }
    diags
}

/// The absolute path handed to stages via `TOGOMAK_OUTPUTS`.
pub fn env_file_path(tempdir: &Path) -> std::path::PathBuf {
    tempdir.join(OUTPUT_ENV_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_pairs() {
        let entries = parse_env("A=1\nMSG=hi\n\n# comment\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], ("MSG".to_string(), "hi".to_string()));
    }

    #[test]
    fn test_parse_quoted_values() {
        let entries = parse_env("A=\"two words\"\nB=\"line\\nbreak\"\nC='$literal'\n").unwrap();
        assert_eq!(entries[0].1, "two words");
        assert_eq!(entries[1].1, "line\nbreak");
        assert_eq!(entries[2].1, "$literal");
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(parse_env("NOEQUALS\n").is_err());
        assert!(parse_env("1BAD=x\n").is_err());
        assert!(parse_env("A=\"unterminated\n").is_err());
    }

    #[test]
    fn test_last_write_wins_round_trip() {
        // Appending twice is fine; later entries shadow earlier ones when
        // the namespace object is built (object_of keeps the last).
        let entries = parse_env("K=first\nK=second\n").unwrap();
        let object = togomak_expr::Value::object_of(
            entries
                .into_iter()
                .map(|(k, v)| (k, togomak_expr::Value::String(v)))
                .collect::<Vec<_>>(),
        );
        assert_eq!(
            object.as_entries().unwrap()["K"],
            togomak_expr::Value::from("second")
        );
    }
}
