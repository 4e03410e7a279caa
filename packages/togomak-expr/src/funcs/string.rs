//! String functions.

use super::{arg_int, arg_list, arg_string, register, string_items, Function};
use crate::value::Value;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashMap;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "upper", 1, Some(1), |args| {
        Ok(Value::String(arg_string(args, 0)?.to_uppercase()))
    });
    register(table, "lower", 1, Some(1), |args| {
        Ok(Value::String(arg_string(args, 0)?.to_lowercase()))
    });
    register(table, "strrev", 1, Some(1), |args| {
        Ok(Value::String(arg_string(args, 0)?.chars().rev().collect()))
    });
    register(table, "trimspace", 1, Some(1), |args| {
        Ok(Value::String(arg_string(args, 0)?.trim().to_string()))
    });
    register(table, "trim", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        let cutset: Vec<char> = arg_string(args, 1)?.chars().collect();
        Ok(Value::String(s.trim_matches(|c| cutset.contains(&c)).to_string()))
    });
    register(table, "trimprefix", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        let prefix = arg_string(args, 1)?;
        Ok(Value::String(
            s.strip_prefix(&prefix).unwrap_or(&s).to_string(),
        ))
    });
    register(table, "trimsuffix", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        let suffix = arg_string(args, 1)?;
        Ok(Value::String(
            s.strip_suffix(&suffix).unwrap_or(&s).to_string(),
        ))
    });
    register(table, "chomp", 1, Some(1), |args| {
        let s = arg_string(args, 0)?;
        Ok(Value::String(s.trim_end_matches(['\r', '\n']).to_string()))
    });
    register(table, "join", 2, None, |args| {
        let separator = arg_string(args, 0)?;
        let mut parts = Vec::new();
        for list in &args[1..] {
            let items = list
                .as_slice()
                .ok_or_else(|| format!("join() operands must be lists, got {}", list.kind()))?;
            parts.extend(string_items(items, "join() lists")?);
        }
        Ok(Value::String(parts.join(&separator)))
    });
    register(table, "split", 2, Some(2), |args| {
        let separator = arg_string(args, 0)?;
        let s = arg_string(args, 1)?;
        let parts: Vec<Value> = if separator.is_empty() {
            s.chars().map(|c| Value::String(c.to_string())).collect()
        } else {
            s.split(&separator).map(Value::from).collect()
        };
        Ok(Value::List(parts))
    });
    register(table, "replace", 3, Some(3), |args| {
        let s = arg_string(args, 0)?;
        let from = arg_string(args, 1)?;
        let to = arg_string(args, 2)?;
        Ok(Value::String(s.replace(&from, &to)))
    });
    register(table, "strcontains", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        Ok(Value::Bool(s.contains(&arg_string(args, 1)?)))
    });
    register(table, "startswith", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        Ok(Value::Bool(s.starts_with(&arg_string(args, 1)?)))
    });
    register(table, "endswith", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        Ok(Value::Bool(s.ends_with(&arg_string(args, 1)?)))
    });
    register(table, "title", 1, Some(1), |args| {
        let s = arg_string(args, 0)?;
        let mut out = String::with_capacity(s.len());
        let mut at_word_start = true;
        for c in s.chars() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            at_word_start = c.is_whitespace();
        }
        Ok(Value::String(out))
    });
    register(table, "indent", 2, Some(2), |args| {
        let spaces = arg_int(args, 0)?.max(0) as usize;
        let s = arg_string(args, 1)?;
        let pad = " ".repeat(spaces);
        let mut lines = s.split('\n');
        let mut out = String::new();
        if let Some(first) = lines.next() {
            out.push_str(first);
        }
        for line in lines {
            out.push('\n');
            if !line.is_empty() {
                out.push_str(&pad);
            }
            out.push_str(line);
        }
        Ok(Value::String(out))
    });
    register(table, "substr", 3, Some(3), |args| {
        let s = arg_string(args, 0)?;
        let chars: Vec<char> = s.chars().collect();
        let mut offset = arg_int(args, 1)?;
        let length = arg_int(args, 2)?;
        if offset < 0 {
            offset += chars.len() as i64;
        }
        let start = offset.clamp(0, chars.len() as i64) as usize;
        let end = if length < 0 {
            chars.len()
        } else {
            (start + length as usize).min(chars.len())
        };
        Ok(Value::String(chars[start..end].iter().collect()))
    });
    register(table, "format", 1, None, |args| {
        let spec = arg_string(args, 0)?;
        Ok(Value::String(format_impl(&spec, &args[1..])?))
    });
    register(table, "formatlist", 1, None, |args| {
        let spec = arg_string(args, 0)?;
        let rest = &args[1..];
        let mut len = None;
        for arg in rest {
            if let Some(items) = arg.as_slice() {
                match len {
                    None => len = Some(items.len()),
                    Some(existing) if existing != items.len() => {
                        return Err("formatlist() list arguments must have the same length".into())
                    }
                    _ => {}
                }
            }
        }
        let len = len.unwrap_or(1);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let row: Vec<Value> = rest
                .iter()
                .map(|arg| match arg.as_slice() {
                    Some(items) => items[i].clone(),
                    None => arg.clone(),
                })
                .collect();
            out.push(Value::String(format_impl(&spec, &row)?));
        }
        Ok(Value::List(out))
    });
    register(table, "regex", 2, Some(2), |args| {
        let re = compile(&arg_string(args, 0)?)?;
        let s = arg_string(args, 1)?;
        match re.captures(&s) {
            Some(caps) => Ok(captures_value(&re, &caps)),
            None => Err(format!("pattern did not match the given string: {}", re.as_str())),
        }
    });
    register(table, "regexall", 2, Some(2), |args| {
        let re = compile(&arg_string(args, 0)?)?;
        let s = arg_string(args, 1)?;
        Ok(Value::List(
            re.captures_iter(&s)
                .map(|caps| captures_value(&re, &caps))
                .collect(),
        ))
    });
    register(table, "alltrue", 1, Some(1), |args| {
        let items = arg_list(args, 0)?;
        let mut all = true;
        for item in items {
            match item.coerce_bool() {
                Some(b) => all = all && b,
                None => return Err(format!("alltrue() requires bools, got {}", item.kind())),
            }
        }
        Ok(Value::Bool(all))
    });
    register(table, "anytrue", 1, Some(1), |args| {
        let items = arg_list(args, 0)?;
        let mut any = false;
        for item in items {
            match item.coerce_bool() {
                Some(b) => any = any || b,
                None => return Err(format!("anytrue() requires bools, got {}", item.kind())),
            }
        }
        Ok(Value::Bool(any))
    });
}

fn compile(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid regular expression: {}", e))
}

/// Match result shaped like Terraform's `regex`: the whole match when there
/// are no groups, a list for unnamed groups, a map for named groups.
fn captures_value(re: &Regex, caps: &regex::Captures<'_>) -> Value {
    let names: Vec<&str> = re.capture_names().flatten().collect();
    if !names.is_empty() {
        let entries: IndexMap<String, Value> = names
            .iter()
            .map(|name| {
                let text = caps.name(name).map(|m| m.as_str()).unwrap_or_default();
                (name.to_string(), Value::from(text))
            })
            .collect();
        Value::Map(entries)
    } else if re.captures_len() > 1 {
        Value::List(
            (1..re.captures_len())
                .map(|i| Value::from(caps.get(i).map(|m| m.as_str()).unwrap_or_default()))
                .collect(),
        )
    } else {
        Value::from(caps.get(0).map(|m| m.as_str()).unwrap_or_default())
    }
}

/// Minimal printf: %s, %d, %f, %q, %v, %%.
fn format_impl(spec: &str, args: &[Value]) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = spec.chars().peekable();
    let mut next = 0usize;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let verb = chars
            .next()
            .ok_or_else(|| "format specification ends with a bare %".to_string())?;
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args
            .get(next)
            .ok_or_else(|| format!("not enough arguments for format verb %{}", verb))?;
        next += 1;
        match verb {
            's' => out.push_str(&arg.render()),
            'v' => out.push_str(&arg.render()),
            'd' => {
                let n = arg
                    .coerce_number()
                    .and_then(|n| n.as_i64())
                    .ok_or_else(|| format!("%d requires a whole number, got {}", arg.kind()))?;
                out.push_str(&n.to_string());
            }
            'f' => {
                let n = arg
                    .coerce_number()
                    .ok_or_else(|| format!("%f requires a number, got {}", arg.kind()))?;
                out.push_str(&format!("{:.6}", n.as_f64()));
            }
            'q' => {
                out.push_str(&serde_json::to_string(&arg.render()).unwrap_or_default());
            }
            other => return Err(format!("unsupported format verb %{}", other)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        let table = super::super::standard_functions(PathBuf::from("/"));
        table
            .get(name)
            .unwrap()
            .call(name, args)
            .map_err(|d| d.to_string())
    }

    #[test]
    fn test_basic_string_functions() {
        assert_eq!(call("upper", &["ab".into()]).unwrap(), Value::from("AB"));
        assert_eq!(
            call("split", &[",".into(), "a,b".into()]).unwrap(),
            Value::List(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            call("join", &["-".into(), Value::List(vec!["a".into(), "b".into()])]).unwrap(),
            Value::from("a-b")
        );
        assert_eq!(call("chomp", &["hi\n\n".into()]).unwrap(), Value::from("hi"));
        assert_eq!(call("title", &["hello world".into()]).unwrap(), Value::from("Hello World"));
    }

    #[test]
    fn test_substr_negative_offset() {
        assert_eq!(
            call("substr", &["hello".into(), Value::from(-3), Value::from(2)]).unwrap(),
            Value::from("ll")
        );
        assert_eq!(
            call("substr", &["hello".into(), Value::from(1), Value::from(-1)]).unwrap(),
            Value::from("ello")
        );
    }

    #[test]
    fn test_format() {
        assert_eq!(
            call("format", &["%s=%d".into(), "a".into(), Value::from(3)]).unwrap(),
            Value::from("a=3")
        );
        assert_eq!(
            call("format", &["100%%".into()]).unwrap(),
            Value::from("100%")
        );
    }

    #[test]
    fn test_formatlist_broadcasts() {
        let out = call(
            "formatlist",
            &[
                "%s.example.com".into(),
                Value::List(vec!["a".into(), "b".into()]),
            ],
        )
        .unwrap();
        assert_eq!(
            out,
            Value::List(vec!["a.example.com".into(), "b.example.com".into()])
        );
    }

    #[test]
    fn test_regex() {
        assert_eq!(
            call("regex", &["[a-z]+".into(), "123abc456".into()]).unwrap(),
            Value::from("abc")
        );
        assert!(call("regex", &["[a-z]+".into(), "123".into()]).is_err());
        let all = call("regexall", &["[a-z]+".into(), "a1b2".into()]).unwrap();
        assert_eq!(all.as_slice().unwrap().len(), 2);
    }

    #[test]
    fn test_alltrue_anytrue() {
        let t = Value::List(vec![Value::Bool(true), Value::from("true")]);
        assert_eq!(call("alltrue", &[t.clone()]).unwrap(), Value::Bool(true));
        let f = Value::List(vec![Value::Bool(false), Value::Bool(true)]);
        assert_eq!(call("alltrue", &[f.clone()]).unwrap(), Value::Bool(false));
        assert_eq!(call("anytrue", &[f]).unwrap(), Value::Bool(true));
    }
}
