//! Type conversions and miscellaneous functions.

use super::{arg_string, register, Function};
use crate::value::{Value, ValueKind};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "tostring", 1, Some(1), |args| {
        if args[0].is_null() {
            return Ok(Value::Null(ValueKind::String));
        }
        args[0]
            .coerce_string()
            .map(Value::String)
            .ok_or_else(|| format!("cannot convert {} to string", args[0].kind()))
    });
    register(table, "tonumber", 1, Some(1), |args| {
        if args[0].is_null() {
            return Ok(Value::Null(ValueKind::Number));
        }
        args[0]
            .coerce_number()
            .map(Value::Number)
            .ok_or_else(|| format!("cannot convert {} to number", args[0].kind()))
    });
    register(table, "tobool", 1, Some(1), |args| {
        if args[0].is_null() {
            return Ok(Value::Null(ValueKind::Bool));
        }
        args[0]
            .coerce_bool()
            .map(Value::Bool)
            .ok_or_else(|| format!("cannot convert {} to bool", args[0].kind()))
    });
    register(table, "tolist", 1, Some(1), |args| match &args[0] {
        Value::Null(_) => Ok(Value::Null(ValueKind::List)),
        Value::List(items) | Value::Set(items) => Ok(Value::List(items.clone())),
        other => Err(format!("cannot convert {} to list", other.kind())),
    });
    register(table, "toset", 1, Some(1), |args| match &args[0] {
        Value::Null(_) => Ok(Value::Null(ValueKind::Set)),
        Value::List(items) | Value::Set(items) => Ok(Value::set_of(items.clone())),
        other => Err(format!("cannot convert {} to set", other.kind())),
    });
    register(table, "tomap", 1, Some(1), |args| match &args[0] {
        Value::Null(_) => Ok(Value::Null(ValueKind::Map)),
        Value::Map(entries) | Value::Object(entries) => Ok(Value::Map(entries.clone())),
        other => Err(format!("cannot convert {} to map", other.kind())),
    });

    register(table, "uuid", 0, Some(0), |_args| {
        Ok(Value::String(Uuid::new_v4().to_string()))
    });
    register(table, "uuidv5", 2, Some(2), |args| {
        let namespace = arg_string(args, 0)?;
        let name = arg_string(args, 1)?;
        let ns = match namespace.as_str() {
            "dns" => Uuid::NAMESPACE_DNS,
            "url" => Uuid::NAMESPACE_URL,
            "oid" => Uuid::NAMESPACE_OID,
            "x500" => Uuid::NAMESPACE_X500,
            other => Uuid::parse_str(other)
                .map_err(|_| format!("namespace must be dns, url, oid, x500 or a UUID, got \"{}\"", other))?,
        };
        Ok(Value::String(Uuid::new_v5(&ns, name.as_bytes()).to_string()))
    });

    // Sensitivity marks are accepted for compatibility; values are not
    // tracked as sensitive internally.
    register(table, "sensitive", 1, Some(1), |args| Ok(args[0].clone()));
    register(table, "nonsensitive", 1, Some(1), |args| Ok(args[0].clone()));

    register(table, "env", 1, Some(2), |args| {
        let key = arg_string(args, 0)?;
        match std::env::var(&key) {
            Ok(v) => Ok(Value::String(v)),
            Err(_) => match args.get(1) {
                Some(default) => Ok(Value::String(default.render())),
                None => Ok(Value::String(String::new())),
            },
        }
    });
    register(table, "which", 1, Some(1), |args| {
        let exe = arg_string(args, 0)?;
        if exe.contains('/') {
            let p = Path::new(&exe);
            if p.is_file() {
                return Ok(Value::String(exe));
            }
            return Err(format!("executable not found: {}", exe));
        }
        let path = std::env::var("PATH").unwrap_or_default();
        for dir in path.split(':') {
            if dir.is_empty() {
                continue;
            }
            let candidate = Path::new(dir).join(&exe);
            if candidate.is_file() {
                return Ok(Value::String(candidate.to_string_lossy().into_owned()));
            }
        }
        Err(format!("executable not found in PATH: {}", exe))
    });
    register(table, "ansifmt", 2, None, |args| {
        let color = arg_string(args, 0)?;
        let code = ansi_code(&color).ok_or_else(|| format!("unknown ansi style \"{}\"", color))?;
        let mut message = String::new();
        for (i, arg) in args[1..].iter().enumerate() {
            if i > 0 {
                message.push(' ');
            }
            message.push_str(&arg.render());
        }
        Ok(Value::String(format!("{}{}\x1b[0m", code, message)))
    });
}

fn ansi_code(name: &str) -> Option<&'static str> {
    Some(match name {
        "red" => "\x1b[31m",
        "green" => "\x1b[32m",
        "yellow" => "\x1b[33m",
        "blue" => "\x1b[34m",
        "purple" => "\x1b[35m",
        "cyan" => "\x1b[36m",
        "white" => "\x1b[37m",
        "grey" | "gray" => "\x1b[90m",
        "bold" => "\x1b[1m",
        "italic" => "\x1b[3m",
        "underline" => "\x1b[4m",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use crate::value::{Value, ValueKind};
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
    fn test_conversions() {
        assert_eq!(call("tostring", &[Value::from(5)]).unwrap(), Value::from("5"));
        assert_eq!(call("tonumber", &["5".into()]).unwrap(), Value::from(5));
        assert_eq!(call("tobool", &["true".into()]).unwrap(), Value::Bool(true));
        assert!(call("tonumber", &["x".into()]).is_err());
        assert_eq!(
            call("tolist", &[Value::NULL]).unwrap(),
            Value::Null(ValueKind::List)
        );
    }

    #[test]
    fn test_toset_dedups() {
        let l = Value::List(vec![Value::from(1), Value::from(1), Value::from(2)]);
        let s = call("toset", &[l]).unwrap();
        assert_eq!(s.as_slice().unwrap().len(), 2);
    }

    #[test]
    fn test_uuidv5_is_stable() {
        let a = call("uuidv5", &["dns".into(), "example.com".into()]).unwrap();
        let b = call("uuidv5", &["dns".into(), "example.com".into()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_env_default() {
        assert_eq!(
            call("env", &["TOGOMAK_TEST_UNSET_VAR".into(), "fallback".into()]).unwrap(),
            Value::from("fallback")
        );
    }

    #[test]
    fn test_ansifmt() {
        assert_eq!(
            call("ansifmt", &["red".into(), "hi".into()]).unwrap(),
            Value::from("\x1b[31mhi\x1b[0m")
        );
        assert!(call("ansifmt", &["mauve".into(), "hi".into()]).is_err());
    }

    #[test]
    fn test_which_finds_sh() {
        // /bin/sh exists on every platform we run tests on.
        assert!(call("which", &["sh".into()]).is_ok());
    }
}
