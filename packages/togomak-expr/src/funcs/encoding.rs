//! Encoding and serialization functions.

use super::{arg_string, register, Function};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::io::Write;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "jsonencode", 1, Some(1), |args| {
        serde_json::to_string(&args[0].to_json())
            .map(Value::String)
            .map_err(|e| format!("cannot encode value as JSON: {}", e))
    });
    register(table, "jsondecode", 1, Some(1), |args| {
        let s = arg_string(args, 0)?;
        serde_json::from_str::<serde_json::Value>(&s)
            .map(Value::from_json)
            .map_err(|e| format!("invalid JSON: {}", e))
    });
    register(table, "yamlencode", 1, Some(1), |args| {
        serde_yaml::to_string(&args[0].to_json())
            .map(Value::String)
            .map_err(|e| format!("cannot encode value as YAML: {}", e))
    });
    register(table, "yamldecode", 1, Some(1), |args| {
        let s = arg_string(args, 0)?;
        serde_yaml::from_str::<serde_json::Value>(&s)
            .map(Value::from_json)
            .map_err(|e| format!("invalid YAML: {}", e))
    });
    register(table, "base64encode", 1, Some(1), |args| {
        Ok(Value::String(BASE64.encode(arg_string(args, 0)?)))
    });
    register(table, "base64decode", 1, Some(1), |args| {
        let raw = BASE64
            .decode(arg_string(args, 0)?)
            .map_err(|e| format!("invalid base64: {}", e))?;
        String::from_utf8(raw)
            .map(Value::String)
            .map_err(|_| "the decoded data is not valid UTF-8".to_string())
    });
    register(table, "base64gzip", 1, Some(1), |args| {
        let s = arg_string(args, 0)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(s.as_bytes())
            .and_then(|_| encoder.finish())
            .map(|compressed| Value::String(BASE64.encode(compressed)))
            .map_err(|e| format!("gzip failed: {}", e))
    });
    register(table, "textencodebase64", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        require_utf8(&arg_string(args, 1)?)?;
        Ok(Value::String(BASE64.encode(s)))
    });
    register(table, "textdecodebase64", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        require_utf8(&arg_string(args, 1)?)?;
        let raw = BASE64.decode(s).map_err(|e| format!("invalid base64: {}", e))?;
        String::from_utf8(raw)
            .map(Value::String)
            .map_err(|_| "the decoded data is not valid UTF-8".to_string())
    });
    register(table, "urlencode", 1, Some(1), |args| {
        Ok(Value::String(
            urlencoding::encode(&arg_string(args, 0)?).into_owned(),
        ))
    });
    register(table, "csvdecode", 1, Some(1), |args| {
        let s = arg_string(args, 0)?;
        let mut reader = csv::Reader::from_reader(s.as_bytes());
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| format!("invalid CSV: {}", e))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| format!("invalid CSV: {}", e))?;
            let entries: IndexMap<String, Value> = headers
                .iter()
                .cloned()
                .zip(record.iter().map(Value::from))
                .collect();
            rows.push(Value::Object(entries));
        }
        Ok(Value::List(rows))
    });
}

fn require_utf8(encoding: &str) -> Result<(), String> {
    if encoding.eq_ignore_ascii_case("utf-8") {
        Ok(())
    } else {
        Err(format!("unsupported character encoding \"{}\"; only UTF-8 is supported", encoding))
    }
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
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
    fn test_json_roundtrip() {
        let encoded = call("jsonencode", &[Value::List(vec![Value::from(1), "x".into()])]).unwrap();
        assert_eq!(encoded, Value::from(r#"[1,"x"]"#));
        let decoded = call("jsondecode", &[encoded]).unwrap();
        assert_eq!(decoded.as_slice().unwrap()[1], Value::from("x"));
    }

    #[test]
    fn test_base64() {
        let encoded = call("base64encode", &["hello".into()]).unwrap();
        assert_eq!(encoded, Value::from("aGVsbG8="));
        assert_eq!(call("base64decode", &[encoded]).unwrap(), Value::from("hello"));
        assert!(call("base64decode", &["%%%".into()]).is_err());
    }

    #[test]
    fn test_yaml_decode() {
        let decoded = call("yamldecode", &["a: 1\nb: [x]\n".into()]).unwrap();
        assert_eq!(decoded.as_entries().unwrap()["a"], Value::from(1));
    }

    #[test]
    fn test_csvdecode() {
        let rows = call("csvdecode", &["a,b\n1,2\n3,4\n".into()]).unwrap();
        let rows = rows.as_slice().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].as_entries().unwrap()["b"], Value::from("4"));
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(
            call("urlencode", &["a b&c".into()]).unwrap(),
            Value::from("a%20b%26c")
        );
    }

    #[test]
    fn test_textencodebase64_rejects_unknown_charset() {
        assert!(call("textencodebase64", &["x".into(), "latin1".into()]).is_err());
    }
}
