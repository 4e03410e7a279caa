//! The pipeline function library.
//!
//! Functions are pure: `(args) -> value | message`. They are installed once
//! into the root [`crate::EvalContext`] at startup. Filesystem functions are
//! closed over the configured working directory so every expression sees the
//! same root.

mod collection;
mod crypto;
mod datetime;
mod encoding;
mod filesystem;
mod misc;
mod number;
mod string;

use crate::diag::{Diagnostic, Diagnostics};
use crate::value::{Number, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;

type FuncImpl = Box<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// A callable entry in the function table.
pub struct Function {
    min_args: usize,
    max_args: Option<usize>,
    imp: FuncImpl,
}

impl Function {
    pub fn new<F>(min_args: usize, max_args: Option<usize>, imp: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Function {
            min_args,
            max_args,
            imp: Box::new(imp),
        }
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, Diagnostics> {
        if args.len() < self.min_args || self.max_args.is_some_and(|max| args.len() > max) {
            let arity = match self.max_args {
                Some(max) if max == self.min_args => format!("{}", self.min_args),
                Some(max) => format!("{} to {}", self.min_args, max),
                None => format!("at least {}", self.min_args),
            };
            return Err(Diagnostic::error(
                "invalid function arguments",
                format!("{}() expects {} argument(s), got {}", name, arity, args.len()),
            )
            .into());
        }
        (self.imp)(args).map_err(|message| {
            Diagnostic::error(
                format!("error calling {}()", name),
                message,
            )
            .into()
        })
    }
}

/// Build the full standard table. `cwd` roots the filesystem functions.
pub fn standard_functions(cwd: PathBuf) -> HashMap<String, Function> {
    let mut table = HashMap::new();
    string::install(&mut table);
    number::install(&mut table);
    collection::install(&mut table);
    encoding::install(&mut table);
    crypto::install(&mut table);
    datetime::install(&mut table);
    filesystem::install(&mut table, cwd);
    misc::install(&mut table);
    table
}

pub(crate) fn register<F>(
    table: &mut HashMap<String, Function>,
    name: &str,
    min_args: usize,
    max_args: Option<usize>,
    imp: F,
) where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
{
    table.insert(name.to_string(), Function::new(min_args, max_args, imp));
}

// Argument accessors shared by the submodules.

pub(crate) fn arg_string(args: &[Value], i: usize) -> Result<String, String> {
    args[i]
        .coerce_string()
        .ok_or_else(|| format!("argument {} must be a string, got {}", i + 1, args[i].kind()))
}

pub(crate) fn arg_number(args: &[Value], i: usize) -> Result<Number, String> {
    args[i]
        .coerce_number()
        .ok_or_else(|| format!("argument {} must be a number, got {}", i + 1, args[i].kind()))
}

pub(crate) fn arg_int(args: &[Value], i: usize) -> Result<i64, String> {
    arg_number(args, i)?
        .as_i64()
        .ok_or_else(|| format!("argument {} must be a whole number", i + 1))
}

pub(crate) fn arg_list(args: &[Value], i: usize) -> Result<Vec<Value>, String> {
    match &args[i] {
        Value::List(items) | Value::Set(items) => Ok(items.clone()),
        other => Err(format!("argument {} must be a list, got {}", i + 1, other.kind())),
    }
}

pub(crate) fn arg_entries(args: &[Value], i: usize) -> Result<IndexMap<String, Value>, String> {
    args[i]
        .as_entries()
        .cloned()
        .ok_or_else(|| format!("argument {} must be a map or object, got {}", i + 1, args[i].kind()))
}

pub(crate) fn string_items(items: &[Value], what: &str) -> Result<Vec<String>, String> {
    items
        .iter()
        .map(|v| {
            v.coerce_string()
                .ok_or_else(|| format!("{} must contain only strings, got {}", what, v.kind()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_check() {
        let table = standard_functions(PathBuf::from("/"));
        let upper = table.get("upper").unwrap();
        assert!(upper.call("upper", &[]).is_err());
        assert!(upper
            .call("upper", &[Value::from("a"), Value::from("b")])
            .is_err());
        assert_eq!(
            upper.call("upper", &[Value::from("a")]).unwrap(),
            Value::from("A")
        );
    }

    #[test]
    fn test_standard_table_is_complete() {
        let table = standard_functions(PathBuf::from("/"));
        for name in [
            "alltrue", "anytrue", "format", "formatlist", "join", "split", "replace", "upper",
            "lower", "trim", "trimprefix", "trimsuffix", "trimspace", "chomp", "indent", "regex",
            "regexall", "substr", "strcontains", "startswith", "endswith", "title", "strrev",
            "abs", "ceil", "floor", "min", "max", "pow", "signum", "parseint", "log", "sum",
            "range", "concat", "distinct", "flatten", "length", "keys", "values", "lookup",
            "merge", "element", "index", "contains", "slice", "sort", "reverse", "compact",
            "chunklist", "setintersection", "setunion", "setsubtract", "setproduct", "zipmap",
            "transpose", "matchkeys", "one", "jsonencode", "jsondecode", "yamlencode",
            "yamldecode", "base64encode", "base64decode", "base64gzip", "csvdecode",
            "textencodebase64", "textdecodebase64", "urlencode", "md5", "sha1", "sha256",
            "sha512", "base64sha256", "base64sha512", "bcrypt", "rsadecrypt", "timestamp",
            "timeadd", "timecmp", "formatdate", "file", "fileexists", "fileset", "filebase64",
            "filemd5", "filesha1", "filesha256", "filesha512", "filebase64sha256",
            "filebase64sha512", "dirname", "basename", "abspath", "pathexpand", "coalesce",
            "coalescelist", "uuid", "uuidv5", "sensitive", "nonsensitive", "env", "which",
            "ansifmt", "tostring", "tonumber", "tobool", "tolist", "toset", "tomap",
        ] {
            assert!(table.contains_key(name), "missing function {}", name);
        }
    }
}
