//! Filesystem functions, rooted at the configured working directory.

use super::{arg_string, register, Function};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

pub fn install(table: &mut HashMap<String, Function>, cwd: PathBuf) {
    let root = cwd.clone();
    register(table, "file", 1, Some(1), move |args| {
        read_file(&root, &arg_string(args, 0)?).map(Value::String)
    });

    let root = cwd.clone();
    register(table, "filebase64", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?).map(|raw| Value::String(BASE64.encode(raw)))
    });

    let root = cwd.clone();
    register(table, "fileexists", 1, Some(1), move |args| {
        Ok(Value::Bool(resolve(&root, &arg_string(args, 0)?).is_file()))
    });

    let root = cwd.clone();
    register(table, "fileset", 2, Some(2), move |args| {
        let base = resolve(&root, &arg_string(args, 0)?);
        let pattern = arg_string(args, 1)?;
        let full = base.join(&pattern);
        let matches = glob::glob(&full.to_string_lossy())
            .map_err(|e| format!("invalid fileset pattern: {}", e))?;
        let mut out = Vec::new();
        for entry in matches.flatten() {
            if entry.is_file() {
                let relative = entry.strip_prefix(&base).unwrap_or(&entry);
                out.push(Value::String(relative.to_string_lossy().into_owned()));
            }
        }
        out.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        Ok(Value::Set(out))
    });

    let root = cwd.clone();
    register(table, "filemd5", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?)
            .map(|raw| Value::String(hex::encode(Md5::digest(raw))))
    });
    let root = cwd.clone();
    register(table, "filesha1", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?)
            .map(|raw| Value::String(hex::encode(Sha1::digest(raw))))
    });
    let root = cwd.clone();
    register(table, "filesha256", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?)
            .map(|raw| Value::String(hex::encode(Sha256::digest(raw))))
    });
    let root = cwd.clone();
    register(table, "filesha512", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?)
            .map(|raw| Value::String(hex::encode(Sha512::digest(raw))))
    });
    let root = cwd.clone();
    register(table, "filebase64sha256", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?)
            .map(|raw| Value::String(BASE64.encode(Sha256::digest(raw))))
    });
    let root = cwd.clone();
    register(table, "filebase64sha512", 1, Some(1), move |args| {
        read_bytes(&root, &arg_string(args, 0)?)
            .map(|raw| Value::String(BASE64.encode(Sha512::digest(raw))))
    });

    register(table, "dirname", 1, Some(1), |args| {
        let path = arg_string(args, 0)?;
        Ok(Value::String(
            Path::new(&path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| ".".to_string()),
        ))
    });
    register(table, "basename", 1, Some(1), |args| {
        let path = arg_string(args, 0)?;
        Ok(Value::String(
            Path::new(&path)
                .file_name()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ))
    });

    let root = cwd.clone();
    register(table, "abspath", 1, Some(1), move |args| {
        let path = resolve(&root, &arg_string(args, 0)?);
        Ok(Value::String(normalize(&path).to_string_lossy().into_owned()))
    });

    register(table, "pathexpand", 1, Some(1), |args| {
        let path = arg_string(args, 0)?;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Ok(Value::String(
                    Path::new(&home).join(rest).to_string_lossy().into_owned(),
                ));
            }
        } else if path == "~" {
            if let Ok(home) = std::env::var("HOME") {
                return Ok(Value::String(home));
            }
        }
        Ok(Value::String(path))
    });
}

fn resolve(cwd: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

/// Lexically normalize `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn read_bytes(cwd: &Path, path: &str) -> Result<Vec<u8>, String> {
    let full = resolve(cwd, path);
    std::fs::read(&full).map_err(|e| format!("cannot read {}: {}", full.display(), e))
}

fn read_file(cwd: &Path, path: &str) -> Result<String, String> {
    let full = resolve(cwd, path);
    std::fs::read_to_string(&full).map_err(|e| format!("cannot read {}: {}", full.display(), e))
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use std::io::Write;

    fn call_in(dir: &std::path::Path, name: &str, args: &[Value]) -> Result<Value, String> {
        let table = super::super::standard_functions(dir.to_path_buf());
        table
            .get(name)
            .unwrap()
            .call(name, args)
            .map_err(|d| d.to_string())
    }

    #[test]
    fn test_file_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("note.txt")).unwrap();
        writeln!(f, "hello").unwrap();

        assert_eq!(
            call_in(dir.path(), "file", &["note.txt".into()]).unwrap(),
            Value::from("hello\n")
        );
        assert_eq!(
            call_in(dir.path(), "fileexists", &["note.txt".into()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_in(dir.path(), "fileexists", &["missing.txt".into()]).unwrap(),
            Value::Bool(false)
        );
        assert!(call_in(dir.path(), "file", &["missing.txt".into()]).is_err());
    }

    #[test]
    fn test_fileset_relative_results() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "y").unwrap();

        let got = call_in(dir.path(), "fileset", &[".".into(), "*.txt".into()]).unwrap();
        assert_eq!(got.as_slice().unwrap().len(), 1);
        assert_eq!(got.as_slice().unwrap()[0], Value::from("a.txt"));
    }

    #[test]
    fn test_path_helpers() {
        let dir = std::path::Path::new("/");
        assert_eq!(
            call_in(dir, "dirname", &["a/b/c.txt".into()]).unwrap(),
            Value::from("a/b")
        );
        assert_eq!(
            call_in(dir, "basename", &["a/b/c.txt".into()]).unwrap(),
            Value::from("c.txt")
        );
        assert_eq!(
            call_in(dir, "abspath", &["/x/./y/../z".into()]).unwrap(),
            Value::from("/x/z")
        );
    }
}
