//! Evaluation context: the shared variable and function scope.
//!
//! One [`EvalContext`] exists per run, owned by the scheduler and shared as a
//! [`SharedContext`]. Expression evaluation takes the read lock; publishing a
//! block's outputs takes the write lock, so a dependent can never observe a
//! half-written namespace. The `macro` namespace merge is additionally
//! serialized through its own mutex.

use crate::funcs::Function;
use crate::value::Value;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// The root scope: process-wide variables and the function table.
#[derive(Default)]
pub struct EvalContext {
    variables: HashMap<String, Value>,
    functions: HashMap<String, Function>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_functions(functions: HashMap<String, Function>) -> Self {
        EvalContext {
            variables: HashMap::new(),
            functions,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Publish a value under `ns.path[0].path[1]...`, creating intermediate
    /// objects as needed. Existing sibling entries are preserved.
    pub fn publish(&mut self, ns: &str, path: &[&str], value: Value) {
        let root = self
            .variables
            .entry(ns.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !matches!(root, Value::Object(_) | Value::Map(_)) {
            *root = Value::Object(Default::default());
        }
        let mut cursor = root;
        for segment in path {
            let entries = match cursor {
                Value::Object(m) | Value::Map(m) => m,
                _ => unreachable!("publish cursor is always an object"),
            };
            cursor = entries
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if !matches!(cursor, Value::Object(_) | Value::Map(_)) {
                *cursor = Value::Object(Default::default());
            }
        }
        *cursor = value;
    }
}

/// A read-only view used during evaluation: the root context plus any number
/// of overlay frames (`this`, `param`, `each`, for-expression bindings).
/// Inner frames shadow outer ones, which shadow the root.
pub struct Scope<'a> {
    root: &'a EvalContext,
    frames: Vec<HashMap<String, Value>>,
}

impl<'a> Scope<'a> {
    pub fn new(root: &'a EvalContext) -> Self {
        Scope {
            root,
            frames: Vec::new(),
        }
    }

    pub fn with_vars(root: &'a EvalContext, vars: HashMap<String, Value>) -> Self {
        Scope {
            root,
            frames: vec![vars],
        }
    }

    pub fn push_frame(&mut self, vars: HashMap<String, Value>) {
        self.frames.push(vars);
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.get(name) {
                return Some(v);
            }
        }
        self.root.variable(name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.root.function(name)
    }
}

/// Thread-safe handle to the run's evaluation context.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<RwLock<EvalContext>>,
    macro_lock: Arc<Mutex<()>>,
}

impl SharedContext {
    pub fn new(ctx: EvalContext) -> Self {
        SharedContext {
            inner: Arc::new(RwLock::new(ctx)),
            macro_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, EvalContext> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, EvalContext> {
        self.inner.write()
    }

    pub fn publish(&self, ns: &str, path: &[&str], value: Value) {
        self.inner.write().publish(ns, path, value);
    }

    /// Replace a whole namespace object (used for the between-layer `output`
    /// refresh and the seeded `param` namespace).
    pub fn set_namespace(&self, ns: &str, value: Value) {
        self.inner.write().set_variable(ns, value);
    }

    /// Merge into the `macro` namespace. Sibling macro blocks run
    /// concurrently, so the read-modify-write is serialized separately from
    /// the main lock.
    pub fn publish_macro(&self, id: &str, value: Value) {
        let _guard = self.macro_lock.lock();
        self.inner.write().publish("macro", &[id], value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_creates_namespace_path() {
        let mut ctx = EvalContext::new();
        ctx.publish("stage", &["build", "output"], Value::from("ok"));
        let ns = ctx.variable("stage").unwrap();
        let build = &ns.as_entries().unwrap()["build"];
        assert_eq!(build.as_entries().unwrap()["output"], Value::from("ok"));
    }

    #[test]
    fn test_publish_preserves_siblings() {
        let mut ctx = EvalContext::new();
        ctx.publish("data", &["git", "repo"], Value::from("a"));
        ctx.publish("data", &["git", "other"], Value::from("b"));
        let git = &ctx.variable("data").unwrap().as_entries().unwrap()["git"];
        assert_eq!(git.as_entries().unwrap().len(), 2);
    }

    #[test]
    fn test_scope_frames_shadow_root() {
        let mut ctx = EvalContext::new();
        ctx.set_variable("cwd", Value::from("/root"));
        let mut vars = HashMap::new();
        vars.insert("cwd".to_string(), Value::from("/tmp"));
        let scope = Scope::with_vars(&ctx, vars);
        assert_eq!(scope.lookup("cwd"), Some(&Value::from("/tmp")));
    }

    #[test]
    fn test_shared_context_concurrent_publish() {
        let shared = SharedContext::new(EvalContext::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    shared.publish("stage", &[&format!("s{}", i)], Value::from(i as i64));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let ctx = shared.read();
        assert_eq!(ctx.variable("stage").unwrap().as_entries().unwrap().len(), 8);
    }
}
