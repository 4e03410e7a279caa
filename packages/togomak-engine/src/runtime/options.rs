//! Per-invocation options threaded into runnables: hook status, parent
//! identity, and the stage status hooks observe as `this.status`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Running,
    Success,
    Failure,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parent {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunnableOptions {
    pub status: Status,
    pub hook: bool,
    pub parent: Option<Parent>,
}

impl RunnableOptions {
    pub fn hook(status: Status, parent: Parent) -> Self {
        RunnableOptions {
            status,
            hook: true,
            parent: Some(parent),
        }
    }
}
