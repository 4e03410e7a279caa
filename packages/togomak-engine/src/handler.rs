//! Signal handling, daemon tracking and diagnostic aggregation.
//!
//! One handler exists per run. The first interrupt asks every runnable to
//! terminate gracefully; a second one escalates to kill. Runnables extend the
//! shared diagnostics collection under a mutex; the exit code at the end of
//! the run reflects whether any error diagnostic was recorded.

use crate::blocks::Stage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use togomak_expr::{Diagnostics, Severity};
use tracing::{error, info, warn};

pub struct Handler {
    diags: Mutex<Diagnostics>,
    /// Graceful cancellation, shared with every runnable.
    pub terminate: CancellationToken,
    /// Forceful cancellation.
    pub kill: CancellationToken,
    daemons: Mutex<Vec<(Arc<Stage>, JoinHandle<()>)>>,
    completed: Mutex<HashSet<String>>,
    interrupted: std::sync::atomic::AtomicBool,
}

impl Handler {
    pub fn new() -> Arc<Handler> {
        Arc::new(Handler {
            diags: Mutex::new(Diagnostics::new()),
            terminate: CancellationToken::new(),
            kill: CancellationToken::new(),
            daemons: Mutex::new(Vec::new()),
            completed: Mutex::new(HashSet::new()),
            interrupted: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Listen for interrupts: the first terminates, the second kills.
    pub fn start_signal_listener(self: &Arc<Self>) {
        let handler = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupt received, stopping runnables gracefully");
            info!("hit Ctrl+C again to force stop");
            handler
                .interrupted
                .store(true, std::sync::atomic::Ordering::SeqCst);
            handler.request_terminate();

            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("second interrupt received, killing runnables");
            handler.kill.cancel();
        });
    }

    pub fn request_terminate(&self) {
        self.terminate.cancel();
        for (stage, _) in self.daemons.lock().iter() {
            stage.request_terminate();
        }
    }

    pub fn extend_diags(&self, diags: Diagnostics) {
        if diags.is_empty() {
            return;
        }
        self.diags.lock().extend(diags);
    }

    pub fn has_errors(&self) -> bool {
        self.diags.lock().has_errors()
    }

    pub fn mark_completed(&self, node_key: &str) {
        self.completed.lock().insert(node_key.to_string());
    }

    pub fn all_completed(&self, node_keys: &[String]) -> bool {
        let completed = self.completed.lock();
        node_keys.iter().all(|key| completed.contains(key))
    }

    pub fn track_daemon(&self, stage: Arc<Stage>, handle: JoinHandle<()>) {
        self.daemons.lock().push((stage, handle));
    }

    pub fn has_daemons(&self) -> bool {
        !self.daemons.lock().is_empty()
    }

    /// Whether the run was stopped by an interrupt (as opposed to a normal
    /// failure or completion).
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Ask every tracked daemon to stop gracefully.
    pub fn terminate_daemons(&self) {
        for (stage, _) in self.daemons.lock().iter() {
            stage.request_terminate();
        }
    }

    /// Wait for every tracked daemon task to finish.
    pub async fn daemon_wait(&self) {
        loop {
            let entry = self.daemons.lock().pop();
            match entry {
                Some((_, handle)) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    /// Render all collected diagnostics and return the process exit code.
    pub fn finish(&self) -> i32 {
        let diags = self.diags.lock();
        for diag in diags.iter() {
            match diag.severity {
                Severity::Error => error!("{}: {}", diag.summary, diag.detail),
                Severity::Warning => warn!("{}: {}", diag.summary, diag.detail),
            }
        }
        if diags.has_errors() {
            1
        } else {
            0
        }
    }
}

impl Stage {
    /// Ask this stage's run to stop gracefully. Idempotent.
    pub fn request_terminate(&self) {
        self.state
            .terminated
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.state.terminate_token.cancel();
        #[cfg(unix)]
        {
            let pid = self.state.pid.load(std::sync::atomic::Ordering::SeqCst);
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
        }
    }

    /// Kill this stage's process immediately. Idempotent.
    pub fn request_kill(&self) {
        self.state
            .terminated
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.state.kill_token.cancel();
        #[cfg(unix)]
        {
            let pid = self.state.pid.load(std::sync::atomic::Ordering::SeqCst);
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }

    pub fn was_terminated(&self) -> bool {
        self.state
            .terminated
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use togomak_expr::Diagnostic;

    #[test]
    fn test_diag_aggregation_and_exit_code() {
        let handler = Handler::new();
        assert_eq!(handler.finish(), 0);
        handler.extend_diags(Diagnostic::warning("w", "warning only").into());
        assert_eq!(handler.finish(), 0);
        handler.extend_diags(Diagnostic::error("e", "boom").into());
        assert!(handler.has_errors());
        assert_eq!(handler.finish(), 1);
    }

    #[test]
    fn test_completion_tracking() {
        let handler = Handler::new();
        handler.mark_completed("stage.a");
        assert!(handler.all_completed(&["stage.a".to_string()]));
        assert!(!handler.all_completed(&["stage.a".to_string(), "stage.b".to_string()]));
    }
}
