//! The narrow contract the scheduler uses to invoke whatever actually runs a
//! [`crate::run::Run`] (an LLM call, a tool invocation, anything) without
//! depending on it directly: a pluggable backend behind `Arc<dyn Executor>`.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::run::Run;

/// A read-only cooperative-cancel signal. The executor must check it at
/// reasonably chosen points and terminate promptly once it flips `true`.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the signal flips, for executors that want to `select!` on it
    /// instead of polling.
    pub async fn cancelled(&mut self) {
        let _ = self.0.wait_for(|cancelled| *cancelled).await;
    }
}

/// Producer handle paired with a [`CancelSignal`]; owned by the scheduler's
/// executor-invocation task.
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    #[must_use]
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), CancelSignal(rx))
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Advisory classification of an [`ExecutorOutcome::Error`]. The scheduler never
/// auto-retries on either kind; it is surfaced in the `run_failed` event payload
/// so callers can decide whether `retry()` is worth calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// The result of one [`Executor::execute`] invocation.
#[derive(Debug, Clone)]
pub enum ExecutorOutcome {
    Success { output_content: String },
    Error { kind: ErrorKind, message: String },
    Cancelled,
}

/// Callers provide their own implementation; the scheduler never depends on a
/// concrete LLM/tool client. `run`'s `run_id`, `agent_name`, `input_content`,
/// `session_id` are the only fields an executor should read — it must not
/// mutate the `Run` it is handed.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        run: &Run,
        chunk_sink: &(dyn Fn(String) + Send + Sync),
        cancel_signal: CancelSignal,
    ) -> ExecutorOutcome;
}

/// An in-process executor that echoes `input_content` back, splitting it into
/// word-sized chunks. Configurable to simulate transient/permanent failure and
/// cooperative cancellation; ships for demos and tests.
pub struct EchoExecutor {
    behavior: EchoBehavior,
}

#[derive(Clone, Copy, Debug)]
pub enum EchoBehavior {
    Echo,
    FailTransient,
    FailPermanent,
    /// Waits until `cancel_signal` fires, then returns `Cancelled`.
    WaitForCancel,
}

impl EchoExecutor {
    #[must_use]
    pub fn new(behavior: EchoBehavior) -> Self {
        Self { behavior }
    }
}

impl Default for EchoExecutor {
    fn default() -> Self {
        Self::new(EchoBehavior::Echo)
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(
        &self,
        run: &Run,
        chunk_sink: &(dyn Fn(String) + Send + Sync),
        mut cancel_signal: CancelSignal,
    ) -> ExecutorOutcome {
        match self.behavior {
            EchoBehavior::FailTransient => ExecutorOutcome::Error {
                kind: ErrorKind::Transient,
                message: "simulated transient failure".to_string(),
            },
            EchoBehavior::FailPermanent => ExecutorOutcome::Error {
                kind: ErrorKind::Permanent,
                message: "simulated permanent failure".to_string(),
            },
            EchoBehavior::WaitForCancel => {
                cancel_signal.cancelled().await;
                ExecutorOutcome::Cancelled
            }
            EchoBehavior::Echo => {
                for word in run.input_content.split_whitespace() {
                    if cancel_signal.is_cancelled() {
                        return ExecutorOutcome::Cancelled;
                    }
                    chunk_sink(word.to_string());
                }
                ExecutorOutcome::Success {
                    output_content: run.input_content.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Priority;

    #[tokio::test]
    async fn echo_executor_succeeds_and_emits_chunks() {
        let executor = EchoExecutor::default();
        let run = Run::new("a", "hello world", Priority::Normal, None, 3);
        let (_handle, signal) = CancelHandle::new();
        let chunks = std::sync::Mutex::new(Vec::new());
        let sink = |s: String| chunks.lock().unwrap().push(s);
        let outcome = executor.execute(&run, &sink, signal).await;
        match outcome {
            ExecutorOutcome::Success { output_content } => {
                assert_eq!(output_content, "hello world");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(
            chunks.into_inner().unwrap(),
            vec!["hello".to_string(), "world".to_string()]
        );
    }

    #[tokio::test]
    async fn wait_for_cancel_returns_cancelled_once_signalled() {
        let executor = EchoExecutor::new(EchoBehavior::WaitForCancel);
        let run = Run::new("a", "hello", Priority::Normal, None, 3);
        let (handle, signal) = CancelHandle::new();
        let sink = |_: String| {};
        let exec_fut = executor.execute(&run, &sink, signal);
        handle.cancel();
        let outcome = exec_fut.await;
        assert!(matches!(outcome, ExecutorOutcome::Cancelled));
    }
}
