use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Waiting,
    Running,
    Finished,
    Error,
    TimedOut,
    Interrupted,
}

impl ReplyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplyStatus::Finished
                | ReplyStatus::Error
                | ReplyStatus::TimedOut
                | ReplyStatus::Interrupted
        )
    }
}

struct ReplyState {
    status: ReplyStatus,
    message: String,
}

type ProgressCallback = Box<dyn Fn(f64) + Send>;

pub(crate) struct ReplyShared {
    state: Mutex<ReplyState>,
    done: Condvar,
    interrupt: AtomicBool,
    progress: Mutex<Option<ProgressCallback>>,
    notify: Mutex<Option<(Sender<u64>, u64)>>,
}

impl ReplyShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReplyState {
                status: ReplyStatus::Waiting,
                message: String::new(),
            }),
            done: Condvar::new(),
            interrupt: AtomicBool::new(false),
            progress: Mutex::new(None),
            notify: Mutex::new(None),
        }
    }

    pub(crate) fn set_running(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == ReplyStatus::Waiting {
            state.status = ReplyStatus::Running;
        }
    }

    /// Records the terminal state. The first terminal transition wins and
    /// fires the completion notification exactly once.
    pub(crate) fn finish(&self, status: ReplyStatus, message: String) {
        debug_assert!(status.is_terminal());
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.message = message;
        }
        self.done.notify_all();

        if let Some((sender, id)) = self.notify.lock().unwrap().take() {
            let _ = sender.send(id);
        }
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub(crate) fn report_progress(&self, fraction: f64) {
        if let Some(callback) = self.progress.lock().unwrap().as_ref() {
            callback(fraction);
        }
    }
}

/// Worker-side handle for the transport running the operation. Dropping a
/// work handle that never reached a terminal state interrupts the reply, so
/// requests abandoned by a closing connection are not left waiting forever.
pub(crate) struct ReplyWork {
    shared: Arc<ReplyShared>,
}

impl ReplyWork {
    pub(crate) fn set_running(&self) {
        self.shared.set_running();
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.shared.interrupted()
    }

    pub(crate) fn report_progress(&self, fraction: f64) {
        self.shared.report_progress(fraction);
    }

    pub(crate) fn finish(&self, status: ReplyStatus, message: String) {
        self.shared.finish(status, message);
    }
}

impl Drop for ReplyWork {
    fn drop(&mut self) {
        self.shared
            .finish(ReplyStatus::Interrupted, "Connection closed".to_string());
    }
}

type Starter = Box<dyn FnOnce() + Send>;

/// Caller-side handle to one asynchronous request. Created by a Connection
/// factory method in the Waiting state; nothing happens until `start()`.
pub struct Reply {
    shared: Arc<ReplyShared>,
    starter: Mutex<Option<Starter>>,
}

impl Reply {
    pub(crate) fn new() -> (Self, ReplyWork) {
        let shared = Arc::new(ReplyShared::new());
        let work = ReplyWork {
            shared: Arc::clone(&shared),
        };
        let reply = Self {
            shared,
            starter: Mutex::new(None),
        };
        (reply, work)
    }

    pub(crate) fn set_starter(&self, starter: Starter) {
        *self.starter.lock().unwrap() = Some(starter);
    }

    pub(crate) fn shared_weak(&self) -> Weak<ReplyShared> {
        Arc::downgrade(&self.shared)
    }

    /// Begins the operation. Calling start more than once is a no-op.
    pub fn start(&self) {
        if let Some(starter) = self.starter.lock().unwrap().take() {
            starter();
        }
    }

    pub fn status(&self) -> ReplyStatus {
        self.shared.state.lock().unwrap().status
    }

    pub fn message(&self) -> String {
        self.shared.state.lock().unwrap().message.clone()
    }

    /// Requests cancellation. Transports honour the flag at their next
    /// blocking-call boundary and report Interrupted, not Error.
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.shared.interrupted()
    }

    /// Registers a progress observer (fraction in [0, 1]) invoked from the
    /// transport's worker context after every transferred buffer.
    pub fn on_progress<F: Fn(f64) + Send + 'static>(&self, callback: F) {
        *self.shared.progress.lock().unwrap() = Some(Box::new(callback));
    }

    /// Registers the completion channel. The id is sent exactly once, when
    /// the reply reaches a terminal state.
    pub fn notify_on_finish(&self, sender: Sender<u64>, id: u64) {
        let already_terminal = self.status().is_terminal();
        if already_terminal {
            let _ = sender.send(id);
        } else {
            *self.shared.notify.lock().unwrap() = Some((sender, id));
        }
    }

    /// Blocks until the reply reaches a terminal state.
    pub fn wait(&self) -> ReplyStatus {
        let mut state = self.shared.state.lock().unwrap();
        while !state.status.is_terminal() {
            state = self.shared.done.wait(state).unwrap();
        }
        state.status
    }

    /// Blocks up to `timeout`; returns None if the reply is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ReplyStatus> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        while !state.status.is_terminal() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .shared
                .done
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out() && !state.status.is_terminal() {
                return None;
            }
        }
        Some(state.status)
    }

    /// An already-terminal reply, used when an operation fails before it
    /// can be dispatched (for example a missing local file).
    pub(crate) fn failed(message: String) -> Self {
        let (reply, work) = Self::new();
        work.finish(ReplyStatus::Error, message);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_terminal_status_is_sticky() {
        let (reply, work) = Reply::new();
        assert_eq!(reply.status(), ReplyStatus::Waiting);

        work.set_running();
        assert_eq!(reply.status(), ReplyStatus::Running);

        work.finish(ReplyStatus::Finished, "done".to_string());
        assert_eq!(reply.status(), ReplyStatus::Finished);
        assert_eq!(reply.message(), "done");

        work.finish(ReplyStatus::Error, "late failure".to_string());
        assert_eq!(reply.status(), ReplyStatus::Finished);
        assert_eq!(reply.message(), "done");
    }

    #[test]
    fn test_notify_fires_exactly_once() {
        let (reply, work) = Reply::new();
        let (tx, rx) = mpsc::channel();
        reply.notify_on_finish(tx, 7);

        work.finish(ReplyStatus::Finished, String::new());
        work.finish(ReplyStatus::Error, String::new());
        drop(work);

        assert_eq!(rx.recv().unwrap(), 7);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_work_interrupts_reply() {
        let (reply, work) = Reply::new();
        drop(work);
        assert_eq!(reply.status(), ReplyStatus::Interrupted);
    }

    #[test]
    fn test_wait_blocks_until_finished() {
        let (reply, work) = Reply::new();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            work.finish(ReplyStatus::Finished, "ok".to_string());
        });

        assert_eq!(reply.wait(), ReplyStatus::Finished);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_on_stalled_reply() {
        let (reply, work) = Reply::new();
        assert_eq!(reply.wait_timeout(Duration::from_millis(20)), None);
        work.finish(ReplyStatus::Finished, String::new());
        assert_eq!(
            reply.wait_timeout(Duration::from_millis(20)),
            Some(ReplyStatus::Finished)
        );
    }

    #[test]
    fn test_start_runs_starter_once() {
        let (reply, _work) = Reply::new();
        let counter = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&counter);
        reply.set_starter(Box::new(move || {
            assert!(!seen.swap(true, Ordering::SeqCst), "starter ran twice");
        }));
        reply.start();
        reply.start();
        assert!(counter.load(Ordering::SeqCst));
    }
}
