use crate::connection::{Connection, ConnectionStatus, Credentials, DEFAULT_TIMEOUT};
use crate::error::{NetError, Result};
use crate::reply::{Reply, ReplyStatus, ReplyWork};
use molq_core::config::AuthMethod;
use molq_core::{log_debug, log_trace};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Execution environment on this machine. Commands run as child processes
/// of the calling application; file transfers are plain copies.
pub struct LocalConnection {
    status: ConnectionStatus,
    timeout: Duration,
    hostname: String,
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalConnection {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Closed,
            timeout: DEFAULT_TIMEOUT,
            hostname: "localhost".to_string(),
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.status == ConnectionStatus::Authenticated {
            Ok(())
        } else {
            Err(NetError::NotConnected)
        }
    }
}

fn run_process(command: String, timeout: Duration, work: &ReplyWork) {
    work.set_running();
    log_trace!("LocalConnection executing: {}", command);

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            work.finish(
                ReplyStatus::Error,
                format!("Failed to launch command '{}': {}", command, e),
            );
            return;
        }
    };

    // Drain the pipes off-thread so a chatty command cannot fill the pipe
    // buffer and wedge itself before try_wait sees it exit.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    loop {
        if work.interrupted() {
            let _ = child.kill();
            let _ = child.wait();
            work.finish(ReplyStatus::Interrupted, String::new());
            return;
        }

        match child.try_wait() {
            Ok(Some(_exit)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    work.finish(
                        ReplyStatus::TimedOut,
                        format!("Command timed out: {}", command),
                    );
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                work.finish(ReplyStatus::Error, format!("Failed to wait on child: {}", e));
                return;
            }
        }
    }

    let mut output = stdout
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let errors = stderr
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if output.trim().is_empty() && !errors.trim().is_empty() {
        output = errors;
    }

    work.finish(ReplyStatus::Finished, output.trim().to_string());
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = pipe.read_to_string(&mut text);
            text
        })
    })
}

fn copy_file(source: &Path, destination: &Path, work: &ReplyWork) -> Result<()> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs_err::create_dir_all(parent)?;
        }
    }
    fs_err::copy(source, destination)?;
    work.report_progress(1.0);
    Ok(())
}

impl Connection for LocalConnection {
    fn open(&mut self) -> Result<()> {
        if self.status == ConnectionStatus::Closed {
            self.status = ConnectionStatus::Opened;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.status = ConnectionStatus::Closed;
    }

    fn authenticate(&mut self, _method: AuthMethod, _credentials: &Credentials) -> Result<()> {
        self.status = ConnectionStatus::Authenticated;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn execute(&self, command: &str) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let command = command.to_string();
        let timeout = self.timeout;
        reply.set_starter(Box::new(move || {
            thread::spawn(move || run_process(command, timeout, &work));
        }));
        Ok(reply)
    }

    fn put_file(&self, source: &Path, destination: &str) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let source = source.to_path_buf();
        let destination = PathBuf::from(shellexpand_path(destination));
        reply.set_starter(Box::new(move || {
            thread::spawn(move || {
                work.set_running();
                match copy_file(&source, &destination, &work) {
                    Ok(()) => work.finish(ReplyStatus::Finished, String::new()),
                    Err(e) => work.finish(ReplyStatus::Error, e.to_string()),
                }
            });
        }));
        Ok(reply)
    }

    fn get_file(&self, source: &str, destination: &Path) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let source = PathBuf::from(shellexpand_path(source));
        let destination = destination.to_path_buf();
        reply.set_starter(Box::new(move || {
            thread::spawn(move || {
                work.set_running();
                match copy_file(&source, &destination, &work) {
                    Ok(()) => work.finish(ReplyStatus::Finished, String::new()),
                    Err(e) => work.finish(ReplyStatus::Error, e.to_string()),
                }
            });
        }));
        Ok(reply)
    }

    fn get_files(&self, sources: &[String], destination_dir: &Path) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let sources: Vec<PathBuf> = sources.iter().map(|s| shellexpand_path(s).into()).collect();
        let destination_dir = destination_dir.to_path_buf();
        reply.set_starter(Box::new(move || {
            thread::spawn(move || {
                work.set_running();
                let total = sources.len().max(1) as f64;
                let mut failures = Vec::new();

                for (index, source) in sources.iter().enumerate() {
                    if work.interrupted() {
                        work.finish(ReplyStatus::Interrupted, String::new());
                        return;
                    }
                    let Some(file_name) = source.file_name() else {
                        failures.push(format!("{}: no file name", source.display()));
                        continue;
                    };
                    let destination = destination_dir.join(file_name);
                    if let Err(e) = copy_file(source, &destination, &work) {
                        failures.push(format!("{}: {}", source.display(), e));
                    }
                    work.report_progress((index + 1) as f64 / total);
                }

                if failures.is_empty() {
                    work.finish(ReplyStatus::Finished, String::new());
                } else {
                    work.finish(ReplyStatus::Error, failures.join("\n"));
                }
            });
        }));
        Ok(reply)
    }

    // The shell sentinel pattern is pointless on the local filesystem.
    fn exists(&self, path: &str) -> Result<bool> {
        self.check_connected()?;
        Ok(Path::new(&shellexpand_path(path)).exists())
    }

    fn make_directory(&self, path: &str) -> Result<bool> {
        self.check_connected()?;
        log_debug!("Creating local directory {}", path);
        Ok(fs_err::create_dir_all(shellexpand_path(path)).is_ok())
    }

    fn remove_directory(&self, path: &str) -> Result<bool> {
        self.check_connected()?;
        log_debug!("Removing local directory {}", path);
        Ok(fs_err::remove_dir_all(shellexpand_path(path)).is_ok())
    }
}

fn shellexpand_path(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn connected() -> LocalConnection {
        let mut connection = LocalConnection::new();
        connection.open().unwrap();
        connection
            .authenticate(AuthMethod::None, &Credentials::default())
            .unwrap();
        connection
    }

    #[test]
    fn test_requires_authentication() {
        let connection = LocalConnection::new();
        assert!(matches!(
            connection.execute("true"),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn test_execute_captures_output() {
        let connection = connected();
        let (ok, message) = connection.blocking_execute("echo hello").unwrap();
        assert!(ok);
        assert_eq!(message, "hello");
    }

    #[test]
    fn test_execute_times_out() {
        let mut connection = connected();
        connection.set_timeout(Duration::from_millis(200));
        let reply = connection.execute("sleep 5").unwrap();
        reply.start();
        assert_eq!(reply.wait(), ReplyStatus::TimedOut);
    }

    #[test]
    fn test_interrupt_reports_interrupted() {
        let connection = connected();
        let reply = connection.execute("sleep 5").unwrap();
        reply.start();

        let (tx, rx) = mpsc::channel();
        reply.notify_on_finish(tx, 1);

        thread::sleep(Duration::from_millis(100));
        reply.interrupt();

        assert_eq!(reply.wait(), ReplyStatus::Interrupted);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(rx.try_recv().is_err(), "finished must fire exactly once");
    }

    #[test]
    fn test_file_round_trip_and_helpers() {
        let connection = connected();
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("input.inp");
        fs_err::write(&source, "$molecule\n0 1\nHe\n$end\n").unwrap();

        let dest = dir.path().join("run").join("input.inp");
        let reply = connection
            .put_file(&source, dest.to_str().unwrap())
            .unwrap();
        reply.start();
        assert_eq!(reply.wait(), ReplyStatus::Finished);
        assert!(connection.exists(dest.to_str().unwrap()).unwrap());

        let sub = dir.path().join("sub");
        assert!(connection.make_directory(sub.to_str().unwrap()).unwrap());
        assert!(connection.remove_directory(sub.to_str().unwrap()).unwrap());
        assert!(!connection.exists(sub.to_str().unwrap()).unwrap());
    }

    #[test]
    fn test_get_files_aggregates_failures() {
        let connection = connected();
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.out");
        fs_err::write(&good, "ok").unwrap();

        let sources = vec![
            good.to_string_lossy().to_string(),
            dir.path().join("missing.out").to_string_lossy().to_string(),
        ];
        let dest = dir.path().join("results");
        fs_err::create_dir_all(&dest).unwrap();

        let reply = connection.get_files(&sources, &dest).unwrap();
        reply.start();
        assert_eq!(reply.wait(), ReplyStatus::Error);
        assert!(dest.join("good.out").exists());
        assert!(reply.message().contains("missing.out"));
    }
}
