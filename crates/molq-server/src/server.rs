use crate::error::{Result, ServerError};
use crate::parse;
use molq_core::config::{ConnectionKind, ServerConfig};
use molq_core::job::{Job, JobStatus};
use molq_core::{log_debug, log_error, log_trace, log_warn};
use molq_net::ssh::TransferBackend;
use molq_net::{
    Connection, Credentials, HttpConnection, LocalConnection, NetError, Reply, ReplyStatus,
    SshConnection,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Jobs are shared between the caller and the server's watch set; dropping
/// every clone of the handle is how a caller abandons a job.
pub type JobHandle = Arc<Mutex<Job>>;

pub fn job_handle(job: Job) -> JobHandle {
    Arc::new(Mutex::new(job))
}

// What the in-flight reply was issued for; drives the completion chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    CopyInput,
    CopyRunFile,
    SubmitCommand,
    Query,
    Kill,
    ListFiles,
    CopyFiles,
}

struct Pending {
    job: JobHandle,
    action: Action,
    reply: Reply,
    // Keeps the staged input/run file alive until its transfer finishes.
    _staged: Option<NamedTempFile>,
}

/// The runtime pairing of one ServerConfiguration with its live Connection.
/// All state is owned by the thread driving `tick`/`process_events`;
/// transports marshal their completions back over the event channel, so no
/// further locking is needed.
pub struct Server {
    config: ServerConfig,
    credentials: Credentials,
    connection: Option<Box<dyn Connection>>,
    watched: Vec<JobHandle>,
    active: HashMap<u64, Pending>,
    next_reply_id: u64,
    events_tx: Sender<u64>,
    events_rx: Receiver<u64>,
    last_poll: Option<Instant>,
    polling: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            credentials: Credentials::for_user(&config.user),
            config,
            connection: None,
            watched: Vec::new(),
            active: HashMap::new(),
            next_reply_id: 0,
            events_tx,
            events_rx,
            last_poll: None,
            polling: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Credentials used the next time the connection authenticates.
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }

    pub fn is_local(&self) -> bool {
        self.config.is_local()
    }

    pub fn is_web_based(&self) -> bool {
        self.config.is_web_based()
    }

    pub fn watched_jobs(&self) -> &[JobHandle] {
        &self.watched
    }

    fn make_connection(&self) -> Box<dyn Connection> {
        let host = &self.config.host;
        let port = self.config.port;
        match self.config.connection {
            ConnectionKind::Local => Box::new(LocalConnection::new()),
            ConnectionKind::Ssh => Box::new(SshConnection::new(host, port)),
            ConnectionKind::Sftp => {
                Box::new(SshConnection::with_backend(host, port, TransferBackend::Sftp))
            }
            ConnectionKind::Http => Box::new(HttpConnection::new(host, port)),
            ConnectionKind::Https => Box::new(HttpConnection::with_security(host, port, true)),
        }
    }

    /// Lazily creates, opens and authenticates the connection. Idempotent;
    /// a failure discards the connection so the next call starts afresh.
    pub fn open(&mut self) -> Result<()> {
        if self.connection.as_ref().is_some_and(|c| c.is_connected()) {
            return Ok(());
        }

        log_trace!("Opening server {}", self.name());

        let mut credentials = self.credentials.clone();
        if credentials.user.is_empty() {
            credentials.user = self.config.user.clone();
        }
        if self.config.is_web_based() && !self.config.cookie.is_empty() {
            credentials.cookie = Some(self.config.cookie.clone());
        }
        let method = self.config.authentication;

        if self.connection.is_none() {
            self.connection = Some(self.make_connection());
        }
        let connection = self.connection.as_mut().unwrap();

        let result = connection
            .open()
            .and_then(|_| connection.authenticate(method, &credentials));

        match result {
            Ok(()) => {
                if let Some(cookie) = connection.session_cookie() {
                    // Web sessions hand back a token that must be persisted
                    // with the configuration.
                    self.config.cookie = cookie;
                }
                if !self.watched.is_empty() {
                    self.start_polling();
                }
                Ok(())
            }
            Err(source) => {
                self.connection = None;
                Err(ServerError::ConnectionFailed {
                    name: self.name().to_string(),
                    source,
                })
            }
        }
    }

    pub fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    fn connection(&self) -> Result<&dyn Connection> {
        self.connection
            .as_deref()
            .ok_or(ServerError::Net(NetError::NotConnected))
    }

    fn is_busy(&self, job: &JobHandle) -> bool {
        self.active.values().any(|p| Arc::ptr_eq(&p.job, job))
    }

    fn job_name(job: &JobHandle) -> String {
        job.lock().unwrap().base_name().to_string()
    }

    /// Server-level macro pass. Any leading HTTP verb is stripped here; the
    /// transport re-applies it according to which operation is invoked.
    pub fn substitute_macros(&self, input: &str) -> String {
        let trimmed = input.trim();
        let stripped = trimmed
            .strip_prefix("POST")
            .or_else(|| trimmed.strip_prefix("GET"))
            .unwrap_or(trimmed);

        stripped
            .trim()
            .replace("${COOKIE}", &self.config.cookie)
            .replace("${USERNAME}", &self.config.user)
            .replace("${SERVERNAME}", &self.config.name)
    }

    fn register(
        &mut self,
        reply: Reply,
        job: &JobHandle,
        action: Action,
        staged: Option<NamedTempFile>,
    ) {
        let id = self.next_reply_id;
        self.next_reply_id += 1;
        reply.notify_on_finish(self.events_tx.clone(), id);
        self.active.insert(
            id,
            Pending {
                job: Arc::clone(job),
                action,
                reply,
                _staged: staged,
            },
        );
        if let Some(pending) = self.active.get(&id) {
            pending.reply.start();
        }
    }

    fn fill_in_directories(&self, job: &JobHandle) {
        let mut job = job.lock().unwrap();
        if job.remote_working_directory().is_empty() {
            let base = self.config.expanded_working_directory();
            let dir = format!("{}/{}", base.trim_end_matches('/'), job.base_name());
            job.set_remote_working_directory(&dir);
        }
        if job.local_working_directory().is_empty() {
            let dir = job.remote_working_directory().to_string();
            job.set_local_working_directory(&dir);
        }
    }

    // ---------- submit ----------

    /// Stages the job's input and drives the submission chain:
    /// copy input -> copy run file -> submit command -> parse the job id.
    /// Web services skip the middle steps and POST the input directly.
    pub fn submit(&mut self, job: &JobHandle) -> Result<()> {
        let name = Self::job_name(job);
        log_debug!("Request to submit job {}", name);

        if self.watched.iter().any(|w| Arc::ptr_eq(w, job)) {
            return Err(ServerError::DuplicateJob(name));
        }
        if self.is_busy(job) {
            return Err(ServerError::BusyJob(name));
        }

        self.open()?;
        self.fill_in_directories(job);

        let input = job.lock().unwrap().input().to_string();
        let staged = write_temporary_file(&input)?;
        log_debug!("Input file contents written to {}", staged.path().display());

        if self.config.is_web_based() {
            let submit = self.substitute_macros(&self.config.submit.clone());
            let submit = job.lock().unwrap().substitute_macros(&submit);
            let reply = self.connection()?.put_file(staged.path(), &submit)?;
            self.register(reply, job, Action::SubmitCommand, Some(staged));
        } else {
            let (directory, destination) = {
                let job = job.lock().unwrap();
                let directory = job.remote_working_directory().to_string();
                let destination = format!("{}/{}.inp", directory, job.base_name());
                (directory, destination)
            };

            if !self.connection()?.make_directory(&directory)? {
                return Err(ServerError::Net(NetError::Protocol(format!(
                    "Failed to create remote working directory {}",
                    directory
                ))));
            }

            let reply = self.connection()?.put_file(staged.path(), &destination)?;
            self.register(reply, job, Action::CopyInput, Some(staged));
        }

        Ok(())
    }

    fn copy_run_file(&mut self, job: &JobHandle) -> Result<()> {
        let template = self.substitute_macros(&self.config.run_file_template.clone());
        let mut contents = job.lock().unwrap().substitute_macros(&template);
        contents.push('\n');

        let staged = write_temporary_file(&contents)?;
        log_debug!("Run file contents written to {}", staged.path().display());

        let destination = {
            let job = job.lock().unwrap();
            format!("{}/{}.run", job.remote_working_directory(), job.base_name())
        };

        let reply = self.connection()?.put_file(staged.path(), &destination)?;
        self.register(reply, job, Action::CopyRunFile, Some(staged));
        Ok(())
    }

    fn queue_job(&mut self, job: &JobHandle) -> Result<()> {
        let submit = self.substitute_macros(&self.config.submit.clone());
        let submit = job.lock().unwrap().substitute_macros(&submit);
        log_debug!("Executing submit command: {}", submit);

        let reply = self.connection()?.execute(&submit)?;
        self.register(reply, job, Action::SubmitCommand, None);
        Ok(())
    }

    // ---------- query ----------

    /// Issues one status query for the job. A job with a request already in
    /// flight is skipped; the next poll will catch up with it.
    pub fn query(&mut self, job: &JobHandle) -> Result<()> {
        if self.is_busy(job) {
            log_debug!("Query on busy job {}", Self::job_name(job));
            return Ok(());
        }

        self.open()?;

        let query = self.substitute_macros(&self.config.query.clone());
        let query = job.lock().unwrap().substitute_macros(&query);
        log_trace!("Query string: {}", query);

        let reply = self.connection()?.execute(&query)?;
        self.register(reply, job, Action::Query, None);
        Ok(())
    }

    /// Poll-timer entry point: one query per watched job. Stops the timer
    /// when the watch set is empty.
    pub fn query_all_jobs(&mut self) -> Result<()> {
        if self.watched.is_empty() {
            self.polling = false;
            return Ok(());
        }

        self.open()?;
        for job in self.watched.clone() {
            self.query(&job)?;
        }
        Ok(())
    }

    // ---------- kill ----------

    /// Best effort: the job is marked Killed and unwatched when the kill
    /// command completes, whether or not the scheduler obliged.
    pub fn kill(&mut self, job: &JobHandle) -> Result<()> {
        if self.is_busy(job) {
            return Err(ServerError::BusyJob(Self::job_name(job)));
        }

        self.open()?;

        let kill = self.substitute_macros(&self.config.kill.clone());
        let kill = job.lock().unwrap().substitute_macros(&kill);
        log_debug!("Kill string: {}", kill);

        let reply = self.connection()?.execute(&kill)?;
        self.register(reply, job, Action::Kill, None);
        Ok(())
    }

    // ---------- copy results ----------

    /// Lists the job's remote files and fetches them into the local working
    /// directory. A no-op for local servers, where the results are already
    /// in place.
    pub fn copy_results(&mut self, job: &JobHandle) -> Result<()> {
        if self.is_local() {
            return Ok(());
        }
        if self.is_busy(job) {
            return Err(ServerError::BusyJob(Self::job_name(job)));
        }

        self.open()?;

        let list = self.substitute_macros(&self.config.job_file_list.clone());
        let list = job.lock().unwrap().substitute_macros(&list);
        log_debug!("List file command: {}", list);

        job.lock().unwrap().set_status(JobStatus::Copying, None);
        let reply = self.connection()?.execute(&list)?;
        self.register(reply, job, Action::ListFiles, None);
        Ok(())
    }

    /// Aborts an in-flight result copy; the job is marked Error with a
    /// cancellation message and the transfer interrupted.
    pub fn cancel_copy(&mut self, job: &JobHandle) {
        let id = self
            .active
            .iter()
            .find(|(_, p)| Arc::ptr_eq(&p.job, job))
            .map(|(id, _)| *id);

        let Some(id) = id else {
            log_warn!("cancel_copy: no request in flight for {}", Self::job_name(job));
            return;
        };

        if let Some(pending) = self.active.remove(&id) {
            job.lock()
                .unwrap()
                .set_status(JobStatus::Error, Some("Copy canceled"));
            pending.reply.interrupt();
        }
    }

    // ---------- synchronous helpers ----------

    /// Fetches the scheduler's queue description (qstat -fQ, sinfo, ...).
    pub fn queue_info(&mut self) -> Result<String> {
        self.open()?;
        let command = self.substitute_macros(&self.config.queue_info.clone());
        let (_ok, message) = self.connection()?.blocking_execute(&command)?;
        Ok(message)
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        self.open()?;
        Ok(self.connection()?.exists(path)?)
    }

    pub fn make_directory(&mut self, path: &str) -> Result<bool> {
        self.open()?;
        Ok(self.connection()?.make_directory(path)?)
    }

    pub fn remove_directory(&mut self, path: &str) -> Result<bool> {
        self.open()?;
        Ok(self.connection()?.remove_directory(path)?)
    }

    // ---------- watch set / polling ----------

    pub fn watch_job(&mut self, job: &JobHandle) {
        if !self.watched.iter().any(|w| Arc::ptr_eq(w, job)) {
            self.watched.push(Arc::clone(job));
        }
        if self.connection.as_ref().is_some_and(|c| c.is_connected()) {
            self.start_polling();
        }
    }

    pub fn unwatch_job(&mut self, job: &JobHandle) {
        self.watched.retain(|w| !Arc::ptr_eq(w, job));
        if self.watched.is_empty() {
            self.polling = false;
        }
    }

    fn start_polling(&mut self) {
        if !self.polling {
            self.polling = true;
            self.last_poll = None;
        }
    }

    /// Drives the server from its owning thread: processes completions and
    /// fires the poll timer when due. Call this regularly (or use `pump`).
    pub fn tick(&mut self) -> Result<()> {
        self.process_events()?;

        if self.polling && !self.watched.is_empty() {
            let interval = Duration::from_secs(self.config.update_interval.max(1));
            let due = self.last_poll.map_or(true, |last| last.elapsed() >= interval);
            if due {
                self.last_poll = Some(Instant::now());
                self.query_all_jobs()?;
            }
        }

        self.process_events()
    }

    /// Drains the completion channel. Must only be called from the thread
    /// that owns the server; this is the single writer for all job state.
    pub fn process_events(&mut self) -> Result<()> {
        while let Ok(id) = self.events_rx.try_recv() {
            self.handle_reply(id)?;
        }
        Ok(())
    }

    /// Blocks up to `timeout` for one completion, then drains whatever else
    /// arrived. Returns true if anything was processed.
    pub fn pump(&mut self, timeout: Duration) -> Result<bool> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(id) => {
                self.handle_reply(id)?;
                self.process_events()?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn handle_reply(&mut self, id: u64) -> Result<()> {
        // cancel_copy may already have removed the entry.
        let Some(pending) = self.active.remove(&id) else {
            return Ok(());
        };

        let status = pending.reply.status();
        let message = pending.reply.message();
        let job = pending.job;

        match pending.action {
            Action::CopyInput => {
                if status != ReplyStatus::Finished {
                    log_error!("Input copy failed: {}", message);
                    job.lock().unwrap().set_status(JobStatus::Error, Some(&message));
                    return Ok(());
                }
                self.copy_run_file(&job)
            }

            Action::CopyRunFile => {
                if status != ReplyStatus::Finished {
                    log_error!("Run file copy failed: {}", message);
                    job.lock().unwrap().set_status(JobStatus::Error, Some(&message));
                    return Ok(());
                }
                self.queue_job(&job)
            }

            Action::SubmitCommand => {
                let queue_system = self.config.queue_system;
                let job_id = (status == ReplyStatus::Finished)
                    .then(|| parse::parse_submit_output(queue_system, &message))
                    .flatten();

                match job_id {
                    Some(job_id) => {
                        log_debug!("Job submitted with id {}", job_id);
                        {
                            let mut job = job.lock().unwrap();
                            job.set_job_id(&job_id);
                            job.set_status(JobStatus::Queued, None);
                        }
                        self.watch_job(&job);
                    }
                    None => {
                        job.lock().unwrap().set_status(JobStatus::Error, Some(&message));
                    }
                }
                Ok(())
            }

            Action::Query => {
                if status != ReplyStatus::Finished {
                    job.lock().unwrap().set_status(JobStatus::Unknown, Some(&message));
                    return Ok(());
                }

                let queue_system = self.config.queue_system;
                let scraped = {
                    let job = job.lock().unwrap();
                    parse::parse_query_output(queue_system, job.job_id(), &message)
                };

                match scraped.status {
                    Some(new_status) => {
                        if !new_status.is_active() {
                            self.unwatch_job(&job);
                        }
                        let mut job = job.lock().unwrap();
                        if let Some(seconds) = scraped.run_time {
                            job.reset_timer(seconds);
                        }
                        job.set_status(new_status, scraped.message.as_deref());
                    }
                    None => {
                        job.lock().unwrap().set_status(JobStatus::Unknown, Some(&message));
                    }
                }
                Ok(())
            }

            Action::Kill => {
                self.unwatch_job(&job);
                job.lock().unwrap().set_status(JobStatus::Killed, Some(&message));
                Ok(())
            }

            Action::ListFiles => {
                if status != ReplyStatus::Finished {
                    job.lock().unwrap().set_status(JobStatus::Error, Some("Copy failed"));
                    return Ok(());
                }

                let mut files = parse::parse_file_list(&message);
                if self.config.is_web_based() {
                    // Each entry becomes a full download query.
                    let download = self.substitute_macros(&self.config.queue_info.clone());
                    let download = job.lock().unwrap().substitute_macros(&download);
                    files = files
                        .iter()
                        .map(|name| download.replace("${FILE_NAME}", name))
                        .collect();
                }

                let destination = job.lock().unwrap().local_working_directory().to_string();
                fs_err::create_dir_all(&destination)?;

                let reply = self
                    .connection()?
                    .get_files(&files, Path::new(&destination))?;
                let progress_job = Arc::clone(&job);
                reply.on_progress(move |fraction| {
                    progress_job.lock().unwrap().set_copy_progress(fraction);
                });
                self.register(reply, &job, Action::CopyFiles, None);
                Ok(())
            }

            Action::CopyFiles => {
                let mut job = job.lock().unwrap();
                if status == ReplyStatus::Finished {
                    let message = format!("Results in: {}", job.local_working_directory());
                    job.set_status(JobStatus::Finished, Some(&message));
                } else {
                    log_error!("Result copy failed: {}", message);
                    job.set_status(JobStatus::Error, Some("Copy failed"));
                }
                Ok(())
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close_connection();
    }
}

fn write_temporary_file(contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix("molq-").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use molq_core::config::QueueSystem;

    fn web_server() -> Server {
        let mut config = ServerConfig::new("qcloud", ConnectionKind::Http, QueueSystem::Web);
        config.cookie = "c00kie".to_string();
        config.user = "guest".to_string();
        Server::new(config)
    }

    #[test]
    fn test_server_macro_substitution() {
        let server = web_server();
        assert_eq!(server.substitute_macros("${COOKIE}"), "c00kie");
        assert_eq!(server.substitute_macros("${USERNAME}"), "guest");
        assert_eq!(server.substitute_macros("${SERVERNAME}"), "qcloud");
        assert_eq!(server.substitute_macros("${NOT_A_MACRO}"), "${NOT_A_MACRO}");
    }

    #[test]
    fn test_http_verb_prefix_is_stripped() {
        let server = web_server();
        assert_eq!(
            server.substitute_macros("GET  /status?cookie=${COOKIE}"),
            "/status?cookie=c00kie"
        );
        assert_eq!(
            server.substitute_macros("POST /submit?cookie=${COOKIE}"),
            "/submit?cookie=c00kie"
        );
    }

    #[test]
    fn test_server_then_job_macro_passes_compose() {
        let server = web_server();
        let job = {
            let mut job = Job::new("water", "qcloud", "");
            job.set_job_id("42");
            job
        };
        let first = server.substitute_macros("GET /status?cookie=${COOKIE}&jobid=${JOB_ID}");
        let second = job.substitute_macros(&first);
        assert_eq!(second, "/status?cookie=c00kie&jobid=42");
    }

    #[test]
    fn test_watch_and_unwatch_stop_polling() {
        let mut server = web_server();
        let job = job_handle(Job::new("water", "qcloud", ""));

        server.watch_job(&job);
        assert_eq!(server.watched_jobs().len(), 1);
        server.watch_job(&job);
        assert_eq!(server.watched_jobs().len(), 1, "watch must be idempotent");

        server.unwatch_job(&job);
        assert!(server.watched_jobs().is_empty());
        assert!(!server.polling);
    }

    #[test]
    fn test_kill_rejects_missing_connection_config() {
        // A kill on an unopenable server must surface the connection error
        // rather than silently dropping the request.
        let mut config = ServerConfig::new("bad", ConnectionKind::Ssh, QueueSystem::Pbs);
        config.host = "".to_string();
        let mut server = Server::new(config);
        let job = job_handle(Job::new("water", "bad", ""));
        assert!(server.kill(&job).is_err());
    }
}
