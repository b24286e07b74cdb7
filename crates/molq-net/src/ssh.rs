use crate::connection::{Connection, ConnectionStatus, Credentials, DEFAULT_TIMEOUT};
use crate::error::{NetError, Result};
use crate::reply::{Reply, ReplyShared, ReplyStatus, ReplyWork};
use molq_core::config::AuthMethod;
use molq_core::{log_trace, log_warn};
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

// libssh2 session error codes surfaced through ssh2::ErrorCode::Session.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;

// Progress is reported after every buffer, and consumers assume KiB steps.
const TRANSFER_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBackend {
    Scp,
    Sftp,
}

enum SshOp {
    Open {
        response: Sender<Result<()>>,
    },
    Authenticate {
        method: AuthMethod,
        credentials: Credentials,
        response: Sender<Result<()>>,
    },
    Execute {
        command: String,
        work: ReplyWork,
    },
    PutFile {
        source: PathBuf,
        destination: String,
        work: ReplyWork,
    },
    GetFile {
        source: String,
        destination: PathBuf,
        work: ReplyWork,
    },
    GetFiles {
        sources: Vec<String>,
        destination_dir: PathBuf,
        work: ReplyWork,
    },
    Close,
}

/// SSH transport. All libssh2 session work runs on one dedicated worker
/// thread per connection, so every reply on the connection is serialized by
/// construction; the caller-facing handle only exchanges messages with it.
pub struct SshConnection {
    host: String,
    port: u16,
    timeout: Duration,
    backend: TransferBackend,
    status: Arc<Mutex<ConnectionStatus>>,
    ops: Option<Sender<SshOp>>,
    worker: Option<JoinHandle<()>>,
    issued: Mutex<Vec<Weak<ReplyShared>>>,
}

impl SshConnection {
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_backend(host, port, TransferBackend::Scp)
    }

    pub fn with_backend(host: &str, port: u16, backend: TransferBackend) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: DEFAULT_TIMEOUT,
            backend,
            status: Arc::new(Mutex::new(ConnectionStatus::Closed)),
            ops: None,
            worker: None,
            issued: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self) -> Result<Sender<SshOp>> {
        self.ops.clone().ok_or(NetError::NotConnected)
    }

    fn check_connected(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Authenticated {
            Ok(())
        } else {
            Err(NetError::NotConnected)
        }
    }

    fn control(&self, op: impl FnOnce(Sender<Result<()>>) -> SshOp) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.sender()?
            .send(op(tx))
            .map_err(|_| NetError::Protocol("SSH worker thread has exited".to_string()))?;
        rx.recv()
            .map_err(|_| NetError::Protocol("SSH worker thread has exited".to_string()))?
    }

    /// Wires a not-yet-started reply to the worker queue. The work handle
    /// travels inside the starter closure, so an abandoned reply drops it
    /// and terminates as Interrupted instead of hanging.
    fn issue(
        &self,
        reply: &Reply,
        work: ReplyWork,
        make_op: impl FnOnce(ReplyWork) -> SshOp + Send + 'static,
    ) -> Result<()> {
        {
            let mut issued = self.issued.lock().unwrap();
            issued.retain(|shared| shared.strong_count() > 0);
            issued.push(reply.shared_weak());
        }
        let sender = self.sender()?;
        reply.set_starter(Box::new(move || {
            let _ = sender.send(make_op(work));
        }));
        Ok(())
    }
}

impl Connection for SshConnection {
    fn open(&mut self) -> Result<()> {
        {
            let status = self.status.lock().unwrap();
            if *status == ConnectionStatus::Opened || *status == ConnectionStatus::Authenticated {
                return Ok(());
            }
        }

        if self.ops.is_none() {
            let (tx, rx) = mpsc::channel();
            let host = self.host.clone();
            let port = self.port;
            let timeout = self.timeout;
            let backend = self.backend;
            let worker = std::thread::Builder::new()
                .name(format!("ssh-{}", self.host))
                .spawn(move || worker_loop(host, port, timeout, backend, rx))
                .map_err(NetError::Io)?;
            self.ops = Some(tx);
            self.worker = Some(worker);
        }

        match self.control(|response| SshOp::Open { response }) {
            Ok(()) => {
                *self.status.lock().unwrap() = ConnectionStatus::Opened;
                Ok(())
            }
            Err(e) => {
                *self.status.lock().unwrap() = ConnectionStatus::Error;
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        // Graceful shutdown: interrupt anything in flight so the worker
        // reaches its queue again, then let it drain and exit.
        for shared in self.issued.lock().unwrap().drain(..) {
            if let Some(shared) = shared.upgrade() {
                shared.request_interrupt();
            }
        }

        if let Some(ops) = self.ops.take() {
            let _ = ops.send(SshOp::Close);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        *self.status.lock().unwrap() = ConnectionStatus::Closed;
    }

    fn authenticate(&mut self, method: AuthMethod, credentials: &Credentials) -> Result<()> {
        let credentials = credentials.clone();
        match self.control(|response| SshOp::Authenticate {
            method,
            credentials,
            response,
        }) {
            Ok(()) => {
                *self.status.lock().unwrap() = ConnectionStatus::Authenticated;
                Ok(())
            }
            Err(e) => {
                *self.status.lock().unwrap() = ConnectionStatus::Error;
                Err(e)
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    fn hostname(&self) -> &str {
        &self.host
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn execute(&self, command: &str) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let command = command.to_string();
        self.issue(&reply, work, move |work| SshOp::Execute { command, work })?;
        Ok(reply)
    }

    fn put_file(&self, source: &Path, destination: &str) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let source = source.to_path_buf();
        let destination = destination.to_string();
        self.issue(&reply, work, move |work| SshOp::PutFile {
            source,
            destination,
            work,
        })?;
        Ok(reply)
    }

    fn get_file(&self, source: &str, destination: &Path) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let source = source.to_string();
        let destination = destination.to_path_buf();
        self.issue(&reply, work, move |work| SshOp::GetFile {
            source,
            destination,
            work,
        })?;
        Ok(reply)
    }

    fn get_files(&self, sources: &[String], destination_dir: &Path) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let sources = sources.to_vec();
        let destination_dir = destination_dir.to_path_buf();
        self.issue(&reply, work, move |work| SshOp::GetFiles {
            sources,
            destination_dir,
            work,
        })?;
        Ok(reply)
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Worker side. Owns the TcpStream and Session for the connection's lifetime.
// ---------------------------------------------------------------------------

struct SshWorker {
    host: String,
    port: u16,
    timeout: Duration,
    backend: TransferBackend,
    session: Option<Session>,
}

fn worker_loop(
    host: String,
    port: u16,
    timeout: Duration,
    backend: TransferBackend,
    ops: Receiver<SshOp>,
) {
    let mut worker = SshWorker {
        host,
        port,
        timeout,
        backend,
        session: None,
    };

    while let Ok(op) = ops.recv() {
        match op {
            SshOp::Open { response } => {
                let _ = response.send(worker.open());
            }
            SshOp::Authenticate {
                method,
                credentials,
                response,
            } => {
                let _ = response.send(worker.authenticate(method, &credentials));
            }
            SshOp::Execute { command, work } => {
                let result = worker.execute(&command, &work);
                finish(&work, result);
            }
            SshOp::PutFile {
                source,
                destination,
                work,
            } => {
                let result = worker.put_file(&source, &destination, &work);
                finish(&work, result);
            }
            SshOp::GetFile {
                source,
                destination,
                work,
            } => {
                let result = worker.get_file(&source, &destination, &work);
                finish(&work, result);
            }
            SshOp::GetFiles {
                sources,
                destination_dir,
                work,
            } => {
                let result = worker.get_files(&sources, &destination_dir, &work);
                finish(&work, result);
            }
            SshOp::Close => break,
        }
    }

    if let Some(session) = worker.session.take() {
        let _ = session.disconnect(None, "closing", None);
    }
}

enum OpOutcome {
    Done(String),
    Interrupted,
}

/// Converts an operation's outcome into the reply's terminal state. All
/// transport errors stop here; nothing propagates past the run boundary.
fn finish(work: &ReplyWork, result: Result<OpOutcome>) {
    work.set_running();
    match result {
        Ok(OpOutcome::Done(message)) => work.finish(ReplyStatus::Finished, message),
        Ok(OpOutcome::Interrupted) => work.finish(ReplyStatus::Interrupted, String::new()),
        Err(e) => {
            if is_timeout_error(&e) {
                work.finish(ReplyStatus::TimedOut, e.to_string());
            } else {
                work.finish(ReplyStatus::Error, e.to_string());
            }
        }
    }
}

impl SshWorker {
    fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        log_trace!("Opening connection to {}:{}", self.host, self.port);
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| NetError::HostLookup(self.host.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::HostLookup(self.host.clone()));
        }

        let mut last_error: Option<std::io::Error> = None;
        let mut tcp: Option<TcpStream> = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let tcp = match tcp {
            Some(tcp) => tcp,
            None => {
                let source = last_error
                    .unwrap_or_else(|| std::io::Error::other("no usable addresses"));
                if source.kind() == std::io::ErrorKind::TimedOut {
                    return Err(NetError::ConnectionTimeout(self.host.clone()));
                }
                return Err(NetError::Connect {
                    host: self.host.clone(),
                    port: self.port,
                    source,
                });
            }
        };

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis() as u32);
        session.handshake().map_err(|e| NetError::Handshake {
            host: self.host.clone(),
            message: e.to_string(),
        })?;

        self.session = Some(session);
        Ok(())
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(NetError::NotConnected)
    }

    // Host-key verification is mandatory; there is no way to bypass a
    // missing or mismatched entry short of fixing the known hosts file.
    fn check_known_hosts(&self, credentials: &Credentials) -> Result<()> {
        let session = self.session()?;
        let path = credentials.known_hosts.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_default();
            Path::new(&home).join(".ssh").join("known_hosts")
        });

        let mut known_hosts = session.known_hosts()?;
        known_hosts
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(|_| NetError::HostKeyNotFound(self.host.clone()))?;

        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| NetError::HostKeyCheckFailed {
                host: self.host.clone(),
                message: "server offered no host key".to_string(),
            })?;

        match known_hosts.check_port(&self.host, self.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(NetError::HostKeyNotFound(self.host.clone())),
            CheckResult::Mismatch => Err(NetError::HostKeyMismatch(self.host.clone())),
            CheckResult::Failure => Err(NetError::HostKeyCheckFailed {
                host: self.host.clone(),
                message: "known hosts check could not be performed".to_string(),
            }),
        }
    }

    fn authenticate(&mut self, method: AuthMethod, credentials: &Credentials) -> Result<()> {
        self.open()?;
        self.check_known_hosts(credentials)?;

        let session = self.session()?;
        let user = credentials.user.clone();
        let advertised = session.auth_methods(&user)?.to_string();

        // Exactly one caller-chosen strategy; no fallback cascade.
        let required = match method {
            AuthMethod::HostBased => Some("hostbased"),
            AuthMethod::KeyboardInteractive => Some("keyboard-interactive"),
            AuthMethod::Password => Some("password"),
            AuthMethod::PublicKey => Some("publickey"),
            AuthMethod::Agent | AuthMethod::None => None,
        };
        if let Some(required) = required {
            if !advertised.contains(required) {
                return Err(NetError::MethodNotSupported {
                    method: method.to_string(),
                    advertised: advertised.replace(',', ", "),
                });
            }
        }

        match method {
            AuthMethod::None => Ok(()),
            AuthMethod::Agent => self.connect_agent(&user),
            AuthMethod::HostBased => self.connect_host_based(credentials),
            AuthMethod::KeyboardInteractive => self.connect_keyboard_interactive(credentials),
            AuthMethod::Password => self.connect_password(credentials),
            AuthMethod::PublicKey => self.connect_public_key(credentials),
        }
    }

    fn connect_agent(&self, user: &str) -> Result<()> {
        log_trace!("SshConnection agent authentication for {}", user);
        let session = self.session()?;
        let mut agent = session.agent()?;
        agent
            .connect()
            .map_err(|e| NetError::AuthenticationFailed(format!("ssh-agent: {}", e)))?;
        agent
            .list_identities()
            .map_err(|e| NetError::AuthenticationFailed(format!("ssh-agent: {}", e)))?;

        let identities = agent
            .identities()
            .map_err(|e| NetError::AuthenticationFailed(format!("ssh-agent: {}", e)))?;
        for identity in identities {
            if agent.userauth(user, &identity).is_ok() {
                return Ok(());
            }
        }

        Err(NetError::AuthenticationFailed(
            "no identity held by the ssh-agent was accepted".to_string(),
        ))
    }

    fn connect_password(&self, credentials: &Credentials) -> Result<()> {
        log_trace!("SshConnection password authentication for {}", credentials.user);
        let session = self.session()?;
        let prompt_text = format!("Password for {}@{}", credentials.user, self.host);

        for attempt in 0..3 {
            let password = if attempt == 0 && credentials.password.is_some() {
                credentials.password.clone()
            } else {
                match &credentials.prompt {
                    Some(prompt) => prompt(&prompt_text),
                    None => None,
                }
            };
            let Some(password) = password else {
                return Err(NetError::AuthenticationCancelled);
            };

            match session.userauth_password(&credentials.user, &password) {
                Ok(()) => return Ok(()),
                Err(e) if is_auth_failure(&e) => continue,
                Err(e) => return Err(NetError::AuthenticationFailed(e.to_string())),
            }
        }

        Err(NetError::AuthenticationFailed(
            "password rejected after 3 attempts".to_string(),
        ))
    }

    fn connect_keyboard_interactive(&self, credentials: &Credentials) -> Result<()> {
        log_trace!("SshConnection keyboard-interactive authentication");
        let session = self.session()?;

        struct Prompter<'a> {
            host: &'a str,
            credentials: &'a Credentials,
            cancelled: bool,
        }

        impl ssh2::KeyboardInteractivePrompt for Prompter<'_> {
            fn prompt(
                &mut self,
                _username: &str,
                _instructions: &str,
                prompts: &[ssh2::Prompt<'_>],
            ) -> Vec<String> {
                let mut responses = Vec::with_capacity(prompts.len());
                for p in prompts {
                    let text = format!("Prompt from {}:\n{}", self.host, p.text);
                    let answer = match &self.credentials.prompt {
                        Some(prompt) => prompt(&text),
                        None => self.credentials.password.clone(),
                    };
                    match answer {
                        Some(answer) => responses.push(answer),
                        None => {
                            self.cancelled = true;
                            break;
                        }
                    }
                }
                responses
            }
        }

        for _attempt in 0..3 {
            let mut prompter = Prompter {
                host: &self.host,
                credentials,
                cancelled: false,
            };
            match session.userauth_keyboard_interactive(&credentials.user, &mut prompter) {
                Ok(()) => return Ok(()),
                Err(_) if prompter.cancelled => return Err(NetError::AuthenticationCancelled),
                Err(e) if is_auth_failure(&e) => continue,
                Err(e) => return Err(NetError::AuthenticationFailed(e.to_string())),
            }
        }

        Err(NetError::AuthenticationFailed(
            "keyboard-interactive responses rejected after 3 attempts".to_string(),
        ))
    }

    fn connect_public_key(&self, credentials: &Credentials) -> Result<()> {
        log_trace!("SshConnection public key authentication");
        let session = self.session()?;
        let private_key = identity_file(credentials.private_key.as_deref(), "id_rsa")?;
        let public_key = credentials.public_key.clone();

        match session.userauth_pubkey_file(
            &credentials.user,
            public_key.as_deref(),
            &private_key,
            credentials.passphrase.as_deref(),
        ) {
            Ok(()) => Ok(()),
            Err(e) if is_auth_failure(&e) => Err(NetError::AuthenticationFailed(format!(
                "public key not accepted for host {}",
                self.host
            ))),
            Err(e) => Err(NetError::AuthenticationFailed(e.to_string())),
        }
    }

    fn connect_host_based(&self, credentials: &Credentials) -> Result<()> {
        log_trace!("SshConnection host-based authentication");
        let session = self.session()?;
        let private_key = identity_file(credentials.private_key.as_deref(), "id_rsa")?;
        let public_key = identity_file(credentials.public_key.as_deref(), "id_rsa.pub")?;

        session
            .userauth_hostbased_file(
                &credentials.user,
                &public_key,
                &private_key,
                credentials.passphrase.as_deref(),
                &self.host,
                None,
            )
            .map_err(|e| {
                if is_auth_failure(&e) {
                    NetError::AuthenticationFailed("host-based authentication rejected".to_string())
                } else {
                    NetError::AuthenticationFailed(e.to_string())
                }
            })
    }

    fn execute(&mut self, command: &str, work: &ReplyWork) -> Result<OpOutcome> {
        work.set_running();
        let session = self.session()?;

        // The exec channel is not a login shell, so expand ~ ourselves.
        let command = command.replace('~', "$HOME");
        log_trace!("SshExecute {}", command);

        let mut channel = session.channel_session()?;
        channel.exec(&command)?;

        let mut output = Vec::new();
        let mut buffer = [0u8; TRANSFER_BUFFER];
        loop {
            if work.interrupted() {
                let _ = channel.close();
                return Ok(OpOutcome::Interrupted);
            }
            match channel.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => output.extend_from_slice(&buffer[..count]),
                Err(e) => {
                    let _ = channel.close();
                    return Err(NetError::Io(e));
                }
            }
        }

        let _ = channel.close();
        let _ = channel.wait_close();

        let message = String::from_utf8_lossy(&output).trim().to_string();
        Ok(OpOutcome::Done(message))
    }

    fn put_file(&mut self, source: &Path, destination: &str, work: &ReplyWork) -> Result<OpOutcome> {
        work.set_running();
        log_trace!("SshPutFile {} -> {}", source.display(), destination);
        let mut local = fs_err::File::open(source)?;
        let size = local.metadata()?.len();

        match self.backend {
            TransferBackend::Scp => {
                let session = self.session()?;
                let mut channel = session.scp_send(Path::new(destination), 0o644, size, None)?;
                let outcome = pump(&mut local, &mut channel, size, work)?;
                let _ = channel.send_eof();
                let _ = channel.wait_eof();
                let _ = channel.wait_close();
                Ok(outcome)
            }
            TransferBackend::Sftp => {
                let session = self.session()?;
                let sftp = session.sftp()?;
                if let Some(parent) = Path::new(destination).parent() {
                    // A failed mkdir surfaces as a create() error below.
                    let _ = sftp.mkdir(parent, 0o755);
                }
                let mut remote = sftp.create(Path::new(destination))?;
                pump(&mut local, &mut remote, size, work)
            }
        }
    }

    fn get_file(&mut self, source: &str, destination: &Path, work: &ReplyWork) -> Result<OpOutcome> {
        work.set_running();
        log_trace!("SshGetFile {} <- {}", destination.display(), source);
        let mut local = fs_err::File::create(destination)?;

        match self.backend {
            TransferBackend::Scp => {
                let session = self.session()?;
                let (mut channel, stat) = session.scp_recv(Path::new(source))?;
                let size = stat.size();
                if size == 0 {
                    return Err(NetError::Protocol(format!(
                        "Unable to stat file on server: {}\nCheck the file exists and the firewall permits incoming connections",
                        source
                    )));
                }
                let outcome = pump_exact(&mut channel, &mut local, size, work)?;
                let _ = channel.send_eof();
                let _ = channel.wait_close();
                Ok(outcome)
            }
            TransferBackend::Sftp => {
                let session = self.session()?;
                let sftp = session.sftp()?;
                let size = sftp
                    .stat(Path::new(source))
                    .ok()
                    .and_then(|stat| stat.size)
                    .unwrap_or(0);
                let mut remote = sftp.open(Path::new(source))?;
                pump(&mut remote, &mut local, size, work)
            }
        }
    }

    // Sequential reuse of the single-file transfer with one shared interrupt
    // flag; completion is reported once with the conjunction of the results.
    fn get_files(
        &mut self,
        sources: &[String],
        destination_dir: &Path,
        work: &ReplyWork,
    ) -> Result<OpOutcome> {
        let mut failures = Vec::new();

        for source in sources {
            if work.interrupted() {
                return Ok(OpOutcome::Interrupted);
            }
            let file_name = Path::new(source)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| source.clone());
            let destination = destination_dir.join(file_name);
            match self.get_file(source, &destination, work) {
                Ok(OpOutcome::Interrupted) => return Ok(OpOutcome::Interrupted),
                Ok(OpOutcome::Done(_)) => {}
                Err(e) => {
                    log_warn!("Failed to retrieve {}: {}", source, e);
                    failures.push(format!("{}: {}", source, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(OpOutcome::Done(String::new()))
        } else {
            Err(NetError::Protocol(failures.join("\n")))
        }
    }
}

/// Copies `reader` into `writer` in KiB buffers, reporting fractional
/// progress after every buffer and honouring the interrupt flag between
/// blocking calls. The session-level timeout bounds each read/write, so
/// inactivity rather than total duration trips it.
fn pump<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    size: u64,
    work: &ReplyWork,
) -> Result<OpOutcome> {
    let mut buffer = [0u8; TRANSFER_BUFFER];
    let mut moved: u64 = 0;

    loop {
        if work.interrupted() {
            return Ok(OpOutcome::Interrupted);
        }
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        writer.write_all(&buffer[..count])?;
        moved += count as u64;
        if size > 0 {
            work.report_progress(moved as f64 / size as f64);
        }
    }

    Ok(OpOutcome::Done(String::new()))
}

/// SCP receive variant: the channel does not EOF at the advertised size, so
/// read exactly `size` bytes.
fn pump_exact<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    size: u64,
    work: &ReplyWork,
) -> Result<OpOutcome> {
    let mut buffer = [0u8; TRANSFER_BUFFER];
    let mut moved: u64 = 0;

    while moved < size {
        if work.interrupted() {
            return Ok(OpOutcome::Interrupted);
        }
        let want = std::cmp::min(buffer.len() as u64, size - moved) as usize;
        let count = reader.read(&mut buffer[..want])?;
        if count == 0 {
            break;
        }
        writer.write_all(&buffer[..count])?;
        moved += count as u64;
        work.report_progress(moved as f64 / size as f64);
    }

    Ok(OpOutcome::Done(String::new()))
}

fn identity_file(configured: Option<&Path>, default_name: &str) -> Result<PathBuf> {
    let path = match configured {
        Some(path) => path.to_path_buf(),
        None => {
            let home = std::env::var("HOME").unwrap_or_default();
            Path::new(&home).join(".ssh").join(default_name)
        }
    };
    if !path.exists() {
        return Err(NetError::IdentityFileNotFound(
            path.to_string_lossy().to_string(),
        ));
    }
    Ok(path)
}

fn is_auth_failure(error: &ssh2::Error) -> bool {
    matches!(
        error.code(),
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
    )
}

fn is_timeout_error(error: &NetError) -> bool {
    match error {
        NetError::Ssh(e) => matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)),
        NetError::Io(e) => {
            e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock
        }
        NetError::ConnectionTimeout(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_require_authentication() {
        let connection = SshConnection::new("nonexistent.invalid", 22);
        assert!(matches!(
            connection.execute("true"),
            Err(NetError::NotConnected)
        ));
        assert!(matches!(
            connection.get_file("/remote/a", Path::new("/tmp/a")),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn test_open_fails_on_unresolvable_host() {
        let mut connection = SshConnection::new("nonexistent.invalid", 22);
        let result = connection.open();
        assert!(result.is_err());
        assert_eq!(connection.status(), ConnectionStatus::Error);
    }

    #[test]
    fn test_backend_selection() {
        let connection = SshConnection::new("host", 22);
        assert_eq!(connection.backend, TransferBackend::Scp);
        let sftp = SshConnection::with_backend("host", 22, TransferBackend::Sftp);
        assert_eq!(sftp.backend, TransferBackend::Sftp);
    }

    #[test]
    fn test_close_interrupts_unstarted_replies() {
        let mut connection = SshConnection::new("nonexistent.invalid", 22);
        // Force the handle into a state where a reply can be issued without
        // a live session: the worker rejects the op, but the reply must
        // still terminate rather than hang.
        let _ = connection.open();
        connection.close();
        assert_eq!(connection.status(), ConnectionStatus::Closed);
    }
}
