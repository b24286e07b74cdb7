use crate::connection::{Connection, ConnectionStatus, Credentials, DEFAULT_TIMEOUT};
use crate::error::{NetError, Result};
use crate::reply::{Reply, ReplyStatus, ReplyWork};
use molq_core::config::AuthMethod;
use molq_core::{log_debug, log_trace};
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

// Header names used by the job service, e.g. "Qchemserv-Status". The prefix
// is part of the wire contract with the remote service.
pub const DEFAULT_HEADER_PREFIX: &str = "Qchemserv";

const TRANSFER_BUFFER: usize = 1024;

/// HTTP(S) transport for web job services. `open()` only constructs the
/// request client; every operation is one request/response exchange
/// classified by the service's custom status headers.
pub struct HttpConnection {
    host: String,
    port: u16,
    secure: bool,
    status: ConnectionStatus,
    timeout: Duration,
    client: Option<Client>,
    header_prefix: String,
    cookie: Option<String>,
}

impl HttpConnection {
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_security(host, port, false)
    }

    pub fn with_security(host: &str, port: u16, secure: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            secure,
            status: ConnectionStatus::Closed,
            timeout: DEFAULT_TIMEOUT,
            client: None,
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
            cookie: None,
        }
    }

    pub fn set_header_prefix(&mut self, prefix: &str) {
        self.header_prefix = prefix.to_string();
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or(NetError::NotConnected)
    }

    fn check_connected(&self) -> Result<()> {
        if self.status == ConnectionStatus::Authenticated {
            Ok(())
        } else {
            Err(NetError::NotConnected)
        }
    }

    fn url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let default_port = if self.secure { 443 } else { 80 };
        let path = path.trim_start_matches('/');
        if self.port == default_port || self.port == 0 {
            format!("{}://{}/{}", scheme, self.host, path)
        } else {
            format!("{}://{}:{}/{}", scheme, self.host, self.port, path)
        }
    }

    /// Synchronous token exchange with the service's register/token
    /// endpoint. A timeout here is an error; it is never silently retried.
    fn obtain_token(&self, path: &str, credentials: Option<&Credentials>) -> Result<String> {
        let client = self.client()?;
        let url = self.url(path);
        log_debug!("Obtaining session token from {}", url);

        let mut request = client.get(url.as_str());
        if let Some(credentials) = credentials {
            request = request.header("User", credentials.user.clone());
            if let Some(password) = &credentials.password {
                request = request.header("Password", password.clone());
            }
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                NetError::ConnectionTimeout(self.host.clone())
            } else {
                NetError::Http(e)
            }
        })?;

        let headers = response.headers().clone();
        let body = response.text().unwrap_or_default();
        let message = message_from(&headers, &body);

        let status_header = format!("{}-Status", self.header_prefix);
        let token_header = format!("{}-Token", self.header_prefix);

        let status = header_value(&headers, &status_header);
        if status.as_deref() != Some("OK") {
            return Err(NetError::AuthenticationFailed(message));
        }
        header_value(&headers, &token_header)
            .ok_or_else(|| NetError::AuthenticationFailed("no session token in response".into()))
    }

    fn spawn_request(
        &self,
        request: RequestSpec,
        destination: Option<PathBuf>,
    ) -> Result<Reply> {
        self.check_connected()?;
        let (reply, work) = Reply::new();
        let client = self.client()?.clone();
        let prefix = self.header_prefix.clone();
        reply.set_starter(Box::new(move || {
            thread::spawn(move || {
                run_request(client, request, destination, prefix, work);
            });
        }));
        Ok(reply)
    }
}

struct RequestSpec {
    url: String,
    post_body: Option<String>,
}

impl Connection for HttpConnection {
    /// No network traffic; a failure to build the client is environmental.
    fn open(&mut self) -> Result<()> {
        if self.client.is_none() {
            let client = Client::builder()
                .connect_timeout(self.timeout)
                .read_timeout(self.timeout)
                .build()?;
            self.client = Some(client);
        }
        self.status = ConnectionStatus::Opened;
        Ok(())
    }

    fn close(&mut self) {
        self.client = None;
        self.cookie = None;
        self.status = ConnectionStatus::Closed;
    }

    fn authenticate(&mut self, method: AuthMethod, credentials: &Credentials) -> Result<()> {
        if let Some(cookie) = credentials.cookie.as_ref().filter(|c| !c.is_empty()) {
            self.cookie = Some(cookie.clone());
            self.status = ConnectionStatus::Authenticated;
            return Ok(());
        }

        let token = match method {
            AuthMethod::Password => self.obtain_token("token", Some(credentials)),
            _ => self.obtain_token("register", None),
        };

        match token {
            Ok(token) => {
                self.cookie = Some(token);
                self.status = ConnectionStatus::Authenticated;
                Ok(())
            }
            Err(e) => {
                self.status = ConnectionStatus::Error;
                Err(e)
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn hostname(&self) -> &str {
        &self.host
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn session_cookie(&self) -> Option<String> {
        self.cookie.clone()
    }

    /// Ordinary command execution is a GET whose query string comes from
    /// the scheduler templates after macro substitution.
    fn execute(&self, command: &str) -> Result<Reply> {
        let spec = RequestSpec {
            url: self.url(command.trim()),
            post_body: None,
        };
        self.spawn_request(spec, None)
    }

    /// Job submission: POST the staged input file's contents to the submit
    /// endpoint.
    fn put_file(&self, source: &Path, destination: &str) -> Result<Reply> {
        self.check_connected()?;
        let body = match fs_err::read_to_string(source) {
            Ok(body) => body,
            Err(e) => return Ok(Reply::failed(e.to_string())),
        };
        let spec = RequestSpec {
            url: self.url(destination.trim()),
            post_body: Some(body),
        };
        self.spawn_request(spec, None)
    }

    fn get_file(&self, source: &str, destination: &Path) -> Result<Reply> {
        let spec = RequestSpec {
            url: self.url(source.trim()),
            post_body: None,
        };
        self.spawn_request(spec, Some(destination.to_path_buf()))
    }

    /// Downloads are one request per entry; each entry is a fully-formed
    /// query produced by the server's ${FILE_NAME} rewriting. File names
    /// are assumed unique within a job; collisions are refused rather than
    /// silently overwritten.
    fn get_files(&self, sources: &[String], destination_dir: &Path) -> Result<Reply> {
        self.check_connected()?;

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(sources.len());
        for source in sources {
            let name = file_name_hint(source);
            if !seen.insert(name.clone()) {
                return Ok(Reply::failed(format!(
                    "Duplicate file name '{}' in download list",
                    name
                )));
            }
            targets.push((source.clone(), destination_dir.join(name)));
        }

        let (reply, work) = Reply::new();
        let client = self.client()?.clone();
        let prefix = self.header_prefix.clone();
        let base = |path: &str| self.url(path);
        let urls: Vec<(String, PathBuf)> = targets
            .into_iter()
            .map(|(source, destination)| (base(source.trim()), destination))
            .collect();

        reply.set_starter(Box::new(move || {
            thread::spawn(move || {
                work.set_running();
                let total = urls.len().max(1) as f64;
                let mut failures = Vec::new();

                for (index, (url, destination)) in urls.iter().enumerate() {
                    if work.interrupted() {
                        work.finish(ReplyStatus::Interrupted, String::new());
                        return;
                    }
                    if let Err(e) = fetch_to_file(&client, url, destination, &prefix, &work) {
                        failures.push(format!("{}: {}", url, e));
                    }
                    work.report_progress((index + 1) as f64 / total);
                }

                if work.interrupted() {
                    work.finish(ReplyStatus::Interrupted, String::new());
                } else if failures.is_empty() {
                    work.finish(ReplyStatus::Finished, String::new());
                } else {
                    work.finish(ReplyStatus::Error, failures.join("\n"));
                }
            });
        }));
        Ok(reply)
    }

    // The shell sentinel helpers are meaningless against a web service.
    fn exists(&self, _path: &str) -> Result<bool> {
        Ok(false)
    }

    fn make_directory(&self, _path: &str) -> Result<bool> {
        Ok(true)
    }

    fn remove_directory(&self, _path: &str) -> Result<bool> {
        Ok(true)
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Flattens the response headers into `Name::Value` lines; used as the
/// reply message when the body is empty so the status scrapers can match
/// the same token patterns in either place.
fn headers_as_string(headers: &HeaderMap) -> String {
    let mut text = String::new();
    for (name, value) in headers {
        text.push_str(name.as_str());
        text.push_str("::");
        text.push_str(value.to_str().unwrap_or(""));
        text.push('\n');
    }
    text
}

fn message_from(headers: &HeaderMap, body: &str) -> String {
    if body.trim().is_empty() {
        headers_as_string(headers)
    } else {
        body.to_string()
    }
}

/// Classifies a response via the service's status header: OK finishes the
/// reply, ERROR carries the error header's text, anything else means the
/// service itself is not answering.
fn classify(headers: &HeaderMap, prefix: &str, message: String, work: &ReplyWork) {
    let status_header = format!("{}-Status", prefix);
    let error_header = format!("{}-Error", prefix);

    match header_value(headers, &status_header).as_deref() {
        Some("OK") => {
            if work.interrupted() {
                work.finish(ReplyStatus::Interrupted, String::new());
            } else {
                work.finish(ReplyStatus::Finished, message);
            }
        }
        Some("ERROR") => {
            let error = header_value(headers, &error_header)
                .unwrap_or_else(|| "Request failed".to_string());
            work.finish(ReplyStatus::Error, error);
        }
        _ => work.finish(ReplyStatus::Error, "Server unavailable".to_string()),
    }
}

fn send(client: &Client, spec: &RequestSpec) -> std::result::Result<Response, reqwest::Error> {
    match &spec.post_body {
        Some(body) => {
            log_trace!("HttpPost {}", spec.url);
            client
                .post(spec.url.as_str())
                .header("Content-Type", "text/plain; charset=UTF-8")
                .body(body.clone())
                .send()
        }
        None => {
            log_trace!("HttpGet {}", spec.url);
            client.get(spec.url.as_str()).send()
        }
    }
}

fn run_request(
    client: Client,
    spec: RequestSpec,
    destination: Option<PathBuf>,
    prefix: String,
    work: ReplyWork,
) {
    work.set_running();

    let response = match send(&client, &spec) {
        Ok(response) => response,
        Err(e) => {
            if work.interrupted() {
                work.finish(ReplyStatus::Interrupted, String::new());
            } else if e.is_timeout() {
                work.finish(ReplyStatus::TimedOut, e.to_string());
            } else {
                work.finish(ReplyStatus::Error, e.to_string());
            }
            return;
        }
    };

    let headers = response.headers().clone();

    match destination {
        Some(destination) => match stream_to_file(response, &destination, &work) {
            Ok(true) => classify(&headers, &prefix, destination.display().to_string(), &work),
            Ok(false) => work.finish(ReplyStatus::Interrupted, String::new()),
            Err(e) => work.finish(ReplyStatus::Error, e.to_string()),
        },
        None => {
            let body = match read_body(response, &work) {
                Ok(Some(body)) => body,
                Ok(None) => {
                    work.finish(ReplyStatus::Interrupted, String::new());
                    return;
                }
                Err(e) => {
                    work.finish(ReplyStatus::Error, e.to_string());
                    return;
                }
            };
            let message = message_from(&headers, &body);
            classify(&headers, &prefix, message, &work);
        }
    }
}

/// Reads the body in chunks so an interrupt or inactivity timeout is
/// honoured mid-transfer. Returns None when interrupted.
fn read_body(mut response: Response, work: &ReplyWork) -> Result<Option<String>> {
    let mut body = Vec::new();
    let mut buffer = [0u8; TRANSFER_BUFFER];
    loop {
        if work.interrupted() {
            return Ok(None);
        }
        let count = response.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        body.extend_from_slice(&buffer[..count]);
    }
    Ok(Some(String::from_utf8_lossy(&body).to_string()))
}

/// Returns Ok(false) when interrupted mid-stream.
fn stream_to_file(mut response: Response, destination: &Path, work: &ReplyWork) -> Result<bool> {
    let size = response.content_length().unwrap_or(0);
    let mut file = fs_err::File::create(destination)?;
    let mut buffer = [0u8; TRANSFER_BUFFER];
    let mut moved: u64 = 0;

    loop {
        if work.interrupted() {
            return Ok(false);
        }
        let count = response.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        file.write_all(&buffer[..count])?;
        moved += count as u64;
        if size > 0 {
            work.report_progress(moved as f64 / size as f64);
        }
    }
    Ok(true)
}

fn fetch_to_file(
    client: &Client,
    url: &str,
    destination: &Path,
    prefix: &str,
    work: &ReplyWork,
) -> Result<()> {
    let response = client.get(url).send()?;
    let headers = response.headers().clone();

    let status_header = format!("{}-Status", prefix);
    if header_value(&headers, &status_header).as_deref() == Some("ERROR") {
        let error_header = format!("{}-Error", prefix);
        return Err(NetError::Protocol(
            header_value(&headers, &error_header).unwrap_or_else(|| "Request failed".to_string()),
        ));
    }

    stream_to_file(response, destination, work)?;
    Ok(())
}

/// Best-effort local file name for a download query: the `file=` parameter
/// when present, otherwise the last path segment.
fn file_name_hint(source: &str) -> String {
    if let Some(query) = source.split('?').nth(1) {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("file=") {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    source
        .split('?')
        .next()
        .unwrap_or(source)
        .rsplit('/')
        .next()
        .unwrap_or(source)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let connection = HttpConnection::new("example.com", 80);
        assert_eq!(
            connection.url("/status?jobid=1"),
            "http://example.com/status?jobid=1"
        );

        let with_port = HttpConnection::new("example.com", 8080);
        assert_eq!(with_port.url("list"), "http://example.com:8080/list");

        let secure = HttpConnection::with_security("example.com", 443, true);
        assert_eq!(secure.url("register"), "https://example.com/register");
    }

    #[test]
    fn test_operations_require_authentication() {
        let connection = HttpConnection::new("example.com", 80);
        assert!(matches!(
            connection.execute("/status"),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn test_cookie_reuse_skips_round_trip() {
        let mut connection = HttpConnection::new("example.com", 80);
        connection.open().unwrap();

        let mut credentials = Credentials::for_user("guest");
        credentials.cookie = Some("deadbeef".to_string());
        connection
            .authenticate(AuthMethod::None, &credentials)
            .unwrap();

        assert_eq!(connection.status(), ConnectionStatus::Authenticated);
        assert_eq!(connection.session_cookie().as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_file_name_hint() {
        assert_eq!(
            file_name_hint("/download?cookie=abc&jobid=1&file=water.out"),
            "water.out"
        );
        assert_eq!(file_name_hint("/files/water.fchk"), "water.fchk");
        assert_eq!(file_name_hint("plain"), "plain");
    }

    #[test]
    fn test_header_flattening_matches_scraper_format() {
        let mut headers = HeaderMap::new();
        headers.insert("Qchemserv-Status", "OK".parse().unwrap());
        headers.insert("Qchemserv-Jobid", "42-abc".parse().unwrap());
        let text = headers_as_string(&headers);
        assert!(text.contains("qchemserv-status::OK"));
        assert!(text.contains("qchemserv-jobid::42-abc"));
    }
}
