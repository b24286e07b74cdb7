use crate::error::{CoreError, Result};
use crate::queue::QueueResources;
use crate::{log_debug, log_warn};
use serde_json::{Map, Value};
use std::fmt;

// The string values below are part of the on-disk format and must not change.
pub const FIELD_SERVER_NAME: &str = "Server Name";
pub const FIELD_CONNECTION: &str = "Connection";
pub const FIELD_QUEUE_SYSTEM: &str = "Queue System";
pub const FIELD_HOST_ADDRESS: &str = "Host Address";
pub const FIELD_USER_NAME: &str = "User Name";
pub const FIELD_PORT: &str = "Port";
pub const FIELD_AUTHENTICATION: &str = "Authentication";
pub const FIELD_WORKING_DIRECTORY: &str = "Working Directory";
pub const FIELD_SUBMIT: &str = "Submit";
pub const FIELD_QUERY: &str = "Query";
pub const FIELD_QUEUE_INFO: &str = "Queue Info";
pub const FIELD_KILL: &str = "Kill";
pub const FIELD_UPDATE_INTERVAL: &str = "Update Interval";
pub const FIELD_JOB_LIMIT: &str = "Job Limit";
pub const FIELD_RUN_FILE_TEMPLATE: &str = "Run File Template";
pub const FIELD_COOKIE: &str = "Cookie";
pub const FIELD_QUEUE_RESOURCES: &str = "Queue Resources";
pub const FIELD_JOB_FILE_LIST: &str = "Job File List";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Local,
    Ssh,
    Sftp,
    Http,
    Https,
}

impl ConnectionKind {
    /// Forgiving parse used for persisted values and user input.
    pub fn parse(value: &str) -> Self {
        let v = value.to_lowercase();
        if v.contains("sftp") {
            ConnectionKind::Sftp
        } else if v.contains("ssh") {
            ConnectionKind::Ssh
        } else if v.contains("https") {
            ConnectionKind::Https
        } else if v.contains("http") {
            ConnectionKind::Http
        } else {
            ConnectionKind::Local
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionKind::Local => "Local",
            ConnectionKind::Ssh => "SSH",
            ConnectionKind::Sftp => "SFTP",
            ConnectionKind::Http => "HTTP",
            ConnectionKind::Https => "HTTPS",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSystem {
    Basic,
    Pbs,
    Sge,
    Slurm,
    Web,
}

impl QueueSystem {
    pub fn parse(value: &str) -> Self {
        let v = value.to_lowercase();
        if v.contains("pbs") {
            QueueSystem::Pbs
        } else if v.contains("sge") {
            QueueSystem::Sge
        } else if v.contains("slurm") {
            QueueSystem::Slurm
        } else if v.contains("web") {
            QueueSystem::Web
        } else {
            QueueSystem::Basic
        }
    }
}

impl fmt::Display for QueueSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueSystem::Basic => "Basic",
            QueueSystem::Pbs => "PBS",
            QueueSystem::Sge => "SGE",
            QueueSystem::Slurm => "SLURM",
            QueueSystem::Web => "Web",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Agent,
    HostBased,
    KeyboardInteractive,
    Password,
    PublicKey,
}

impl AuthMethod {
    pub fn parse(value: &str) -> Self {
        let v = value.to_lowercase();
        if v.contains("none") {
            AuthMethod::None
        } else if v.contains("agent") {
            AuthMethod::Agent
        } else if v.contains("public") {
            AuthMethod::PublicKey
        } else if v.contains("host") {
            AuthMethod::HostBased
        } else if v.contains("interactive") {
            AuthMethod::KeyboardInteractive
        } else {
            AuthMethod::Password
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthMethod::None => "None",
            AuthMethod::Agent => "SSH Agent",
            AuthMethod::HostBased => "SSH Host Based",
            AuthMethod::KeyboardInteractive => "SSH Keyboard Interactive",
            AuthMethod::Password => "SSH Password Prompt",
            AuthMethod::PublicKey => "SSH Public Key",
        };
        write!(f, "{}", s)
    }
}

/// One persisted execution target: transport, scheduler dialect, credentials
/// strategy and the free-text command templates used against it.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub connection: ConnectionKind,
    pub queue_system: QueueSystem,
    pub host: String,
    pub port: u16,
    pub authentication: AuthMethod,
    pub user: String,
    pub working_directory: String,
    pub submit: String,
    pub query: String,
    pub queue_info: String,
    pub kill: String,
    pub update_interval: u64,
    pub job_limit: u32,
    pub run_file_template: String,
    pub cookie: String,
    pub job_file_list: String,
    pub queue_resources: Vec<QueueResources>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut config = Self {
            name: String::new(),
            connection: ConnectionKind::Http,
            queue_system: QueueSystem::Web,
            host: String::new(),
            port: 80,
            authentication: AuthMethod::None,
            user: String::new(),
            working_directory: String::new(),
            submit: String::new(),
            query: String::new(),
            queue_info: String::new(),
            kill: String::new(),
            update_interval: 20,
            job_limit: 1024,
            run_file_template: String::new(),
            cookie: String::new(),
            job_file_list: String::new(),
            queue_resources: Vec::new(),
        };
        config.set_connection_defaults(ConnectionKind::Http);
        config.set_queue_defaults(QueueSystem::Web);
        config
    }
}

const BASIC_RUN_FILE: &str = "#!/bin/sh\n\
cd ${JOB_DIR}\n\
qchem ${JOB_NAME}.inp ${JOB_NAME}.out";

const PBS_RUN_FILE: &str = "#!/bin/csh\n\
#PBS -q ${QUEUE}\n\
#PBS -l walltime=${WALLTIME}\n\
#PBS -l mem=${MEMORY}Mb\n\
#PBS -l jobfs=${SCRATCH}Mb\n\
#PBS -l ncpus=${NCPUS}\n\
#PBS -j oe\n\
#PBS -o ${JOB_NAME}.err\n\
#PBS -l wd\n\
\n\
setenv QC /usr/local/qchem\n\
setenv QCAUX $QC/aux\n\
setenv QCSCRATCH $PBS_JOBFS\n\
if (-e $QC/bin/qchem.setup) source $QC/bin/qchem.setup\n\
\n\
qchem ${JOB_NAME}.inp ${JOB_NAME}.out";

const SGE_RUN_FILE: &str = "#!/bin/csh\n\
#$ -S /bin/csh\n\
#$ -q ${QUEUE}\n\
#$ -l h_rt=${WALLTIME}\n\
#$ -l h_vmem=${MEMORY}\n\
#$ -l scr_free=${SCRATCH}\n\
#$ -pe mpi 1\n\
#$ -j yes\n\
#$ -cwd\n\
\n\
setenv QC /usr/local/qchem\n\
setenv QCAUX $QC/aux\n\
setenv QCSCRATCH $TMPDIR\n\
if (-e $QC/bin/qchem.setup) source $QC/bin/qchem.setup\n\
\n\
qchem ${JOB_NAME}.inp ${JOB_NAME}.out";

const SLURM_RUN_FILE: &str = "#!/usr/bin/env bash\n\
#SBATCH --job-name=${JOB_NAME}\n\
#SBATCH --partition=${QUEUE}\n\
#SBATCH --time=${WALLTIME}\n\
#SBATCH --mem=${MEMORY}\n\
#SBATCH --cpus-per-task=${NCPUS}\n\
#SBATCH --output=${JOB_NAME}.err\n\
#SBATCH --error=${JOB_NAME}.err\n\
#SBATCH --chdir=${JOB_DIR}\n\
\n\
qchem ${JOB_NAME}.inp ${JOB_NAME}.out";

impl ServerConfig {
    pub fn new(name: &str, connection: ConnectionKind, queue_system: QueueSystem) -> Self {
        let mut config = Self::default();
        config.set_connection_defaults(connection);
        config.set_queue_defaults(queue_system);
        config.name = name.to_string();
        config
    }

    pub fn is_local(&self) -> bool {
        self.connection == ConnectionKind::Local
    }

    pub fn is_web_based(&self) -> bool {
        self.queue_system == QueueSystem::Web
    }

    pub fn expanded_working_directory(&self) -> String {
        shellexpand::tilde(&self.working_directory).to_string()
    }

    /// Applies per-transport defaults. Idempotent so the configurator can
    /// re-apply them every time the user flips the connection type.
    pub fn set_connection_defaults(&mut self, connection: ConnectionKind) {
        log_debug!("Setting connection defaults for {}", connection);
        self.connection = connection;

        match connection {
            ConnectionKind::Local => {
                self.name = "Local".to_string();
                self.port = 0;
                self.host = "localhost".to_string();
                self.authentication = AuthMethod::None;
                self.user = whoami::username();
                self.working_directory = "~".to_string();
            }
            ConnectionKind::Ssh | ConnectionKind::Sftp => {
                self.name = "Server".to_string();
                self.port = 22;
                self.authentication = AuthMethod::Password;
                self.user = whoami::username();
                self.working_directory = String::new();
            }
            ConnectionKind::Http => {
                self.name = "QChem".to_string();
                self.port = 80;
                self.host = "qcloud.q-chem.com".to_string();
                self.user = "guest".to_string();
                self.working_directory = "(unused)".to_string();
                self.authentication = AuthMethod::None;
            }
            ConnectionKind::Https => {
                self.port = 443;
                self.host = "qcloud.q-chem.com".to_string();
                self.working_directory = "(unused)".to_string();
                self.authentication = AuthMethod::None;
            }
        }
    }

    /// Applies per-scheduler command templates. Idempotent.
    pub fn set_queue_defaults(&mut self, queue_system: QueueSystem) {
        log_debug!("Setting queue defaults for {}", queue_system);
        self.update_interval = 20;
        self.queue_system = queue_system;

        match queue_system {
            QueueSystem::Basic => {
                if self.is_local() {
                    self.update_interval = 10;
                }
                // The launch is a single simple command so the shell
                // applies the redirections in the child at fork time;
                // backgrounding a compound list would leave the submit
                // channel's stdout open until the job itself exits.
                self.submit =
                    "nohup /bin/sh -c 'cd ${JOB_DIR} && exec /bin/sh ${JOB_NAME}.run' > ${JOB_DIR}/${JOB_NAME}.log 2>&1 & echo $!"
                        .to_string();
                self.query = "ps -p ${JOB_ID} -o command=".to_string();
                self.kill = "kill -TERM ${JOB_ID}".to_string();
                self.queue_info = "(unused)".to_string();
                self.run_file_template = BASIC_RUN_FILE.to_string();
                self.job_limit = 1024;
                self.job_file_list = "find ${JOB_DIR} -type f".to_string();
            }

            QueueSystem::Pbs => {
                self.kill = "qdel ${JOB_ID}".to_string();
                self.query = "qstat -xf ${JOB_ID}".to_string();
                self.submit = "cd ${JOB_DIR} && qsub ${JOB_NAME}.run".to_string();
                self.queue_info = "qstat -fQ".to_string();
                self.job_file_list = "find ${JOB_DIR} -type f".to_string();
                self.run_file_template = PBS_RUN_FILE.to_string();
            }

            QueueSystem::Sge => {
                self.kill = "qdel ${JOB_ID}".to_string();
                // SGE's qstat -j does not report the state column, so the
                // query runs the plain listing first and lets the second
                // command short-circuit once the job has left the queue.
                self.query = "qstat && qstat -j ${JOB_ID}".to_string();
                self.submit = "cd ${JOB_DIR} && qsub ${JOB_NAME}.run".to_string();
                self.queue_info = "qstat -g c".to_string();
                self.job_file_list = "find ${JOB_DIR} -type f".to_string();
                self.run_file_template = SGE_RUN_FILE.to_string();
            }

            QueueSystem::Slurm => {
                self.kill = "scancel ${JOB_ID}".to_string();
                self.query = "squeue -h -j ${JOB_ID} -o '%i %t'".to_string();
                self.submit = "cd ${JOB_DIR} && sbatch ${JOB_NAME}.run".to_string();
                self.queue_info = "sinfo".to_string();
                self.job_file_list = "find ${JOB_DIR} -type f".to_string();
                self.run_file_template = SLURM_RUN_FILE.to_string();
            }

            QueueSystem::Web => {
                self.kill = "GET  /delete?cookie=${COOKIE}&jobid=${JOB_ID}".to_string();
                self.query = "GET  /status?cookie=${COOKIE}&jobid=${JOB_ID}".to_string();
                self.submit = "POST /submit?cookie=${COOKIE}".to_string();
                self.queue_info =
                    "GET  /download?cookie=${COOKIE}&jobid=${JOB_ID}&file=${FILE_NAME}".to_string();
                self.run_file_template = "(unused)".to_string();
                self.job_file_list = "GET /list?cookie=${COOKIE}&jobid=${JOB_ID}".to_string();
            }
        }
    }

    /// Flattens the configuration into the stable field-name → value map
    /// used by the registry's saved state.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(FIELD_SERVER_NAME.into(), Value::from(self.name.clone()));
        map.insert(
            FIELD_CONNECTION.into(),
            Value::from(self.connection.to_string()),
        );
        map.insert(
            FIELD_QUEUE_SYSTEM.into(),
            Value::from(self.queue_system.to_string()),
        );
        map.insert(FIELD_HOST_ADDRESS.into(), Value::from(self.host.clone()));
        map.insert(FIELD_USER_NAME.into(), Value::from(self.user.clone()));
        map.insert(FIELD_PORT.into(), Value::from(self.port));
        map.insert(
            FIELD_AUTHENTICATION.into(),
            Value::from(self.authentication.to_string()),
        );
        map.insert(
            FIELD_WORKING_DIRECTORY.into(),
            Value::from(self.working_directory.clone()),
        );
        map.insert(FIELD_SUBMIT.into(), Value::from(self.submit.clone()));
        map.insert(FIELD_QUERY.into(), Value::from(self.query.clone()));
        map.insert(FIELD_QUEUE_INFO.into(), Value::from(self.queue_info.clone()));
        map.insert(FIELD_KILL.into(), Value::from(self.kill.clone()));
        map.insert(
            FIELD_UPDATE_INTERVAL.into(),
            Value::from(self.update_interval),
        );
        map.insert(FIELD_JOB_LIMIT.into(), Value::from(self.job_limit));
        map.insert(
            FIELD_RUN_FILE_TEMPLATE.into(),
            Value::from(self.run_file_template.clone()),
        );
        map.insert(FIELD_COOKIE.into(), Value::from(self.cookie.clone()));
        map.insert(
            FIELD_JOB_FILE_LIST.into(),
            Value::from(self.job_file_list.clone()),
        );
        if !self.queue_resources.is_empty() {
            let list: Vec<Value> = self
                .queue_resources
                .iter()
                .filter_map(|q| serde_json::to_value(q).ok())
                .collect();
            map.insert(FIELD_QUEUE_RESOURCES.into(), Value::from(list));
        }
        map
    }

    /// Rebuilds a configuration from a saved map. A map carrying the old
    /// "Type" key is a legacy record and is migrated instead. Invalid field
    /// values are logged and replaced with defaults so one bad field does
    /// not lose the whole server.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        if map.contains_key("Type") {
            return Ok(Self::from_legacy_map(map));
        }

        let name = map
            .get(FIELD_SERVER_NAME)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingField {
                server: "<unnamed>".to_string(),
                field: FIELD_SERVER_NAME,
            })?;

        let mut config = Self::default();
        let connection = map
            .get(FIELD_CONNECTION)
            .and_then(Value::as_str)
            .map(ConnectionKind::parse)
            .unwrap_or(ConnectionKind::Local);
        let queue_system = map
            .get(FIELD_QUEUE_SYSTEM)
            .and_then(Value::as_str)
            .map(QueueSystem::parse)
            .unwrap_or(QueueSystem::Basic);
        config.set_connection_defaults(connection);
        config.set_queue_defaults(queue_system);
        config.name = name;

        if let Some(value) = map.get(FIELD_AUTHENTICATION).and_then(Value::as_str) {
            config.authentication = AuthMethod::parse(value);
        }

        let string_fields: [(&str, &mut String); 9] = [
            (FIELD_HOST_ADDRESS, &mut config.host),
            (FIELD_USER_NAME, &mut config.user),
            (FIELD_WORKING_DIRECTORY, &mut config.working_directory),
            (FIELD_SUBMIT, &mut config.submit),
            (FIELD_QUERY, &mut config.query),
            (FIELD_QUEUE_INFO, &mut config.queue_info),
            (FIELD_KILL, &mut config.kill),
            (FIELD_RUN_FILE_TEMPLATE, &mut config.run_file_template),
            (FIELD_JOB_FILE_LIST, &mut config.job_file_list),
        ];
        for (field, slot) in string_fields {
            if let Some(value) = map.get(field).and_then(Value::as_str) {
                *slot = value.to_string();
            }
        }

        if let Some(value) = map.get(FIELD_COOKIE).and_then(Value::as_str) {
            config.cookie = value.to_string();
        }

        config.port = read_number(map, FIELD_PORT).unwrap_or(config.port as u64) as u16;
        config.update_interval =
            read_number(map, FIELD_UPDATE_INTERVAL).unwrap_or(config.update_interval);
        config.job_limit = read_number(map, FIELD_JOB_LIMIT).unwrap_or(config.job_limit as u64) as u32;

        if let Some(Value::Array(list)) = map.get(FIELD_QUEUE_RESOURCES) {
            config.queue_resources = list
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect();
        }

        Ok(config)
    }

    // Migration from the flat map written by versions that predate the
    // current field set. One-way; the old Vault and None authentication
    // codes have no current equivalent and collapse to Password.
    fn from_legacy_map(map: &Map<String, Value>) -> Self {
        let mut config = Self::default();

        if let Some(host) = map.get("Host").and_then(Value::as_i64) {
            let connection = match host {
                0 => ConnectionKind::Local,
                1 => ConnectionKind::Ssh,
                2 => ConnectionKind::Http,
                _ => ConnectionKind::Local,
            };
            config.set_connection_defaults(connection);
        }

        if let Some(kind) = map.get("Type").and_then(Value::as_i64) {
            let queue = match kind {
                0 => QueueSystem::Basic,
                1 => QueueSystem::Pbs,
                2 => QueueSystem::Sge,
                3 => QueueSystem::Web,
                _ => QueueSystem::Basic,
            };
            config.set_queue_defaults(queue);
        }

        if let Some(auth) = map.get("Authentication").and_then(Value::as_i64) {
            config.authentication = match auth {
                1 => AuthMethod::Agent,
                2 => AuthMethod::PublicKey,
                3 => AuthMethod::HostBased,
                4 => AuthMethod::KeyboardInteractive,
                _ => AuthMethod::Password,
            };
        }

        match map.get("Name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => config.name = name.to_string(),
            _ => {
                config.name = "Server".to_string();
                log_warn!("Server name not set in legacy configuration");
            }
        }

        let string_fields: [(&str, &mut String); 6] = [
            ("HostAddress", &mut config.host),
            ("UserName", &mut config.user),
            ("WorkingDirectory", &mut config.working_directory),
            ("SubmitCommand", &mut config.submit),
            ("QueryCommand", &mut config.query),
            ("KillCommand", &mut config.kill),
        ];
        for (field, slot) in string_fields {
            if let Some(value) = map.get(field).and_then(Value::as_str) {
                *slot = value.to_string();
            }
        }
        if let Some(value) = map.get("QueueInfo").and_then(Value::as_str) {
            config.queue_info = value.to_string();
        }
        if let Some(value) = map.get("RunFileTemplate").and_then(Value::as_str) {
            config.run_file_template = value.to_string();
        }

        if let Some(port) = map.get("Port").and_then(Value::as_u64) {
            config.port = port as u16;
        }
        if let Some(interval) = map.get("UpdateInterval").and_then(Value::as_u64) {
            config.update_interval = interval;
        }
        if let Some(limit) = map.get("JobLimit").and_then(Value::as_u64) {
            config.job_limit = limit as u32;
        }

        config
    }

    /// Standalone export of a single configuration.
    pub fn to_toml(&self) -> Result<String> {
        let mut table = toml::Table::new();
        for (key, value) in self.to_map() {
            table.insert(key, json_to_toml(value));
        }
        Ok(toml::to_string_pretty(&table)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let table: toml::Table = text.parse()?;
        let mut map = Map::new();
        for (key, value) in table {
            map.insert(key, toml_to_json(value));
        }
        Self::from_map(&map)
    }
}

fn read_number(map: &Map<String, Value>, field: &'static str) -> Option<u64> {
    match map.get(field) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        Some(other) => {
            log_warn!("Ignoring invalid value for field '{}': {}", field, other);
            None
        }
        None => None,
    }
}

fn json_to_toml(value: Value) -> toml::Value {
    match value {
        Value::String(s) => toml::Value::String(s),
        Value::Bool(b) => toml::Value::Boolean(b),
        Value::Number(n) => toml::Value::Integer(n.as_i64().unwrap_or(0)),
        Value::Array(list) => toml::Value::Array(list.into_iter().map(json_to_toml).collect()),
        Value::Object(map) => {
            let mut table = toml::Table::new();
            for (key, value) in map {
                table.insert(key, json_to_toml(value));
            }
            toml::Value::Table(table)
        }
        Value::Null => toml::Value::String(String::new()),
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Integer(n) => Value::from(n),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Array(list) => Value::Array(list.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            let mut map = Map::new();
            for (key, value) in table {
                map.insert(key, toml_to_json(value));
            }
            Value::Object(map)
        }
        toml::Value::Datetime(d) => Value::String(d.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_reappliable() {
        let mut config = ServerConfig::new("cluster", ConnectionKind::Ssh, QueueSystem::Pbs);
        assert_eq!(config.port, 22);
        assert_eq!(config.kill, "qdel ${JOB_ID}");
        assert_eq!(config.update_interval, 20);

        config.set_queue_defaults(QueueSystem::Sge);
        assert_eq!(config.query, "qstat && qstat -j ${JOB_ID}");
        config.set_queue_defaults(QueueSystem::Pbs);
        assert_eq!(config.query, "qstat -xf ${JOB_ID}");
    }

    #[test]
    fn test_local_basic_shortens_update_interval() {
        let config = ServerConfig::new("local", ConnectionKind::Local, QueueSystem::Basic);
        assert_eq!(config.update_interval, 10);

        let remote = ServerConfig::new("remote", ConnectionKind::Ssh, QueueSystem::Basic);
        assert_eq!(remote.update_interval, 20);
    }

    #[test]
    fn test_map_round_trip_uses_stable_keys() {
        let mut config = ServerConfig::new("tycho", ConnectionKind::Ssh, QueueSystem::Pbs);
        config.host = "tycho.example.edu".to_string();
        config.user = "aglbrt".to_string();
        config.working_directory = "/scratch/aglbrt".to_string();

        let map = config.to_map();
        assert_eq!(map.get("Server Name").unwrap(), "tycho");
        assert_eq!(map.get("Connection").unwrap(), "SSH");
        assert_eq!(map.get("Queue System").unwrap(), "PBS");
        assert_eq!(map.get("Host Address").unwrap(), "tycho.example.edu");

        let restored = ServerConfig::from_map(&map).unwrap();
        assert_eq!(restored.name, config.name);
        assert_eq!(restored.connection, ConnectionKind::Ssh);
        assert_eq!(restored.queue_system, QueueSystem::Pbs);
        assert_eq!(restored.host, config.host);
        assert_eq!(restored.user, config.user);
        assert_eq!(restored.working_directory, config.working_directory);
        assert_eq!(restored.port, 22);
        assert_eq!(restored.submit, config.submit);
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let map = Map::new();
        assert!(matches!(
            ServerConfig::from_map(&map),
            Err(CoreError::MissingField { .. })
        ));
    }

    #[test]
    fn test_legacy_map_is_detected_and_migrated() {
        let mut map = Map::new();
        map.insert("Name".into(), Value::from("old-cluster"));
        map.insert("Host".into(), Value::from(1));
        map.insert("Type".into(), Value::from(1));
        map.insert("Authentication".into(), Value::from(2));
        map.insert("HostAddress".into(), Value::from("pbs.example.edu"));
        map.insert("UserName".into(), Value::from("rms"));
        map.insert("Port".into(), Value::from(2022));
        map.insert("SubmitCommand".into(), Value::from("qsub ${JOB_NAME}.run"));

        let config = ServerConfig::from_map(&map).unwrap();
        assert_eq!(config.name, "old-cluster");
        assert_eq!(config.connection, ConnectionKind::Ssh);
        assert_eq!(config.queue_system, QueueSystem::Pbs);
        assert_eq!(config.authentication, AuthMethod::PublicKey);
        assert_eq!(config.host, "pbs.example.edu");
        assert_eq!(config.user, "rms");
        assert_eq!(config.port, 2022);
        assert_eq!(config.submit, "qsub ${JOB_NAME}.run");
        // Fields the legacy format never carried keep the dialect defaults.
        assert_eq!(config.queue_info, "qstat -fQ");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ServerConfig::new("web", ConnectionKind::Https, QueueSystem::Web);
        config.cookie = "f81d4fae7dec".to_string();

        let text = config.to_toml().unwrap();
        let restored = ServerConfig::from_toml(&text).unwrap();
        assert_eq!(restored.name, "web");
        assert_eq!(restored.connection, ConnectionKind::Https);
        assert_eq!(restored.queue_system, QueueSystem::Web);
        assert_eq!(restored.cookie, "f81d4fae7dec");
        assert_eq!(restored.port, 443);
    }

    #[test]
    fn test_forgiving_enum_parsing() {
        assert_eq!(ConnectionKind::parse("ssh"), ConnectionKind::Ssh);
        assert_eq!(ConnectionKind::parse("SFTP"), ConnectionKind::Sftp);
        assert_eq!(ConnectionKind::parse("https"), ConnectionKind::Https);
        assert_eq!(ConnectionKind::parse("anything"), ConnectionKind::Local);
        assert_eq!(QueueSystem::parse("slurm"), QueueSystem::Slurm);
        assert_eq!(QueueSystem::parse("other"), QueueSystem::Basic);
        assert_eq!(AuthMethod::parse("SSH Public Key"), AuthMethod::PublicKey);
        assert_eq!(AuthMethod::parse("whatever"), AuthMethod::Password);
    }
}
