use crate::error::Result;
use crate::server::Server;
use molq_core::config::ServerConfig;
use molq_core::error::CoreError;
use molq_core::{log_debug, log_warn};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// The application's collection of configured servers. Constructed
/// explicitly at startup, saved explicitly on change and before exit;
/// there is no global instance.
pub struct ServerRegistry {
    servers: Vec<Server>,
    path: PathBuf,
}

impl ServerRegistry {
    pub fn new(path: &Path) -> Self {
        Self {
            servers: Vec::new(),
            path: path.to_path_buf(),
        }
    }

    /// The default on-disk location for the saved registry.
    pub fn default_path() -> Result<PathBuf> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("molq");
        let state_home = xdg_dirs
            .get_state_home()
            .ok_or(CoreError::StateDirNotFound)?;
        Ok(state_home.join("servers.json"))
    }

    /// Loads the saved registry. A missing file is an empty registry; a
    /// malformed entry loses that server only, the rest still load.
    pub fn load(path: &Path) -> Result<Self> {
        let mut registry = Self::new(path);

        let text = match fs_err::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => return Err(e.into()),
        };

        let entries: Vec<Value> = serde_json::from_str(&text).map_err(CoreError::Json)?;
        for entry in entries {
            let Value::Object(map) = entry else {
                log_warn!("Skipping malformed server entry in {}", path.display());
                continue;
            };
            match ServerConfig::from_map(&map) {
                Ok(config) => {
                    log_debug!("Loaded server configuration '{}'", config.name);
                    registry.servers.push(Server::new(config));
                }
                Err(e) => {
                    log_warn!("Skipping server entry in {}: {}", path.display(), e);
                }
            }
        }

        Ok(registry)
    }

    pub fn save(&self) -> Result<()> {
        let entries: Vec<Value> = self
            .servers
            .iter()
            .map(|server| Value::Object(server.config().to_map()))
            .collect();
        let text = serde_json::to_string_pretty(&entries).map_err(CoreError::Json)?;

        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::write(&self.path, text)?;
        Ok(())
    }

    pub fn available_servers(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Adds a server, de-duplicating the name with an `_N` suffix if a
    /// server of that name already exists.
    pub fn add(&mut self, mut config: ServerConfig) -> &mut Server {
        let base = config.name.clone();
        let mut name = base.clone();
        let mut count = 0;
        while self.find(&name).is_some() {
            count += 1;
            name = format!("{}_{}", base, count);
        }
        config.name = name;

        self.servers.push(Server::new(config));
        self.servers.last_mut().unwrap()
    }

    pub fn find(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name() == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.name() == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Server> {
        let index = self.servers.iter().position(|s| s.name() == name)?;
        Some(self.servers.remove(index))
    }

    pub fn move_up(&mut self, name: &str) {
        if let Some(index) = self.servers.iter().position(|s| s.name() == name) {
            if index > 0 {
                self.servers.swap(index, index - 1);
            }
        }
    }

    pub fn move_down(&mut self, name: &str) {
        if let Some(index) = self.servers.iter().position(|s| s.name() == name) {
            if index + 1 < self.servers.len() {
                self.servers.swap(index, index + 1);
            }
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn servers_mut(&mut self) -> &mut [Server] {
        &mut self.servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molq_core::config::{ConnectionKind, QueueSystem};

    fn registry_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("servers.json")
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServerRegistry::load(&registry_path(&dir)).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = registry_path(&dir);

        let mut registry = ServerRegistry::new(&path);
        registry.add(ServerConfig::new("local", ConnectionKind::Local, QueueSystem::Basic));
        let mut cluster = ServerConfig::new("cluster", ConnectionKind::Ssh, QueueSystem::Pbs);
        cluster.host = "hpc.example.edu".to_string();
        registry.add(cluster);
        registry.save().unwrap();

        let restored = ServerRegistry::load(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.available_servers(), vec!["local", "cluster"]);
        let cluster = restored.find("cluster").unwrap();
        assert_eq!(cluster.config().host, "hpc.example.edu");
        assert_eq!(cluster.config().queue_system, QueueSystem::Pbs);
    }

    #[test]
    fn test_bad_entry_does_not_abort_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = registry_path(&dir);

        // Second entry has no "Server Name"; the third is not even a map.
        let text = r#"[
            {"Server Name": "good", "Connection": "SSH", "Queue System": "PBS"},
            {"Connection": "SSH"},
            "nonsense"
        ]"#;
        fs_err::write(&path, text).unwrap();

        let registry = ServerRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.find("good").is_some());
    }

    #[test]
    fn test_add_deduplicates_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ServerRegistry::new(&registry_path(&dir));

        registry.add(ServerConfig::new("cluster", ConnectionKind::Ssh, QueueSystem::Pbs));
        registry.add(ServerConfig::new("cluster", ConnectionKind::Ssh, QueueSystem::Sge));
        registry.add(ServerConfig::new("cluster", ConnectionKind::Ssh, QueueSystem::Slurm));

        assert_eq!(
            registry.available_servers(),
            vec!["cluster", "cluster_1", "cluster_2"]
        );
    }

    #[test]
    fn test_reorder_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ServerRegistry::new(&registry_path(&dir));
        registry.add(ServerConfig::new("a", ConnectionKind::Local, QueueSystem::Basic));
        registry.add(ServerConfig::new("b", ConnectionKind::Local, QueueSystem::Basic));
        registry.add(ServerConfig::new("c", ConnectionKind::Local, QueueSystem::Basic));

        registry.move_up("b");
        assert_eq!(registry.available_servers(), vec!["b", "a", "c"]);
        registry.move_down("a");
        assert_eq!(registry.available_servers(), vec!["b", "c", "a"]);
        registry.move_up("b");
        assert_eq!(registry.available_servers(), vec!["b", "c", "a"]);

        assert!(registry.remove("c").is_some());
        assert_eq!(registry.available_servers(), vec!["b", "a"]);
        assert!(registry.remove("zzz").is_none());
    }

    #[test]
    fn test_legacy_entries_migrate_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = registry_path(&dir);

        let text = r#"[
            {"Name": "oldie", "Host": 1, "Type": 1, "HostAddress": "pbs.example.edu"}
        ]"#;
        fs_err::write(&path, text).unwrap();

        let registry = ServerRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
        let server = registry.find("oldie").unwrap();
        assert_eq!(server.config().connection, ConnectionKind::Ssh);
        assert_eq!(server.config().queue_system, QueueSystem::Pbs);
        assert_eq!(server.config().host, "pbs.example.edu");
    }
}
