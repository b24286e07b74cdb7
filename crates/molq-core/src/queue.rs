use crate::log_debug;
use serde::{Deserialize, Serialize};

fn default_wall_time_max() -> String {
    "72:00:00".to_string()
}

fn default_wall_time() -> String {
    "1:00:00".to_string()
}

/// Limits for one scheduler queue, scraped from a queue-info command's
/// output. Memory and scratch are always megabytes, whatever units the
/// scheduler reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueResources {
    pub name: String,
    #[serde(default = "default_wall_time_max")]
    pub max_wall_time: String,
    #[serde(default = "default_wall_time")]
    pub default_wall_time: String,
    #[serde(default)]
    pub max_memory: u32,
    #[serde(default)]
    pub min_memory: u32,
    #[serde(default)]
    pub default_memory: u32,
    #[serde(default)]
    pub max_scratch: u32,
    #[serde(default)]
    pub min_scratch: u32,
    #[serde(default)]
    pub default_scratch: u32,
    #[serde(default)]
    pub max_cpus: u32,
    #[serde(default)]
    pub min_cpus: u32,
    #[serde(default)]
    pub default_cpus: u32,
}

impl QueueResources {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_wall_time: default_wall_time_max(),
            default_wall_time: default_wall_time(),
            max_memory: 16384,
            min_memory: 1,
            default_memory: 4096,
            max_scratch: 16384,
            min_scratch: 1,
            default_scratch: 4096,
            max_cpus: 32,
            min_cpus: 1,
            default_cpus: 1,
        }
    }
}

/// Normalizes a scheduler memory/scratch figure ("8gb", "512mb") to
/// megabytes. Unrecognized units yield 0 rather than a guess.
pub fn parse_resource(raw: &str) -> u32 {
    let value = raw.trim().to_lowercase();

    let (digits, scale) = if let Some(stripped) = value.strip_suffix("gb") {
        (stripped, 1024)
    } else if let Some(stripped) = value.strip_suffix("mb") {
        (stripped, 1)
    } else {
        log_debug!("Failed to parse resource: {}", raw);
        return 0;
    };

    match digits.trim().parse::<u32>() {
        Ok(n) => n * scale,
        Err(_) => {
            log_debug!("Failed to parse resource: {}", raw);
            0
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueResourcesList {
    queues: Vec<QueueResources>,
}

impl QueueResourcesList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queues(&self) -> &[QueueResources] {
        &self.queues
    }

    pub fn into_queues(self) -> Vec<QueueResources> {
        self.queues
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&QueueResources> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Scrapes a `qstat -fQ` report. Each `Queue: <name>` line opens a new
    /// section whose `resources_*` lines fill in the limits.
    pub fn from_pbs_queue_info(queue_info: &str) -> Self {
        let mut list = Self::new();

        for line in queue_info.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();

            if line.contains("Queue: ") && tokens.len() >= 2 {
                list.queues.push(QueueResources::new(tokens[1]));
            }

            let Some(queue) = list.queues.last_mut() else {
                break;
            };
            if tokens.len() < 3 {
                continue;
            }
            let value = tokens[2];

            if line.contains("resources_max.walltime") {
                queue.max_wall_time = value.to_string();
            } else if line.contains("resources_default.walltime") {
                queue.default_wall_time = value.to_string();
            } else if line.contains("resources_max.vmem") {
                queue.max_memory = parse_resource(value);
            } else if line.contains("resources_min.vmem") {
                queue.min_memory = parse_resource(value);
            } else if line.contains("resources_default.vmem") {
                queue.default_memory = parse_resource(value);
            } else if line.contains("resources_max.jobfs") {
                queue.max_scratch = parse_resource(value);
            } else if line.contains("resources_min.jobfs") {
                queue.min_scratch = parse_resource(value);
            } else if line.contains("resources_default.jobfs") {
                queue.default_scratch = parse_resource(value);
            } else if line.contains("resources_max.ncpus") {
                if let Ok(n) = value.parse() {
                    queue.max_cpus = n;
                }
            } else if line.contains("resources_min.ncpus") {
                if let Ok(n) = value.parse() {
                    queue.min_cpus = n;
                }
            } else if line.contains("resources_default.ncpus") {
                if let Ok(n) = value.parse() {
                    queue.default_cpus = n;
                }
            }
        }

        list
    }

    /// SGE's `qstat -g c` report only yields queue names; the limits keep
    /// their defaults. The names follow the dashed header line.
    pub fn from_sge_queue_info(queue_info: &str) -> Self {
        let mut list = Self::new();
        let mut seen_header = false;

        for line in queue_info.lines() {
            if !seen_header {
                seen_header = line.contains("--------------------");
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() > 1 {
                list.queues.push(QueueResources::new(tokens[0]));
            }
        }

        list
    }

    /// `sinfo` partition listing; only the names are usable. The default
    /// partition's trailing asterisk is stripped and repeated node lines
    /// for the same partition are collapsed.
    pub fn from_slurm_queue_info(queue_info: &str) -> Self {
        let mut list = Self::new();
        let mut seen_header = false;

        for line in queue_info.lines() {
            if !seen_header {
                seen_header = line.contains("PARTITION");
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if let Some(first) = tokens.first() {
                let name = first.trim_end_matches('*');
                if !name.is_empty() && list.find(name).is_none() {
                    list.queues.push(QueueResources::new(name));
                }
            }
        }

        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_units() {
        assert_eq!(parse_resource("4gb"), 4096);
        assert_eq!(parse_resource("512mb"), 512);
        assert_eq!(parse_resource("8GB"), 8192);
        assert_eq!(parse_resource("16"), 0);
        assert_eq!(parse_resource("lots"), 0);
        assert_eq!(parse_resource(""), 0);
    }

    #[test]
    fn test_pbs_queue_info_round_trip() {
        let info = "Queue: workq\n\
                    \x20   queue_type = Execution\n\
                    \x20   resources_max.walltime = 24:00:00\n\
                    \x20   resources_max.vmem = 8gb\n\
                    \x20   resources_default.vmem = 2gb\n\
                    \x20   resources_max.ncpus = 16\n\
                    \x20   enabled = True\n";

        let list = QueueResourcesList::from_pbs_queue_info(info);
        assert_eq!(list.queues().len(), 1);

        let queue = list.find("workq").unwrap();
        assert_eq!(queue.max_wall_time, "24:00:00");
        assert_eq!(queue.max_memory, 8192);
        assert_eq!(queue.default_memory, 2048);
        assert_eq!(queue.max_cpus, 16);
    }

    #[test]
    fn test_pbs_multiple_queues() {
        let info = "Queue: workq\n\
                    \x20   resources_max.walltime = 24:00:00\n\
                    Queue: express\n\
                    \x20   resources_max.walltime = 1:00:00\n\
                    \x20   resources_max.jobfs = 100gb\n";

        let list = QueueResourcesList::from_pbs_queue_info(info);
        assert_eq!(list.queues().len(), 2);
        assert_eq!(list.find("workq").unwrap().max_wall_time, "24:00:00");
        assert_eq!(list.find("express").unwrap().max_wall_time, "1:00:00");
        assert_eq!(list.find("express").unwrap().max_scratch, 102400);
    }

    #[test]
    fn test_pbs_preamble_without_queue_stops_parse() {
        let info = "some banner text\nresources_max.walltime = 24:00:00\n";
        let list = QueueResourcesList::from_pbs_queue_info(info);
        assert!(list.is_empty());
    }

    #[test]
    fn test_sge_queue_names_after_header() {
        let info = "CLUSTER QUEUE      CQLOAD   USED   RES  AVAIL  TOTAL\n\
                    --------------------------------------------------\n\
                    all.q              0.48     24     0    8      32\n\
                    fast.q             0.01     0      0    16     16\n";

        let list = QueueResourcesList::from_sge_queue_info(info);
        assert_eq!(list.queues().len(), 2);
        assert!(list.find("all.q").is_some());
        assert!(list.find("fast.q").is_some());
    }

    #[test]
    fn test_slurm_partitions_deduplicated() {
        let info = "PARTITION AVAIL  TIMELIMIT  NODES  STATE NODELIST\n\
                    batch*       up   infinite      2    mix node[01-02]\n\
                    batch*       up   infinite      4   idle node[03-06]\n\
                    gpu          up   12:00:00      1   idle gpu01\n";

        let list = QueueResourcesList::from_slurm_queue_info(info);
        assert_eq!(list.queues().len(), 2);
        assert!(list.find("batch").is_some(), "asterisk should be stripped");
        assert!(list.find("gpu").is_some());
    }

    #[test]
    fn test_queue_resources_serde_round_trip() {
        let queue = QueueResources::new("workq");
        let value = serde_json::to_value(&queue).unwrap();
        let restored: QueueResources = serde_json::from_value(value).unwrap();
        assert_eq!(restored, queue);
    }
}
