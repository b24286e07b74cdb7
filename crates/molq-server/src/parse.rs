//! Text scrapers for the scheduler dialects. These formats are free text
//! rather than a protocol, so everything here is a pure function that maps
//! unexpected output to "don't know" instead of failing.

use molq_core::config::QueueSystem;
use molq_core::job::JobStatus;
use molq_core::timer::parse_hms;
use once_cell::sync::Lazy;
use regex::Regex;

// Header names arrive lowercased when scraped from an HTTP header block and
// in original case when embedded in a body, so the patterns ignore case on
// the name side and keep the value strict.
static WEB_STATUS_OK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[a-z0-9]+-status::\s*OK").unwrap());
static WEB_JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[a-z0-9]+-jobid::([0-9A-Za-z\-_]+)").unwrap());
static WEB_JOB_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[a-z0-9]+-jobstatus::([A-Za-z]+)").unwrap());
static SGE_CPU_USAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"cpu=([\d:]+)").unwrap());

/// Extracts the scheduler-assigned job id from a submit command's output.
/// Returns None when the output does not look like a successful submission.
pub fn parse_submit_output(queue_system: QueueSystem, output: &str) -> Option<String> {
    let tokens: Vec<&str> = output.split_whitespace().collect();

    match queue_system {
        // A successful qsub prints a single token holding the job id,
        // e.g. "12345.server".
        QueueSystem::Pbs => {
            if tokens.len() == 1 {
                Some(tokens[0].to_string())
            } else {
                None
            }
        }

        // "Your job 2834 ("test.sh") has been submitted"
        QueueSystem::Sge => {
            if output.contains("has been submitted") && tokens.len() > 2 {
                tokens[2].parse::<u64>().ok().map(|id| id.to_string())
            } else {
                None
            }
        }

        // "Submitted batch job 12345"
        QueueSystem::Slurm => {
            if output.contains("Submitted batch job") && tokens.len() > 3 {
                tokens[3].parse::<u64>().ok().map(|id| id.to_string())
            } else {
                None
            }
        }

        // An ad-hoc background launch prints the shell's job spec and/or
        // the pid, e.g. "[1] 9539" or a bare "9539"; the first integer
        // token is the process id.
        QueueSystem::Basic => tokens
            .iter()
            .find_map(|t| t.parse::<u64>().ok())
            .map(|id| id.to_string()),

        QueueSystem::Web => {
            if WEB_STATUS_OK.is_match(output) {
                WEB_JOB_ID
                    .captures(output)
                    .map(|caps| caps[1].to_string())
            } else {
                None
            }
        }
    }
}

/// What one query command's output said about a job.
#[derive(Debug, Default, PartialEq)]
pub struct QueryUpdate {
    pub status: Option<JobStatus>,
    pub run_time: Option<u64>,
    pub message: Option<String>,
}

/// Classifies a query command's output. `status: None` means the text could
/// not be understood; the caller treats that as Unknown rather than
/// guessing a definite state.
pub fn parse_query_output(queue_system: QueueSystem, job_id: &str, output: &str) -> QueryUpdate {
    match queue_system {
        QueueSystem::Pbs => parse_pbs_query(output),
        QueueSystem::Sge => parse_sge_query(job_id, output),
        QueueSystem::Slurm => parse_slurm_query(job_id, output),
        QueueSystem::Web => parse_web_query(output),
        QueueSystem::Basic => parse_basic_query(output),
    }
}

fn parse_pbs_query(output: &str) -> QueryUpdate {
    let mut update = QueryUpdate::default();

    if output.trim().is_empty() {
        // The job has left the queue; whether it succeeded is decided when
        // the results are inspected.
        update.status = Some(JobStatus::Finished);
        return update;
    }

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if line.contains("job_state =") && tokens.len() >= 3 {
            update.status = match tokens[2] {
                "R" | "E" => Some(JobStatus::Running),
                "S" | "H" => Some(JobStatus::Suspended),
                "Q" | "W" => Some(JobStatus::Queued),
                "F" => Some(JobStatus::Finished),
                _ => update.status,
            };
        } else if line.contains("resources_used.cput") {
            if let Some(time) = tokens.last().and_then(|t| parse_hms(t)) {
                update.run_time = Some(time);
            }
        } else if let Some(comment) = line.trim().strip_prefix("comment = ") {
            update.message = Some(comment.trim().to_string());
        }
    }

    update
}

fn parse_sge_query(job_id: &str, output: &str) -> QueryUpdate {
    let mut update = QueryUpdate::default();

    if output.trim().is_empty() || output.contains("not exist") {
        update.status = Some(JobStatus::Finished);
        return update;
    }

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if tokens.len() >= 5 && tokens[0].contains(job_id) {
            let state = tokens[4];
            if state.contains('q') {
                update.status = Some(JobStatus::Queued);
            } else if state.to_lowercase().contains('s') {
                update.status = Some(JobStatus::Suspended);
            } else if state.contains('r') {
                update.status = Some(JobStatus::Running);
            }
        } else if tokens
            .first()
            .is_some_and(|t| t.to_lowercase().contains("usage"))
        {
            if let Some(caps) = SGE_CPU_USAGE.captures(line) {
                update.run_time = parse_hms(&caps[1]);
            }
        }
    }

    // The query is "qstat && qstat -j ${JOB_ID}" and the interaction of the
    // two outputs is murky; a listing that no longer mentions the job is
    // read as finished rather than inferring anything fancier.
    if update.status.is_none() {
        update.status = Some(JobStatus::Finished);
    }

    update
}

fn parse_slurm_query(job_id: &str, output: &str) -> QueryUpdate {
    let mut update = QueryUpdate::default();

    if output.trim().is_empty() {
        update.status = Some(JobStatus::Finished);
        return update;
    }

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 2 && tokens[0] == job_id {
            update.status = match tokens[1] {
                "PD" | "CF" => Some(JobStatus::Queued),
                "R" | "CG" => Some(JobStatus::Running),
                "S" => Some(JobStatus::Suspended),
                _ => Some(JobStatus::Finished),
            };
        }
    }

    if update.status.is_none() {
        // squeue prints errors like "Invalid job id specified" once the
        // job has aged out of the queue.
        update.status = Some(JobStatus::Finished);
    }

    update
}

fn parse_web_query(output: &str) -> QueryUpdate {
    let mut update = QueryUpdate::default();

    if !WEB_STATUS_OK.is_match(output) {
        return update;
    }

    if let Some(caps) = WEB_JOB_STATUS.captures(output) {
        update.status = match caps[1].to_uppercase().as_str() {
            "DONE" => Some(JobStatus::Finished),
            "RUNNING" => Some(JobStatus::Running),
            "QUEUED" => Some(JobStatus::Queued),
            "ERROR" => Some(JobStatus::Error),
            _ => None,
        };
    }

    update
}

fn parse_basic_query(output: &str) -> QueryUpdate {
    let trimmed = output.trim();
    let gone = trimmed.is_empty()
        || trimmed.contains("no such process")
        || trimmed.contains("not exist");

    QueryUpdate {
        status: Some(if gone {
            JobStatus::Finished
        } else {
            JobStatus::Running
        }),
        run_time: None,
        message: None,
    }
}

/// Splits a file-listing command's output into remote paths, dropping
/// blank lines and the service's `pathtable` bookkeeping entry.
pub fn parse_file_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "pathtable")
        .map(str::to_string)
        .collect()
}
