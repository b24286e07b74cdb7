use crate::timer::Timer;
use crate::{log_debug, log_warn};
use chrono::Local;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Unknown,
    Queued,
    Running,
    Suspended,
    Finished,
    Error,
    Killed,
    Copying,
}

impl JobStatus {
    /// Active jobs stay in a server's watch set and keep being polled.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Unknown | JobStatus::Queued | JobStatus::Running | JobStatus::Suspended
        )
    }

    /// Terminal states are absorbing: no later transition may leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error | JobStatus::Killed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Unknown => "Unknown",
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Suspended => "Suspended",
            JobStatus::Finished => "Finished",
            JobStatus::Error => "Error",
            JobStatus::Killed => "Killed",
            JobStatus::Copying => "Copying",
        };
        write!(f, "{}", s)
    }
}

/// Scheduler resource request substituted into run-file templates.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    pub queue: String,
    pub wall_time: String,
    pub memory_mb: u32,
    pub scratch_mb: u32,
    pub ncpus: u32,
}

/// One unit of work tracked through its scheduler lifecycle. The job id is
/// the scheduler's external handle (a pid for basic servers, the PBS/SGE/
/// SLURM job number, or the web service's token) and is only assigned after
/// submission.
#[derive(Debug)]
pub struct Job {
    base_name: String,
    server_name: String,
    input: String,
    job_id: String,
    remote_working_directory: String,
    local_working_directory: String,
    status: JobStatus,
    message: String,
    submit_time: String,
    copy_progress: f64,
    resources: ResourceRequest,
    timer: Timer,
}

impl Job {
    pub fn new(base_name: &str, server_name: &str, input: &str) -> Self {
        Self {
            base_name: base_name.to_string(),
            server_name: server_name.to_string(),
            input: input.to_string(),
            job_id: String::new(),
            remote_working_directory: String::new(),
            local_working_directory: String::new(),
            status: JobStatus::Unknown,
            message: String::new(),
            submit_time: String::new(),
            copy_progress: 0.0,
            resources: ResourceRequest::default(),
            timer: Timer::new(),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn set_job_id(&mut self, id: &str) {
        self.job_id = id.to_string();
    }

    pub fn remote_working_directory(&self) -> &str {
        &self.remote_working_directory
    }

    pub fn set_remote_working_directory(&mut self, dir: &str) {
        self.remote_working_directory = dir.trim_end_matches('/').to_string();
    }

    pub fn local_working_directory(&self) -> &str {
        &self.local_working_directory
    }

    pub fn set_local_working_directory(&mut self, dir: &str) {
        self.local_working_directory = dir.trim_end_matches('/').to_string();
    }

    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    pub fn set_resources(&mut self, resources: ResourceRequest) {
        self.resources = resources;
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn set_message(&mut self, message: &str) {
        self.message = message.to_string();
    }

    pub fn submit_time(&self) -> &str {
        &self.submit_time
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn copy_progress(&self) -> f64 {
        self.copy_progress
    }

    pub fn set_copy_progress(&mut self, fraction: f64) {
        self.copy_progress = fraction.clamp(0.0, 1.0);
    }

    /// The run timer may drift from the actual process (a suspended job
    /// stops it, for example); schedulers that report cpu time overwrite it.
    pub fn reset_timer(&mut self, seconds: u64) {
        self.timer.reset(seconds);
    }

    pub fn run_time(&self) -> u64 {
        self.timer.elapsed()
    }

    pub fn set_status(&mut self, status: JobStatus, message: Option<&str>) {
        // Finished jobs may still have their results copied back; Copying
        // is the one transition allowed out of a terminal state.
        let copying_results = self.status == JobStatus::Finished && status == JobStatus::Copying;
        if self.status.is_terminal() && status != self.status && !copying_results {
            log_warn!(
                "Ignoring status change {} -> {} for terminal job '{}'",
                self.status,
                status,
                self.base_name
            );
            return;
        }

        if self.status != status {
            log_debug!("Job '{}' status {} -> {}", self.base_name, self.status, status);
        }
        self.status = status;
        self.message = match message {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => status.to_string(),
        };

        match status {
            JobStatus::Queued => {
                self.submit_time = Local::now().format("%H:%M:%S").to_string();
            }
            JobStatus::Running => self.timer.start(),
            JobStatus::Suspended
            | JobStatus::Finished
            | JobStatus::Error
            | JobStatus::Killed
            | JobStatus::Unknown => self.timer.stop(),
            JobStatus::Copying => {}
        }
    }

    /// Literal replacement of the job-level template tokens. Unresolved
    /// tokens are left in place so site-specific macros survive untouched.
    pub fn substitute_macros(&self, input: &str) -> String {
        let output = input
            .replace("${JOB_ID}", &self.job_id)
            .replace("${JOB_NAME}", &self.base_name)
            .replace("${JOB_DIR}", &self.remote_working_directory)
            .replace("${QUEUE}", &self.resources.queue)
            .replace("${WALLTIME}", &self.resources.wall_time)
            .replace("${MEMORY}", &self.resources.memory_mb.to_string())
            .replace("${JOBFS}", &self.resources.scratch_mb.to_string())
            .replace("${SCRATCH}", &self.resources.scratch_mb.to_string())
            .replace("${NCPUS}", &self.resources.ncpus.to_string());

        if output.contains("${") {
            log_warn!("Unmatched macros found in string: {}", input);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        let mut job = Job::new("water", "cluster", "$molecule\n0 1\nO\n$end");
        job.set_job_id("12345.server");
        job.set_remote_working_directory("/scratch/water");
        job.set_resources(ResourceRequest {
            queue: "workq".into(),
            wall_time: "1:00:00".into(),
            memory_mb: 2048,
            scratch_mb: 4096,
            ncpus: 4,
        });
        job
    }

    #[test]
    fn test_macro_substitution_round_trip() {
        let job = test_job();
        assert_eq!(job.substitute_macros("${JOB_ID}"), "12345.server");
        assert_eq!(job.substitute_macros("${JOB_NAME}"), "water");
        assert_eq!(job.substitute_macros("${JOB_DIR}"), "/scratch/water");
        assert_eq!(job.substitute_macros("${QUEUE}"), "workq");
        assert_eq!(job.substitute_macros("${WALLTIME}"), "1:00:00");
        assert_eq!(job.substitute_macros("${MEMORY}"), "2048");
        assert_eq!(job.substitute_macros("${SCRATCH}"), "4096");
        assert_eq!(job.substitute_macros("${NCPUS}"), "4");
    }

    #[test]
    fn test_unrecognized_macro_left_verbatim() {
        let job = test_job();
        assert_eq!(job.substitute_macros("${NOT_A_MACRO}"), "${NOT_A_MACRO}");
        assert_eq!(
            job.substitute_macros("qsub ${JOB_NAME}.run ${SITE_FLAG}"),
            "qsub water.run ${SITE_FLAG}"
        );
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut job = test_job();
        job.set_status(JobStatus::Queued, None);
        job.set_status(JobStatus::Running, None);
        job.set_status(JobStatus::Finished, Some("Results in: /tmp/water"));
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.message(), "Results in: /tmp/water");

        job.set_status(JobStatus::Running, None);
        assert_eq!(job.status(), JobStatus::Finished);
        job.set_status(JobStatus::Error, Some("should not apply"));
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.message(), "Results in: /tmp/water");
    }

    #[test]
    fn test_finished_job_may_enter_copying() {
        let mut job = test_job();
        job.set_status(JobStatus::Queued, None);
        job.set_status(JobStatus::Finished, None);
        job.set_status(JobStatus::Copying, None);
        assert_eq!(job.status(), JobStatus::Copying);
        job.set_status(JobStatus::Finished, Some("Results in: /tmp/water"));
        assert_eq!(job.status(), JobStatus::Finished);

        let mut killed = test_job();
        killed.set_status(JobStatus::Killed, None);
        killed.set_status(JobStatus::Copying, None);
        assert_eq!(killed.status(), JobStatus::Killed);
    }

    #[test]
    fn test_queued_and_suspended_may_cycle() {
        let mut job = test_job();
        job.set_status(JobStatus::Queued, None);
        assert!(!job.submit_time().is_empty());
        job.set_status(JobStatus::Running, None);
        job.set_status(JobStatus::Suspended, None);
        job.set_status(JobStatus::Running, None);
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.is_active());
    }

    #[test]
    fn test_default_message_is_status_name() {
        let mut job = test_job();
        job.set_status(JobStatus::Queued, None);
        assert_eq!(job.message(), "Queued");
        job.set_status(JobStatus::Error, Some("submit failed"));
        assert_eq!(job.message(), "submit failed");
    }
}
