use molq_core::config::{ConnectionKind, QueueSystem, ServerConfig};
use molq_core::job::{Job, JobStatus};
use molq_server::server::job_handle;
use molq_server::{Server, ServerError};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

fn local_config(working_directory: &Path, run_body: &str) -> ServerConfig {
    let mut config = ServerConfig::new("local-test", ConnectionKind::Local, QueueSystem::Basic);
    config.working_directory = working_directory.to_string_lossy().to_string();
    config.update_interval = 1;
    config.run_file_template = format!("#!/bin/sh\ncd ${{JOB_DIR}}\n{}", run_body);
    config
}

fn drive_to_terminal(server: &mut Server, job: &molq_server::JobHandle) -> Vec<JobStatus> {
    let mut observed = vec![job.lock().unwrap().status()];
    let deadline = Instant::now() + Duration::from_secs(30);

    loop {
        server.tick().unwrap();
        let status = job.lock().unwrap().status();
        if *observed.last().unwrap() != status {
            observed.push(status);
        }
        if status.is_terminal() {
            return observed;
        }
        assert!(
            Instant::now() < deadline,
            "job did not reach a terminal state; observed {:?}",
            observed
        );
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn test_basic_local_job_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(local_config(
        dir.path(),
        "sleep 2\necho done > ${JOB_NAME}.out",
    ));
    let job = job_handle(Job::new("he", "local-test", "$molecule\n0 1\nHe\n$end"));

    assert_eq!(job.lock().unwrap().status(), JobStatus::Unknown);
    server.submit(&job).unwrap();

    let observed = drive_to_terminal(&mut server, &job);

    assert_eq!(job.lock().unwrap().status(), JobStatus::Finished);
    assert!(
        !observed.contains(&JobStatus::Error),
        "job must never pass through Error: {:?}",
        observed
    );
    assert_eq!(observed.first(), Some(&JobStatus::Unknown));
    assert!(observed.contains(&JobStatus::Queued), "{:?}", observed);
    assert!(observed.contains(&JobStatus::Running), "{:?}", observed);

    // The staged files and the run's output land in the working directory.
    let job_dir = dir.path().join("he");
    assert!(job_dir.join("he.inp").exists());
    assert!(job_dir.join("he.run").exists());
    assert!(job_dir.join("he.out").exists());
    assert_eq!(
        fs_err::read_to_string(job_dir.join("he.inp")).unwrap(),
        "$molecule\n0 1\nHe\n$end"
    );

    // Terminal jobs leave the watch set.
    assert!(server.watched_jobs().is_empty());

    // copy_results is a no-op success on a local server.
    server.copy_results(&job).unwrap();
    server.process_events().unwrap();
    assert_eq!(job.lock().unwrap().status(), JobStatus::Finished);
}

#[test]
fn test_busy_job_rejects_further_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(local_config(dir.path(), "sleep 1"));
    let job = job_handle(Job::new("busy", "local-test", "input"));

    server.submit(&job).unwrap();

    // The input copy is still in flight: everything else must fail fast.
    assert!(matches!(server.kill(&job), Err(ServerError::BusyJob(_))));
    assert!(matches!(server.submit(&job), Err(ServerError::BusyJob(_))));

    let observed = drive_to_terminal(&mut server, &job);
    assert!(!observed.contains(&JobStatus::Error), "{:?}", observed);
}

#[test]
fn test_resubmitting_watched_job_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(local_config(dir.path(), "sleep 5"));
    let job = job_handle(Job::new("dup", "local-test", "input"));

    server.submit(&job).unwrap();

    // Wait until the submission chain queues the job.
    let deadline = Instant::now() + Duration::from_secs(15);
    while !server.watched_jobs().iter().any(|w| std::sync::Arc::ptr_eq(w, &job)) {
        assert!(Instant::now() < deadline, "job never became watched");
        server.tick().unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    assert!(matches!(
        server.submit(&job),
        Err(ServerError::DuplicateJob(_))
    ));

    kill_when_idle(&mut server, &job);
    let observed = drive_to_terminal(&mut server, &job);
    assert_eq!(*observed.last().unwrap(), JobStatus::Killed);
}

#[test]
fn test_kill_marks_job_killed_and_unwatched() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(local_config(dir.path(), "sleep 30"));
    let job = job_handle(Job::new("doomed", "local-test", "input"));

    server.submit(&job).unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    while job.lock().unwrap().status() != JobStatus::Running {
        assert!(
            Instant::now() < deadline,
            "job never started running: {:?}",
            job.lock().unwrap().status()
        );
        server.tick().unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    kill_when_idle(&mut server, &job);
    let observed = drive_to_terminal(&mut server, &job);

    assert_eq!(job.lock().unwrap().status(), JobStatus::Killed);
    assert!(!observed.contains(&JobStatus::Error), "{:?}", observed);
    assert!(server.watched_jobs().is_empty());

    // Killed is absorbing: a late poll result cannot resurrect the job.
    server.tick().unwrap();
    assert_eq!(job.lock().unwrap().status(), JobStatus::Killed);
}

// A poll query may be in flight when the kill is requested; retry until the
// job is idle.
fn kill_when_idle(server: &mut Server, job: &molq_server::JobHandle) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match server.kill(job) {
            Ok(()) => return,
            Err(ServerError::BusyJob(_)) => {
                assert!(Instant::now() < deadline, "job stayed busy");
                server.tick().unwrap();
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("kill failed: {}", e),
        }
    }
}
