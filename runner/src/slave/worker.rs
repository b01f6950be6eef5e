//! Launching solver workers and watching them exit
//!
//! A worker is invoked as `exec params.. stub options..`. Exit code 0 together with a
//! fresh solution file next to the stub (the stub's extension replaced by `sol`) is a
//! success, anything else a failure.

use crate::{
    config::SolverConfig,
    protocol::{JobId, JobOutcome},
};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, trace};

/// bytes of solver stderr kept for failure reasons
pub const STDERR_TAIL: usize = 4096;

/// how long the stderr reader may lag behind the solver's exit
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Location of the solution artifact a solver writes for `stub`
pub fn solution_path(stub: &Path) -> PathBuf {
    stub.with_extension("sol")
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .ok()
        .filter(|metadata| metadata.is_file())
        .and_then(|metadata| metadata.modified().ok())
}

/// How solver workers are started on this host
#[derive(Debug, Clone)]
pub struct SolverCommand {
    exec: PathBuf,
    params: Vec<String>,
}

impl From<&SolverConfig> for SolverCommand {
    fn from(config: &SolverConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            params: config.params.clone(),
        }
    }
}

impl SolverCommand {
    pub fn new(exec: impl Into<PathBuf>, params: Vec<String>) -> Self {
        Self {
            exec: exec.into(),
            params,
        }
    }

    /// Spawn a worker for `stub`
    pub fn launch(&self, stub: &Path, options: &[String]) -> std::io::Result<Worker> {
        debug!(exec = ?self.exec, stub = ?stub, options = ?options, "Launching solver");
        // a solution left behind by an earlier attempt must not count for this one
        let stale = modified(&solution_path(stub));

        let child = Command::new(&self.exec)
            .args(self.params.iter())
            .arg(stub)
            .args(options.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok(Worker {
            child,
            stub: stub.to_path_buf(),
            stale,
        })
    }
}

/// A running solver process
#[derive(Debug)]
pub struct Worker {
    child: Child,
    stub: PathBuf,
    stale: Option<SystemTime>,
}

impl Worker {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Watch handle over one running worker: a task that waits for the process to exit and
/// hands the classified outcome to `on_exit`
///
/// Only the solver process itself is waited for. Its stderr is read on the side, so a
/// helper process that inherited the pipe cannot hold the job open.
pub fn watch<F>(job_id: JobId, worker: Worker, on_exit: F) -> JoinHandle<()>
where
    F: FnOnce(JobId, JobOutcome) + Send + 'static,
{
    let Worker {
        mut child,
        stub,
        stale,
    } = worker;

    tokio::spawn(async move {
        let tail = Arc::new(Mutex::new(Vec::new()));
        let reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, tail.clone())));

        let status = child.wait().await;

        if let Some(mut reader) = reader {
            if tokio::time::timeout(STDERR_GRACE, &mut reader).await.is_err() {
                debug!(job = %job_id, "Solver stderr still open after exit, not waiting for it");
                reader.abort();
            }
        }
        let stderr = String::from_utf8_lossy(&tail.lock()).into_owned();
        trace!(job = %job_id, stderr = %stderr, "Solver stderr");

        let outcome = match status {
            Ok(status) => classify(status, &stub, &stderr, stale),
            Err(error) => JobOutcome::Failure {
                reason: format!("failed to wait for solver: {error}"),
            },
        };

        debug!(job = %job_id, outcome = ?outcome, "Solver exited");
        on_exit(job_id, outcome);
    })
}

/// Keep the last [`STDERR_TAIL`] bytes of `stream` in `tail`
async fn read_tail<R: AsyncRead + Unpin>(mut stream: R, tail: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 1024];

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let mut tail = tail.lock();
                tail.extend_from_slice(&chunk[..read]);

                if tail.len() > STDERR_TAIL {
                    let excess = tail.len() - STDERR_TAIL;
                    tail.drain(..excess);
                }
            }
        }
    }
}

/// Turn a worker's exit into a job outcome. `stale` is the modification time of a
/// solution file that already existed when the worker was launched.
pub fn classify(
    status: ExitStatus,
    stub: &Path,
    stderr: &str,
    stale: Option<SystemTime>,
) -> JobOutcome {
    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| format!(": {}", line.trim()))
        .unwrap_or_default();

    if status.success() {
        let result = solution_path(stub);

        match modified(&result) {
            Some(written) if stale.map_or(true, |stale| written > stale) => {
                JobOutcome::Success { result }
            }
            Some(_) => JobOutcome::Failure {
                reason: format!(
                    "solver exited cleanly but left the old solution in {} untouched",
                    result.display()
                ),
            },
            None => JobOutcome::Failure {
                reason: format!(
                    "solver exited cleanly but wrote no solution to {}",
                    result.display()
                ),
            },
        }
    } else if let Some(code) = status.code() {
        JobOutcome::Failure {
            reason: format!("solver exited with status {code}{detail}"),
        }
    } else if let Some(signal) = status.signal() {
        let name = Signal::try_from(signal)
            .map(|signal| signal.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {signal}"));

        JobOutcome::Failure {
            reason: format!("solver killed by {name}{detail}"),
        }
    } else {
        JobOutcome::Failure {
            reason: format!("solver terminated abnormally ({status}){detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn sh(script: &str) -> SolverCommand {
        SolverCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    async fn run(command: &SolverCommand, stub: &Path, options: &[String]) -> JobOutcome {
        let worker = command.launch(stub, options).unwrap();
        let (tx, rx) = oneshot::channel();
        watch(JobId::nil(), worker, move |_, outcome| {
            let _ = tx.send(outcome);
        });

        rx.await.unwrap()
    }

    #[test]
    fn solution_sits_next_to_the_stub() {
        assert_eq!(
            solution_path(Path::new("/work/sub/a.nl")),
            PathBuf::from("/work/sub/a.sol")
        );
    }

    #[tokio::test]
    async fn success_requires_a_solution_file() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");

        // `sh -c script stub options..` binds the stub to $0 and options to $1..
        let writes = sh("test \"$1\" = \"-p\" && touch \"${0%.nl}.sol\"");
        assert_eq!(
            run(&writes, &stub, &["-p".to_string()]).await,
            JobOutcome::Success {
                result: dir.path().join("a.sol")
            }
        );

        let silent = sh("exit 0");
        let stub = dir.path().join("b.nl");
        assert!(matches!(
            run(&silent, &stub, &[]).await,
            JobOutcome::Failure { reason } if reason.contains("no solution")
        ));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_status_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");

        let outcome = run(&sh("echo 'infeasible model' >&2; exit 3"), &stub, &[]).await;

        assert_eq!(
            outcome,
            JobOutcome::Failure {
                reason: "solver exited with status 3: infeasible model".to_string()
            }
        );
    }

    #[tokio::test]
    async fn killed_worker_names_the_signal() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");

        let outcome = run(&sh("kill -KILL $$"), &stub, &[]).await;

        assert_eq!(
            outcome,
            JobOutcome::Failure {
                reason: "solver killed by SIGKILL".to_string()
            }
        );
    }

    #[tokio::test]
    async fn leftover_solution_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");
        std::fs::write(dir.path().join("a.sol"), b"from an earlier attempt").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            run(&sh("exit 0"), &stub, &[]).await,
            JobOutcome::Failure { reason } if reason.contains("untouched")
        ));
        assert_eq!(
            run(&sh("touch \"${0%.nl}.sol\""), &stub, &[]).await,
            JobOutcome::Success {
                result: dir.path().join("a.sol")
            }
        );
    }

    #[tokio::test]
    async fn background_helper_does_not_delay_the_exit() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");
        let started = Instant::now();

        // the helper inherits stderr and keeps it open well past the solver's exit
        let outcome = run(&sh("touch \"${0%.nl}.sol\"; sleep 4 & exit 0"), &stub, &[]).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            outcome,
            JobOutcome::Success {
                result: dir.path().join("a.sol")
            }
        );
    }

    #[tokio::test]
    async fn stderr_keeps_only_its_tail() {
        let tail = Arc::new(Mutex::new(Vec::new()));
        let mut input = vec![b'x'; 3 * STDERR_TAIL];
        input.extend_from_slice(b"\nlast words\n");

        read_tail(input.as_slice(), tail.clone()).await;

        let tail = tail.lock();
        assert_eq!(tail.len(), STDERR_TAIL);
        assert!(tail.ends_with(b"x\nlast words\n"));
    }

    #[tokio::test]
    async fn long_stderr_still_names_the_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");
        let script =
            "{ head -c 100000 /dev/zero | tr '\\0' x; echo; echo 'last words'; } >&2; exit 5";

        assert_eq!(
            run(&sh(script), &stub, &[]).await,
            JobOutcome::Failure {
                reason: "solver exited with status 5: last words".to_string()
            }
        );
    }

    #[test]
    fn missing_executable_fails_to_launch() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let command = SolverCommand::new("/definitely/not/a/solver", Vec::new());
        assert!(command.launch(Path::new("a.nl"), &[]).is_err());
    }
}
