//! Fresh-spawn start method.
//!
//! Each worker is a separate `sf-worker` process that starts with nothing
//! loaded. The fit problem is sent as the first protocol line, after which
//! the process answers one request per line on stdout.

use std::ffi::OsString;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

use sf_stats::FitProblem;
use sf_types::PoolError;

use crate::launcher::{WorkerCrash, WorkerHandle, WorkerLauncher};
use crate::protocol::{EvalOutcome, LineChannel, Reply, Request, Setup};

const WORKER_BIN: &str = "sf-worker";

#[derive(Debug, Clone)]
pub struct SpawnLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SpawnLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments passed to every worker process.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Locate `sf-worker` next to the running executable.
    ///
    /// Test binaries live one level down in `deps/`, so the parent directory
    /// is searched as well.
    pub fn from_current_exe() -> Result<Self, PoolError> {
        let exe = std::env::current_exe()?;
        let file_name = format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX);

        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(d) = dir else { break };
            let candidate = d.join(&file_name);
            if candidate.is_file() {
                return Ok(Self::new(candidate));
            }
            dir = d.parent();
        }

        Err(PoolError::Launch {
            worker_id: 0,
            message: format!("{file_name} not found next to {}", exe.display()),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for SpawnLauncher {
    fn name(&self) -> &str {
        "spawn"
    }

    fn launch(
        &self,
        worker_id: usize,
        payload: &Arc<FitProblem>,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let launch_err = |message: String| PoolError::Launch { worker_id, message };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| launch_err(format!("{}: {e}", self.program.display())))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(launch_err("worker pipes unavailable".into()));
        };

        let mut worker = ProcessWorker {
            id: worker_id,
            child: Some(child),
            channel: LineChannel::new(stdin, BufReader::new(stdout)),
        };

        let setup = Setup {
            worker_id,
            problem: FitProblem::clone(payload),
        };
        let handshake = worker
            .channel
            .send(&setup)
            .and_then(|_| worker.channel.receive())
            .map_err(|m| launch_err(format!("setup failed: {m}")))?;

        match handshake {
            Reply::Ready { pid, .. } => {
                debug!(worker_id, pid, "spawned worker ready");
                Ok(Box::new(worker))
            }
            other => Err(launch_err(format!("expected ready, got {other:?}"))),
        }
    }
}

struct ProcessWorker {
    id: usize,
    child: Option<Child>,
    channel: LineChannel<ChildStdin, BufReader<ChildStdout>>,
}

impl ProcessWorker {
    /// Kill the process and describe how it went away.
    fn crash(&mut self, message: String) -> WorkerCrash {
        self.channel.close();
        let status = self.child.take().map(|mut child| {
            let _ = child.kill();
            child.wait()
        });
        let message = match status {
            Some(Ok(status)) => format!("{message} ({status})"),
            _ => message,
        };
        WorkerCrash {
            worker_id: self.id,
            message,
        }
    }
}

impl WorkerHandle for ProcessWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn evaluate(&mut self, index: usize, params: &[f64]) -> Result<EvalOutcome, WorkerCrash> {
        self.channel
            .evaluate(index, params)
            .map_err(|m| self.crash(m))
    }

    fn shutdown(mut self: Box<Self>) {
        if let Err(m) = self.channel.send(&Request::Shutdown) {
            debug!(worker_id = self.id, "shutdown request not delivered: {m}");
        }
        self.channel.close();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!(worker_id = self.id, "failed to reap worker: {e}");
            }
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.channel.close();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
