//! Copy-on-fork start method.
//!
//! A worker is a child process created with `fork(2)`. It keeps the parent's
//! already-loaded `FitProblem` in its copied address space, so only candidate
//! vectors and outcomes cross its pipes. A worker that panics, aborts or is
//! killed closes its reply pipe, which the pool observes as a crash.
//!
//! Only the forking thread exists in the child. A lock another thread held at
//! fork time stays held there, so the child path does not log and touches
//! nothing beyond the problem and its two pipes. Where that is not good
//! enough, use the spawn method.

use std::sync::Arc;

use sf_stats::FitProblem;
use sf_types::PoolError;

use crate::launcher::{WorkerHandle, WorkerLauncher};

#[derive(Debug, Clone, Default)]
pub struct ForkLauncher;

impl ForkLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerLauncher for ForkLauncher {
    fn name(&self) -> &str {
        "fork"
    }

    fn launch(
        &self,
        worker_id: usize,
        payload: &Arc<FitProblem>,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        imp::fork_worker(worker_id, payload)
    }
}

#[cfg(unix)]
mod imp {
    use parking_lot::Mutex;
    use std::fs::File;
    use std::io::{self, BufReader, BufWriter};
    use std::os::unix::io::FromRawFd;
    use std::os::unix::process::ExitStatusExt;
    use std::panic::{self, AssertUnwindSafe};
    use std::process::ExitStatus;
    use tracing::{debug, warn};

    use sf_stats::FitProblem;
    use sf_types::PoolError;

    use crate::launcher::{WorkerCrash, WorkerHandle};
    use crate::protocol::{EvalOutcome, LineChannel, Reply, Request};
    use crate::worker::serve_loaded;

    /// Exit code of a child whose evaluation panicked.
    const PANIC_EXIT: i32 = 101;

    /// Held from pipe creation until the parent has closed the child's ends,
    /// so no other forked worker inherits them and masks this one's exit.
    static FORK_LOCK: Mutex<()> = parking_lot::const_mutex(());

    /// A close-on-exec pipe as `(read, write)`.
    fn pipe() -> io::Result<(File, File)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) fills in.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and have no other owner.
        let ends = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
        for fd in fds {
            // SAFETY: `fd` is open and owned by `ends`.
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(ends)
    }

    pub(super) fn fork_worker(
        worker_id: usize,
        problem: &FitProblem,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let launch_err = |message: String| PoolError::Launch { worker_id, message };

        let (pid, request_tx, reply_rx) = {
            let _guard = FORK_LOCK.lock();
            let (request_rx, request_tx) = pipe().map_err(|e| launch_err(format!("pipe: {e}")))?;
            let (reply_rx, reply_tx) = pipe().map_err(|e| launch_err(format!("pipe: {e}")))?;

            // SAFETY: the child never returns from `run_child`; it serves
            // requests against its copy of `problem` and leaves through `_exit`.
            match unsafe { libc::fork() } {
                -1 => return Err(launch_err(format!("fork: {}", io::Error::last_os_error()))),
                0 => {
                    drop(request_tx);
                    drop(reply_rx);
                    run_child(worker_id, problem, request_rx, reply_tx)
                }
                pid => {
                    drop(request_rx);
                    drop(reply_tx);
                    (pid, request_tx, reply_rx)
                }
            }
        };

        let mut worker = ForkedWorker {
            id: worker_id,
            pid: Some(pid),
            channel: LineChannel::new(request_tx, BufReader::new(reply_rx)),
        };
        match worker.channel.receive() {
            Ok(Reply::Ready { pid, .. }) => {
                debug!(worker_id, pid, "forked worker ready");
                Ok(Box::new(worker))
            }
            Ok(other) => Err(launch_err(format!("expected ready, got {other:?}"))),
            Err(m) => Err(launch_err(format!("worker did not start: {m}"))),
        }
    }

    fn run_child(worker_id: usize, problem: &FitProblem, input: File, output: File) -> ! {
        let served = panic::catch_unwind(AssertUnwindSafe(|| {
            serve_loaded(worker_id, problem, BufReader::new(input), BufWriter::new(output))
        }));
        let code = match served {
            Ok(Ok(_)) => 0,
            Ok(Err(_)) => 1,
            Err(_) => PANIC_EXIT,
        };
        // SAFETY: `_exit` skips atexit handlers and destructors, which belong
        // to the parent.
        unsafe { libc::_exit(code) }
    }

    struct ForkedWorker {
        id: usize,
        pid: Option<libc::pid_t>,
        channel: LineChannel<File, BufReader<File>>,
    }

    impl ForkedWorker {
        /// Wait for the child, killing it first when `kill` is set.
        fn reap(&mut self, kill: bool) -> Option<ExitStatus> {
            let pid = self.pid.take()?;
            if kill {
                // SAFETY: `pid` is an unreaped child of ours, so it cannot have
                // been recycled.
                unsafe { libc::kill(pid, libc::SIGKILL) };
            }
            let mut status: libc::c_int = 0;
            loop {
                // SAFETY: `status` is a valid out-pointer.
                let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
                if rc == pid {
                    return Some(ExitStatus::from_raw(status));
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!(worker_id = self.id, pid, "failed to reap forked worker: {err}");
                    return None;
                }
            }
        }

        fn crash(&mut self, message: String) -> WorkerCrash {
            self.channel.close();
            let message = match self.reap(true) {
                Some(status) => format!("{message} ({status})"),
                None => message,
            };
            WorkerCrash {
                worker_id: self.id,
                message,
            }
        }
    }

    impl WorkerHandle for ForkedWorker {
        fn id(&self) -> usize {
            self.id
        }

        fn pid(&self) -> Option<u32> {
            self.pid.and_then(|p| u32::try_from(p).ok())
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
            self.reap(false);
        }
    }

    impl Drop for ForkedWorker {
        fn drop(&mut self) {
            self.channel.close();
            self.reap(true);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use sf_stats::FitProblem;
    use sf_types::PoolError;

    use crate::launcher::WorkerHandle;

    pub(super) fn fork_worker(
        worker_id: usize,
        _problem: &FitProblem,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        Err(PoolError::Launch {
            worker_id,
            message: "copy-on-fork needs a unix platform".into(),
        })
    }
}
