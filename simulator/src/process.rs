/*!

Supervision of the child processes that make up a simulated control plane.

A process goes through three stages:
- [`Launch`] describes what to run. Spawning it yields a [`Starting`] process.
- [`Starting::wait_ready`] polls a health endpoint until the process is ready, the session is
  cancelled, the process exits or the startup timeout elapses.
- [`Starting::supervise`] hands the process to a background task and returns a [`ProcessHandle`].
  The task stops the process when the session is cancelled.

Every exit path ends in the same teardown: kill, reap (bounded by the shutdown grace), then remove
the directories the process owned. If a `Starting` process is dropped without being torn down, the
child is killed by `kill_on_drop` and [`Cleanup`] removes the directories synchronously.

!*/

use crate::probe::HealthProbe;
use crate::settings::SimulatorSettings;
use log::{debug, info, trace, warn};
use snafu::{ResultExt, Snafu};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unable to create log file '{}': {}", path.display(), source))]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to start '{}': {}", program.display(), source))]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "{} exited before it was ready ({}), see '{}'",
        name,
        status,
        log.display()
    ))]
    Exited {
        name: String,
        status: String,
        log: PathBuf,
    },

    #[snafu(display("{} was not ready within {:?}: {}", name, timeout, last_error))]
    Timeout {
        name: String,
        timeout: Duration,
        last_error: String,
    },

    #[snafu(display("Startup of {} was cancelled", name))]
    Cancelled { name: String },
}

/// The timing knobs taken from [`SimulatorSettings`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timing {
    pub(crate) startup_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) shutdown_grace: Duration,
}

impl From<&SimulatorSettings> for Timing {
    fn from(settings: &SimulatorSettings) -> Self {
        Self {
            startup_timeout: settings.startup_timeout(),
            poll_interval: settings.poll_interval(),
            shutdown_grace: settings.shutdown_grace(),
        }
    }
}

/// Directories that belong to a process and are removed with it.
#[derive(Debug, Default)]
pub(crate) struct Cleanup {
    dirs: Vec<PathBuf>,
}

impl Cleanup {
    pub(crate) fn remove_dir(mut self, dir: &Path) -> Self {
        self.dirs.push(dir.to_path_buf());
        self
    }

    async fn run(mut self) {
        for dir in self.dirs.drain(..) {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!("Removed '{}'", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to remove '{}': {}", dir.display(), e),
            }
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for dir in self.dirs.drain(..) {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!("Removed '{}'", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to remove '{}': {}", dir.display(), e),
            }
        }
    }
}

/// A process to be started.
#[derive(Debug)]
pub(crate) struct Launch {
    pub(crate) name: &'static str,
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<OsString>,
    /// Receives both stdout and stderr.
    pub(crate) log_path: PathBuf,
}

impl Launch {
    /// Spawn the process. `hold` keeps the process this one depends on alive until this one has
    /// been torn down.
    pub(crate) fn spawn(
        self,
        cleanup: Cleanup,
        hold: Option<TaskTrackerToken>,
    ) -> Result<Starting, Error> {
        let stdout = File::create(&self.log_path).context(LogFileSnafu {
            path: &self.log_path,
        })?;
        let stderr = stdout.try_clone().context(LogFileSnafu {
            path: &self.log_path,
        })?;
        debug!(
            "Starting {}: {} {:?}",
            self.name,
            self.program.display(),
            self.args
        );
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .context(SpawnSnafu {
                program: &self.program,
            })?;
        info!(
            "Started {} (pid {}), logging to '{}'",
            self.name,
            child.id().unwrap_or_default(),
            self.log_path.display()
        );
        Ok(Starting {
            name: self.name,
            child,
            log_path: self.log_path,
            cleanup,
            hold,
        })
    }
}

/// A spawned process that has not been handed to a supervisor yet.
#[derive(Debug)]
pub(crate) struct Starting {
    name: &'static str,
    child: Child,
    log_path: PathBuf,
    cleanup: Cleanup,
    hold: Option<TaskTrackerToken>,
}

impl Starting {
    /// Poll `probe` until it succeeds. Returns early if `token` is cancelled or the process exits,
    /// and gives up after `timing.startup_timeout`.
    pub(crate) async fn wait_ready(
        &mut self,
        probe: &HealthProbe,
        token: &CancellationToken,
        timing: Timing,
    ) -> Result<(), Error> {
        let name = self.name;
        let deadline = Instant::now() + timing.startup_timeout;
        let poll = async {
            loop {
                let last_error = match timeout_at(deadline, probe.check()).await {
                    Ok(Ok(())) => return Ok::<(), Error>(()),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("no answer from '{}'", probe.url()),
                };
                trace!("{} is not ready: {}", name, last_error);
                if Instant::now() + timing.poll_interval >= deadline {
                    return TimeoutSnafu {
                        name,
                        timeout: timing.startup_timeout,
                        last_error,
                    }
                    .fail();
                }
                sleep(timing.poll_interval).await;
            }
        };
        tokio::select! {
            _ = token.cancelled() => CancelledSnafu { name }.fail(),
            status = self.child.wait() => ExitedSnafu {
                name,
                status: describe(status),
                log: &self.log_path,
            }
            .fail(),
            result = poll => result,
        }
    }

    /// Tear the process down right away. Used when startup fails.
    pub(crate) async fn abort(self, grace: Duration) {
        let Starting {
            name,
            child,
            cleanup,
            hold,
            ..
        } = self;
        teardown(name, child, cleanup, grace).await;
        drop(hold);
    }

    /// Wait for readiness, then supervise. On failure the process is torn down before the error is
    /// returned.
    pub(crate) async fn start(
        mut self,
        probe: &HealthProbe,
        token: &CancellationToken,
        timing: Timing,
    ) -> Result<ProcessHandle, Error> {
        match self.wait_ready(probe, token, timing).await {
            Ok(()) => Ok(self.supervise(token.clone(), timing.shutdown_grace)),
            Err(e) => {
                warn!("{} failed to start: {}", self.name, e);
                self.abort(timing.shutdown_grace).await;
                Err(e)
            }
        }
    }

    /// Move the process to a background task that tears it down once `token` is cancelled and every
    /// dependent registered on the returned handle is gone.
    pub(crate) fn supervise(self, token: CancellationToken, grace: Duration) -> ProcessHandle {
        let Starting {
            name,
            mut child,
            log_path,
            cleanup,
            hold,
        } = self;
        let handle = ProcessHandle {
            name,
            pid: child.id(),
            stopped: CancellationToken::new(),
            dependents: TaskTracker::new(),
        };
        let stopped = handle.stopped.clone();
        let dependents = handle.dependents.clone();
        info!("{} is ready", name);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Stopping {}", name),
                status = child.wait() => warn!(
                    "{} exited unexpectedly ({}), see '{}'",
                    name,
                    describe(status),
                    log_path.display()
                ),
            }
            dependents.close();
            dependents.wait().await;
            teardown(name, child, cleanup, grace).await;
            drop(hold);
            info!("{} stopped", name);
            stopped.cancel();
        });
        handle
    }
}

async fn teardown(name: &str, mut child: Child, cleanup: Cleanup, grace: Duration) {
    if let Err(e) = child.start_kill() {
        trace!("Unable to kill {}: {}", name, e);
    }
    match timeout(grace, child.wait()).await {
        Ok(status) => debug!("{} is gone ({})", name, describe(status)),
        Err(_) => warn!("{} did not exit within {:?}", name, grace),
    }
    cleanup.run().await;
}

fn describe(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown status: {}", e),
    }
}

/// A running, supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: &'static str,
    pid: Option<u32>,
    stopped: CancellationToken,
    dependents: TaskTracker,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns `true` once the process has been torn down.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Returns `true` once teardown has begun.
    pub fn is_stopping(&self) -> bool {
        self.dependents.is_closed()
    }

    /// Completes once the process has been killed and its directories removed.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Register a dependent. This process is not torn down while the token is alive. Returns `None`
    /// if teardown has already begun.
    pub(crate) fn hold(&self) -> Option<TaskTrackerToken> {
        if self.is_stopping() {
            None
        } else {
            Some(self.dependents.token())
        }
    }
}
