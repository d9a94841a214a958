// 推流子进程管理
//
// The capture loop runs in a child process (the `produce` subcommand of this
// binary). Frames arrive on the child's stdout as JSON Lines and a reader task
// moves them into the frame queue. A full queue stalls the reader, the pipe
// fills up and the child blocks on write.

use super::queue::FrameQueue;
use async_trait::async_trait;
use common::{FramePayload, RelayError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a producer ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerExit {
    pub code: Option<i32>,
}

#[async_trait]
pub trait ProducerLauncher: Send + Sync + 'static {
    async fn launch(&self, model: &str, queue: FrameQueue) -> Result<Box<dyn ProducerHandle>>;
}

#[async_trait]
pub trait ProducerHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves when the producer exits. Safe to cancel and call again.
    async fn wait(&mut self) -> Result<ProducerExit>;

    /// Forceful stop. Idempotent; waits at most `timeout` for the exit.
    async fn terminate(&mut self, timeout: Duration);
}

/// Launches producers as child processes.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// `program args... <model>`
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-executes the running binary with the hidden `produce` subcommand.
    pub fn current_exe(home: &Path, camera_fps: u32) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            RelayError::ProducerSpawnFailure(format!("Cannot find own executable: {}", e))
        })?;
        Ok(Self::new(
            exe,
            [
                OsString::from("--edgecam-home"),
                home.as_os_str().to_owned(),
                OsString::from("--camera-fps"),
                OsString::from(camera_fps.to_string()),
                OsString::from("produce"),
                OsString::from("--model"),
            ],
        ))
    }
}

#[async_trait]
impl ProducerLauncher for ProcessLauncher {
    async fn launch(&self, model: &str, queue: FrameQueue) -> Result<Box<dyn ProducerHandle>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::ProducerSpawnFailure(format!("{}: {}", self.program.display(), e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RelayError::ProducerSpawnFailure("producer stdout not captured".to_string())
        })?;
        let pid = child.id();
        info!("✓ Producer spawned for '{}' (pid {:?})", model, pid);

        let reader = tokio::spawn(forward_lines(stdout, queue));
        Ok(Box::new(ProcessProducer { child, reader, pid }))
    }
}

pub struct ProcessProducer {
    child: Child,
    reader: JoinHandle<u64>,
    pid: Option<u32>,
}

#[async_trait]
impl ProducerHandle for ProcessProducer {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ProducerExit> {
        let status = self.child.wait().await?;
        Ok(ProducerExit { code: status.code() })
    }

    async fn terminate(&mut self, timeout: Duration) {
        // SIGKILL on unix; fails harmlessly once the child has been reaped
        if let Err(e) = self.child.start_kill() {
            debug!("Producer {:?} already gone: {}", self.pid, e);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Producer {:?} exited: {}", self.pid, status),
            Ok(Err(e)) => warn!("⚠️  Failed to reap producer {:?}: {}", self.pid, e),
            Err(_) => warn!("⚠️  Producer {:?} did not exit within {:?}", self.pid, timeout),
        }
        self.reader.abort();
    }
}

/// Parses frames from the producer's stdout until EOF. Returns the number of
/// frames queued.
async fn forward_lines(stdout: ChildStdout, queue: FrameQueue) -> u64 {
    let mut lines = BufReader::new(stdout).lines();
    let mut queued = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("⚠️  Producer pipe read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FramePayload>(&line) {
            Ok(frame) => {
                if queue.put(frame).await.is_err() {
                    break;
                }
                queued += 1;
            }
            Err(e) => warn!("Skipping malformed frame line: {}", e),
        }
    }
    debug!("Producer output closed after {} frames", queued);
    queued
}
