//! Running the build command and launching the backend binary

use crate::error::{BuildError, StartError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Size of the read buffer used for each output stream of the build
const OUTPUT_CHUNK_SIZE: usize = 8192;

/// Capability to build and launch the backend.
///
/// Calls are serialized by the coordinator lock.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the build to completion, capturing combined output.
    async fn build(&self) -> Result<(), BuildError>;

    /// Launch a fresh backend process, replacing any previous one.
    async fn launch(&self) -> Result<(), StartError>;

    /// Terminate the launched backend, if any.
    async fn stop(&self);
}

/// Runs real executables as child processes.
pub struct CommandRunner {
    build_command: PathBuf,
    binary: PathBuf,
    grace_period: Duration,
    child: Mutex<Option<Child>>,
}

impl CommandRunner {
    pub fn new(
        build_command: impl Into<PathBuf>,
        binary: impl Into<PathBuf>,
        grace_period: Duration,
    ) -> Self {
        Self {
            build_command: build_command.into(),
            binary: binary.into(),
            grace_period,
            child: Mutex::new(None),
        }
    }

    /// PID of the backend launched last, while it is still tracked
    #[cfg(test)]
    fn backend_pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl ProcessRunner for CommandRunner {
    async fn build(&self) -> Result<(), BuildError> {
        let command = self.build_command.display().to_string();
        info!(command = %command, "Running build");
        let start = Instant::now();

        let mut child = Command::new(&self.build_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildError::new(format!("failed to run {}: {}", command, e), Vec::new()))?;

        let output = read_combined(child.stdout.take(), child.stderr.take()).await;

        let status = child
            .wait()
            .await
            .map_err(|e| BuildError::new(format!("failed to wait for {}: {}", command, e), output.clone()))?;

        if !status.success() {
            warn!(command = %command, %status, output_bytes = output.len(), "Build command failed");
            return Err(BuildError::new(status.to_string(), output));
        }

        info!(
            command = %command,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Build finished"
        );
        Ok(())
    }

    async fn launch(&self) -> Result<(), StartError> {
        self.stop().await;

        let binary = self.binary.display().to_string();
        info!(binary = %binary, "Starting backend");

        let child = Command::new(&self.binary)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StartError::Launch {
                binary: binary.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        info!(binary = %binary, pid, "Backend process spawned");

        *self.child.lock() = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(?status, "Previous backend already exited");
            return;
        }

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Backend process exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

enum Stream {
    Stdout,
    Stderr,
}

/// Read both pipes to EOF, appending chunks in the order they arrive.
async fn read_combined<O, E>(stdout: Option<O>, stderr: Option<E>) -> Vec<u8>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut stdout = stdout;
    let mut stderr = stderr;
    let mut out_buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    let mut err_buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    let mut output = Vec::new();

    while stdout.is_some() || stderr.is_some() {
        let (stream, read) = tokio::select! {
            n = read_chunk(&mut stdout, &mut out_buf) => (Stream::Stdout, n),
            n = read_chunk(&mut stderr, &mut err_buf) => (Stream::Stderr, n),
        };

        match (stream, read) {
            (Stream::Stdout, Some(n)) => output.extend_from_slice(&out_buf[..n]),
            (Stream::Stderr, Some(n)) => output.extend_from_slice(&err_buf[..n]),
            (Stream::Stdout, None) => stdout = None,
            (Stream::Stderr, None) => stderr = None,
        }
    }

    output
}

/// `None` on EOF or error; never resolves for a closed stream.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    match reader {
        Some(r) => match r.read(buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        },
        None => std::future::pending().await,
    }
}
