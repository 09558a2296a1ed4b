use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EncoderSection;
use crate::error::StreamError;
use crate::input::InputDescriptor;
use crate::profile::ProfileSpec;
use crate::rtsp::RtspTransport;

/// Where the encoder writes its output.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeTarget {
    Stdout,
    Rtsp {
        url: String,
        transport: RtspTransport,
    },
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub binary: String,
    pub log_level: String,
    pub extra_filter: Option<String>,
}

impl From<&EncoderSection> for EncoderSettings {
    fn from(section: &EncoderSection) -> Self {
        Self {
            binary: section.binary.clone(),
            log_level: section.log_level.clone(),
            extra_filter: section.effective_filter(),
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from(&EncoderSection::default())
    }
}

/// Full argument list for one encode: input, seek, filter chain, codecs and
/// output target, in that order.
pub fn compose_args(
    settings: &EncoderSettings,
    spec: &ProfileSpec,
    input: &InputDescriptor,
    target: &EncodeTarget,
) -> Result<Vec<String>, StreamError> {
    if matches!(target, EncodeTarget::Rtsp { .. }) && !spec.rtsp_capable {
        return Err(StreamError::RtspUnsupported(spec.profile.as_str()));
    }

    let mut args: Vec<String> = ["-hide_banner", "-loglevel", settings.log_level.as_str(), "-re"]
        .iter()
        .map(|token| token.to_string())
        .collect();
    args.extend(input.args_prefix.iter().cloned());
    args.extend(input.post_input_seek());
    args.push("-vf".to_string());
    args.push(spec.filter_chain(settings.extra_filter.as_deref()));
    args.extend(spec.codec_args());

    match target {
        EncodeTarget::Stdout => args.extend(spec.pipe_output_args()),
        EncodeTarget::Rtsp { url, transport } => {
            args.extend(
                ["-f", "rtsp", "-rtsp_transport", transport.publish_flag(), "-muxdelay", "0.1"]
                    .map(String::from),
            );
            args.push(url.clone());
        }
    }
    Ok(args)
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub args: Vec<String>,
    pub pipe_stdin: bool,
    pub pipe_stdout: bool,
    /// Identifies the encode in logs.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderExit {
    Finished,
    Failed(String),
    Killed,
}

/// Handle used to stop a running encoder.
#[derive(Debug, Clone)]
pub struct EncoderHandle {
    pid: Option<u32>,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl EncoderHandle {
    pub fn new(pid: Option<u32>, cancel: CancellationToken) -> Self {
        Self {
            pid,
            cancel,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Cancels the attempt and signals the whole process group right away
    /// instead of waiting for the exit watcher to be scheduled.
    pub fn kill(&self) {
        self.cancel.cancel();
        if !self.has_exited() {
            if let Some(pid) = self.pid {
                kill_process_group(pid);
            }
        }
    }
}

pub type EncoderStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type EncoderStdout = Box<dyn AsyncRead + Send + Unpin>;

pub struct EncoderProcess {
    pub handle: EncoderHandle,
    pub stdin: Option<EncoderStdin>,
    pub stdout: Option<EncoderStdout>,
    /// Resolves once the process is gone.
    pub exit: oneshot::Receiver<EncoderExit>,
}

impl fmt::Debug for EncoderProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderProcess")
            .field("handle", &self.handle)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .finish()
    }
}

/// Starts encoder processes. Cancelling `cancel` must terminate the process.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<EncoderProcess, StreamError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    binary: String,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<EncoderProcess, StreamError> {
        let mut command = Command::new(&self.binary);
        command
            .args(&request.args)
            .stdin(if request.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if request.pipe_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|err| {
            StreamError::EncoderStartFailed(format!("{}: {err}", self.binary))
        })?;
        let pid = child.id();
        info!(encode = %request.label, pid = ?pid, "encoder started");

        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as EncoderStdin);
        let stdout = child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as EncoderStdout);
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, request.label.clone()));
        }

        let handle = EncoderHandle::new(pid, cancel.clone());
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, handle.clone(), cancel, request.label, exit_tx));

        Ok(EncoderProcess {
            handle,
            stdin,
            stdout,
            exit: exit_rx,
        })
    }
}

async fn watch_exit(
    mut child: Child,
    handle: EncoderHandle,
    cancel: CancellationToken,
    label: String,
    exit_tx: oneshot::Sender<EncoderExit>,
) {
    // Cancellation is checked first so a kill issued through the handle is
    // reported as such and not as a signal exit.
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            if let Some(pid) = child.id() {
                kill_process_group(pid);
            }
            if let Err(err) = child.kill().await {
                debug!(encode = %label, error = %err, "encoder already gone");
            }
            EncoderExit::Killed
        }
        status = child.wait() => match status {
            Ok(status) if status.success() => EncoderExit::Finished,
            Ok(status) => EncoderExit::Failed(format!("encoder exited with {status}")),
            Err(err) => EncoderExit::Failed(format!("wait for encoder: {err}")),
        },
    };
    handle.mark_exited();
    match &outcome {
        EncoderExit::Failed(reason) => warn!(encode = %label, %reason, "encoder failed"),
        other => info!(encode = %label, outcome = ?other, "encoder exited"),
    }
    let _ = exit_tx.send(outcome);
}

/// Frame counter lines are emitted several times a second.
fn is_progress_line(line: &str) -> bool {
    line.contains("frame=")
}

/// Logs stderr until EOF. Bytes that are not UTF-8 (stream titles, file
/// names) are decoded lossily; the pipe must stay open or the encoder dies
/// of SIGPIPE. Returns the number of lines logged.
async fn drain_stderr(stderr: impl AsyncRead + Unpin, label: String) -> usize {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut logged = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.trim().is_empty() || is_progress_line(line) {
                    continue;
                }
                debug!(target: "encoder", encode = %label, "{line}");
                logged += 1;
            }
            Err(err) => {
                debug!(target: "encoder", encode = %label, error = %err, "stderr closed");
                break;
            }
        }
    }
    logged
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: killpg has no memory-safety preconditions; a stale group id
    // only yields ESRCH.
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result != 0 {
        debug!(pid, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
