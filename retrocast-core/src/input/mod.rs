mod proxy;

use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{SecureInput, UpstreamSection};
use crate::error::StreamError;
use crate::timespec::{clamp_offset, format_offset};

pub use proxy::{spawn_proxy, UpstreamHeaders};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to start loopback proxy: {0}")]
    ProxyBind(#[source] std::io::Error),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to write encoder input: {0}")]
    Write(#[source] std::io::Error),
}

impl From<InputError> for StreamError {
    fn from(err: InputError) -> Self {
        StreamError::EncoderStartFailed(err.to_string())
    }
}

/// How the encoder reaches the upstream media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Encoder opens the URL itself, headers and seek passed as arguments.
    Direct,
    /// Encoder opens a loopback proxy that re-issues requests upstream.
    Proxied,
    /// Bytes are fetched here and pushed into the encoder's stdin.
    Pipe,
}

/// Secure upstreams go through the proxy when one can be started, otherwise
/// through the pipe. Everything else is opened directly.
pub fn choose_input_mode(url: &str, proxy_available: bool) -> InputMode {
    let is_secure = url
        .get(..8)
        .map(|scheme| scheme.eq_ignore_ascii_case("https://"))
        .unwrap_or(false);
    match (is_secure, proxy_available) {
        (false, _) => InputMode::Direct,
        (true, true) => InputMode::Proxied,
        (true, false) => InputMode::Pipe,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDescriptor {
    pub mode: InputMode,
    /// Tokens placed before the filter chain, ending with `-i <source>`.
    pub args_prefix: Vec<String>,
    pub uses_pipe: bool,
    /// False when the seek must follow the input as `-ss`.
    pub seek_applied_in_args: bool,
    pub start_offset: f64,
    pub source_url: String,
}

impl InputDescriptor {
    /// `-ss` tokens still owed after the input is opened.
    pub fn post_input_seek(&self) -> Vec<String> {
        if self.seek_applied_in_args {
            Vec::new()
        } else {
            seek_args(self.start_offset)
        }
    }
}

fn seek_args(offset: f64) -> Vec<String> {
    if clamp_offset(offset) > 0.0 {
        vec!["-ss".to_string(), format_offset(offset)]
    } else {
        Vec::new()
    }
}

/// Releases whatever an input holds (the loopback proxy) once. Dropping the
/// value releases too.
#[derive(Debug, Default)]
pub struct InputRelease {
    shutdown: Option<CancellationToken>,
}

impl InputRelease {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(token) = self.shutdown.take() {
            debug!("releasing loopback proxy");
            token.cancel();
        }
    }
}

impl Drop for InputRelease {
    fn drop(&mut self) {
        self.release_now();
    }
}

#[derive(Debug, Clone)]
pub struct InputAcquirer {
    client: reqwest::Client,
    headers: UpstreamHeaders,
    secure_input: SecureInput,
}

impl InputAcquirer {
    pub fn new(upstream: &UpstreamSection) -> Result<Self, InputError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            headers: UpstreamHeaders {
                user_agent: upstream.user_agent.clone(),
                referer: upstream.referer.clone(),
            },
            secure_input: upstream.secure_input,
        })
    }

    /// Produces the encoder input for one encode attempt.
    pub async fn build_input(
        &self,
        url: &str,
        start_offset: f64,
    ) -> Result<(InputDescriptor, InputRelease), InputError> {
        let start_offset = clamp_offset(start_offset);
        let proxy_available = self.secure_input == SecureInput::Proxy;
        let mode = choose_input_mode(url, proxy_available);
        let mut release = InputRelease::noop();

        let (args_prefix, seek_applied_in_args) = match mode {
            InputMode::Direct => {
                let mut args = vec![
                    "-user_agent".to_string(),
                    self.headers.user_agent.clone(),
                    "-headers".to_string(),
                    format!("Referer: {}\r\n", self.headers.referer),
                ];
                args.extend(seek_args(start_offset));
                args.extend(["-i".to_string(), url.to_string()]);
                (args, true)
            }
            InputMode::Proxied => {
                let shutdown = CancellationToken::new();
                let addr = spawn_proxy(
                    self.client.clone(),
                    url.to_string(),
                    self.headers.clone(),
                    shutdown.clone(),
                )
                .await?;
                release.shutdown = Some(shutdown);
                let mut args = seek_args(start_offset);
                args.extend(["-i".to_string(), format!("http://{addr}/")]);
                (args, true)
            }
            InputMode::Pipe => (vec!["-i".to_string(), "pipe:0".to_string()], false),
        };

        debug!(?mode, offset = start_offset, "built encoder input");
        Ok((
            InputDescriptor {
                mode,
                args_prefix,
                uses_pipe: mode == InputMode::Pipe,
                seek_applied_in_args,
                start_offset,
                source_url: url.to_string(),
            },
            release,
        ))
    }

    /// Copies the upstream body into the encoder's stdin until the body ends,
    /// the write side breaks, or `cancel` fires.
    pub fn start_pump<W>(&self, mut stdin: W, url: String, cancel: CancellationToken) -> JoinHandle<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let request = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.headers.user_agent)
            .header(reqwest::header::REFERER, &self.headers.referer);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Ok(0),
                result = pump(request, &mut stdin) => result,
            };
            match result {
                Ok(copied) => debug!(bytes = copied, "input pump finished"),
                Err(err) => warn!(error = %err, url = %url, "input pump stopped"),
            }
            let _ = stdin.shutdown().await;
        })
    }
}

async fn pump<W>(request: reqwest::RequestBuilder, stdin: &mut W) -> Result<u64, InputError>
where
    W: AsyncWrite + Unpin,
{
    let response = request.send().await?.error_for_status()?;
    let mut body = Box::pin(response.bytes_stream());
    let mut copied = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        stdin.write_all(&chunk).await.map_err(InputError::Write)?;
        copied += chunk.len() as u64;
    }
    stdin.flush().await.map_err(InputError::Write)?;
    Ok(copied)
}
