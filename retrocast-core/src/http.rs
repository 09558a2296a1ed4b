//! Direct HTTP transcode: one encoder per request, stdout streamed straight
//! into the response body.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encoder::{
    compose_args, EncodeTarget, EncoderExit, EncoderHandle, EncoderLauncher, EncoderSettings,
    LaunchRequest,
};
use crate::error::StreamError;
use crate::input::{InputAcquirer, InputRelease};
use crate::profile::Profile;
use crate::resolver::{ResolveError, StreamResolver};
use crate::timespec::parse_time_spec;

/// Kills the encoder and releases its input when the response body is
/// dropped, which is what happens when the client goes away.
struct EncodeGuard {
    handle: EncoderHandle,
    release: Option<InputRelease>,
    label: String,
}

impl Drop for EncodeGuard {
    fn drop(&mut self) {
        debug!(encode = %self.label, "http encode finished, stopping encoder");
        self.handle.kill();
        if let Some(release) = self.release.take() {
            release.release();
        }
    }
}

#[derive(Clone)]
pub struct DirectTranscoder {
    launcher: Arc<dyn EncoderLauncher>,
    acquirer: InputAcquirer,
    settings: EncoderSettings,
}

impl DirectTranscoder {
    pub fn new(
        launcher: Arc<dyn EncoderLauncher>,
        acquirer: InputAcquirer,
        settings: EncoderSettings,
    ) -> Self {
        Self {
            launcher,
            acquirer,
            settings,
        }
    }

    /// Starts an encode of `url` and returns a response streaming its output.
    /// Errors are returned before any byte is produced.
    pub async fn stream(
        &self,
        url: &str,
        video_id: &str,
        profile: Profile,
        start: f64,
    ) -> Result<Response, StreamError> {
        let spec = profile.spec();
        let disposition = content_disposition(&spec.output.file_name(video_id))
            .ok_or_else(|| StreamError::InvalidPath(video_id.to_string()))?;

        let (input, release) = self.acquirer.build_input(url, start).await?;
        let args = compose_args(&self.settings, spec, &input, &EncodeTarget::Stdout)?;
        let label = format!("http:{profile}:{video_id}");
        let cancel = CancellationToken::new();
        let mut process = self
            .launcher
            .launch(
                LaunchRequest {
                    args,
                    pipe_stdin: input.uses_pipe,
                    pipe_stdout: true,
                    label: label.clone(),
                },
                cancel.clone(),
            )
            .await?;

        let Some(stdout) = process.stdout.take() else {
            process.handle.kill();
            return Err(StreamError::EncoderStartFailed(
                "encoder stdout was not captured".into(),
            ));
        };
        if let Some(stdin) = process.stdin.take() {
            self.acquirer
                .start_pump(stdin, input.source_url.clone(), cancel.child_token());
        }

        let exit_label = label.clone();
        let exit = process.exit;
        tokio::spawn(async move {
            match exit.await.unwrap_or(EncoderExit::Killed) {
                EncoderExit::Failed(reason) => {
                    warn!(encode = %exit_label, %reason, "encoder failed mid-stream")
                }
                EncoderExit::Finished => debug!(encode = %exit_label, "encoder finished"),
                EncoderExit::Killed => {}
            }
        });

        info!(encode = %label, offset = input.start_offset, "streaming direct transcode");
        let guard = EncodeGuard {
            handle: process.handle,
            release: Some(release),
            label,
        };
        let body = ReaderStream::new(stdout).map(move |chunk| {
            let _ = &guard;
            chunk
        });

        let mut response = Response::new(Body::from_stream(body));
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(spec.output.content_type),
        );
        headers.insert(CONTENT_DISPOSITION, disposition);
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        Ok(response)
    }
}

/// `inline; filename="..."` with quotes and backslashes escaped. Names that
/// cannot go in a header at all (control or non-ASCII bytes) yield `None`.
fn content_disposition(file_name: &str) -> Option<HeaderValue> {
    let mut quoted = String::with_capacity(file_name.len() + 2);
    for ch in file_name.chars() {
        if !ch.is_ascii() || ch.is_ascii_control() {
            return None;
        }
        if matches!(ch, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    HeaderValue::from_str(&format!("inline; filename=\"{quoted}\"")).ok()
}

/// `profile=<name>` wins, then the `aac`, `mp3` and `edge` flags. Default is
/// retro.
pub fn profile_from_query(query: &HashMap<String, String>) -> Result<Profile, StreamError> {
    if let Some(name) = query.get("profile") {
        return Profile::parse(name);
    }
    let flagged = [Profile::Aac, Profile::Mp3, Profile::Edge]
        .into_iter()
        .find(|profile| query.contains_key(profile.as_str()));
    Ok(flagged.unwrap_or(Profile::Retro))
}

/// `start`, then `t`. Unparseable values mean the beginning.
pub fn start_from_query(query: &HashMap<String, String>) -> f64 {
    ["start", "t"]
        .iter()
        .filter_map(|name| query.get(*name))
        .map(|raw| raw.trim())
        .find(|raw| !raw.is_empty())
        .and_then(parse_time_spec)
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct HttpState {
    pub resolver: Arc<dyn StreamResolver>,
    pub transcoder: DirectTranscoder,
    pub resolve_timeout: Duration,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/stream/ffmpeg/", get(missing_id))
        .route("/stream/ffmpeg/:id", get(transcode))
        .with_state(Arc::new(state))
}

async fn missing_id() -> Response {
    (StatusCode::BAD_REQUEST, "missing video id").into_response()
}

async fn transcode(
    State(state): State<Arc<HttpState>>,
    Path(raw_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let video_id = raw_id.strip_suffix(".mp4").unwrap_or(&raw_id).trim();
    if video_id.is_empty() {
        return missing_id().await;
    }
    let profile = match profile_from_query(&query) {
        Ok(profile) => profile,
        Err(err) => return error_response(&err),
    };
    let start = start_from_query(&query);

    let url = match timeout(state.resolve_timeout, state.resolver.resolve(video_id)).await {
        Ok(Ok(url)) => url,
        Ok(Err(ResolveError::NotAvailable(_))) => {
            return (StatusCode::NOT_FOUND, "stream not available").into_response()
        }
        Ok(Err(err)) => {
            warn!(video_id, error = %err, "resolve failed");
            return error_response(&StreamError::ResolveFailed(err.to_string()));
        }
        Err(_) => {
            warn!(video_id, "resolve timed out");
            return error_response(&StreamError::ResolveFailed("timed out".into()));
        }
    };

    match state.transcoder.stream(&url, video_id, profile, start).await {
        Ok(response) => response,
        Err(err) => {
            warn!(video_id, %profile, error = %err, "direct transcode failed to start");
            error_response(&err)
        }
    }
}

fn error_response(err: &StreamError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn profile_flags_select_profile() {
        assert_eq!(profile_from_query(&query(&[])).unwrap(), Profile::Retro);
        assert_eq!(profile_from_query(&query(&[("aac", "")])).unwrap(), Profile::Aac);
        assert_eq!(profile_from_query(&query(&[("mp3", "1")])).unwrap(), Profile::Mp3);
        assert_eq!(profile_from_query(&query(&[("edge", "")])).unwrap(), Profile::Edge);
        assert_eq!(
            profile_from_query(&query(&[("profile", "android"), ("aac", "")])).unwrap(),
            Profile::Android
        );
        assert!(matches!(
            profile_from_query(&query(&[("profile", "vhs")])),
            Err(StreamError::UnknownProfile(_))
        ));
    }

    #[test]
    fn disposition_escapes_quoted_string() {
        assert_eq!(
            content_disposition("abc_aac.mp4").unwrap(),
            "inline; filename=\"abc_aac.mp4\""
        );
        assert_eq!(
            content_disposition("a\"b\\c.mp4").unwrap(),
            "inline; filename=\"a\\\"b\\\\c.mp4\""
        );
        assert!(content_disposition("a\r\nSet-Cookie: x.mp4").is_none());
        assert!(content_disposition("caf\u{e9}.mp4").is_none());
    }

    #[test]
    fn start_accepts_seconds_and_clock_values() {
        assert_eq!(start_from_query(&query(&[("start", "90")])), 90.0);
        assert_eq!(start_from_query(&query(&[("t", "1:30")])), 90.0);
        assert_eq!(start_from_query(&query(&[("start", " "), ("t", "5")])), 5.0);
        assert_eq!(start_from_query(&query(&[("start", "soon")])), 0.0);
        assert_eq!(start_from_query(&query(&[])), 0.0);
    }
}
