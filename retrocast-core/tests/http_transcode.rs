use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use retrocast_core::{
    router, DirectTranscoder, EncoderExit, EncoderHandle, EncoderLauncher, EncoderProcess,
    EncoderSettings, HttpState, InputAcquirer, LaunchRequest, ResolveError, ResolverFn,
    StreamError, StreamResolver, UpstreamSection,
};

/// Writes one chunk to stdout and then keeps the pipe open, like an encoder
/// that is still working.
#[derive(Default)]
struct StreamingLauncher {
    requests: Mutex<Vec<LaunchRequest>>,
    tokens: Mutex<Vec<CancellationToken>>,
    open_pipes: Mutex<Vec<DuplexStream>>,
    fail: bool,
}

#[async_trait]
impl EncoderLauncher for StreamingLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<EncoderProcess, StreamError> {
        if self.fail {
            return Err(StreamError::EncoderStartFailed("ffmpeg: not found".into()));
        }
        assert!(request.pipe_stdout);
        self.requests.lock().unwrap().push(request);
        self.tokens.lock().unwrap().push(cancel.clone());

        let (stdout, mut encoder_side) = tokio::io::duplex(1024);
        encoder_side.write_all(b"first-chunk").await.unwrap();
        self.open_pipes.lock().unwrap().push(encoder_side);

        let (_exit_tx, exit) = oneshot::channel::<EncoderExit>();
        Ok(EncoderProcess {
            handle: EncoderHandle::new(None, cancel),
            stdin: None,
            stdout: Some(Box::new(stdout)),
            exit,
        })
    }
}

fn resolver_for(result: Result<&'static str, &'static str>) -> Arc<dyn StreamResolver> {
    Arc::new(ResolverFn::new(move |id: String| async move {
        match result {
            Ok(base) => Ok(format!("{base}/{id}")),
            Err("missing") => Err(ResolveError::NotAvailable(id)),
            Err(other) => Err(ResolveError::Other(other.to_string())),
        }
    }))
}

fn app(launcher: Arc<StreamingLauncher>, resolver: Arc<dyn StreamResolver>) -> axum::Router {
    router(HttpState {
        resolver,
        transcoder: DirectTranscoder::new(
            launcher,
            InputAcquirer::new(&UpstreamSection::default()).unwrap(),
            EncoderSettings::default(),
        ),
        resolve_timeout: Duration::from_secs(1),
    })
}

async fn get(app: axum::Router, uri: &str) -> axum::response::Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn aac_request_streams_before_encoder_finishes() {
    let launcher = Arc::new(StreamingLauncher::default());
    let response = get(
        app(launcher.clone(), resolver_for(Ok("http://upstream.test"))),
        "/stream/ffmpeg/xyz.mp4?aac&t=1:30",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "video/mp4");
    assert_eq!(
        headers["content-disposition"],
        "inline; filename=\"xyz_aac.mp4\""
    );
    assert_eq!(headers["transfer-encoding"], "chunked");

    let request = launcher.requests.lock().unwrap()[0].clone();
    let joined = request.args.join(" ");
    assert!(joined.contains("-ss 90.000 -i http://upstream.test/xyz"));
    assert!(joined.ends_with("pipe:1"));

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("first chunk should arrive while the encoder runs")
        .unwrap()
        .unwrap();
    assert_eq!(&first[..], b"first-chunk");

    // Client goes away: the encoder is stopped.
    let token = launcher.tokens.lock().unwrap()[0].clone();
    assert!(!token.is_cancelled());
    drop(body);
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn request_errors_map_to_status_codes() {
    let launcher = Arc::new(StreamingLauncher::default());
    let ok = resolver_for(Ok("http://upstream.test"));

    let missing = get(app(launcher.clone(), ok.clone()), "/stream/ffmpeg/").await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let suffix_only = get(app(launcher.clone(), ok.clone()), "/stream/ffmpeg/.mp4").await;
    assert_eq!(suffix_only.status(), StatusCode::BAD_REQUEST);

    let unknown_profile = get(app(launcher.clone(), ok), "/stream/ffmpeg/xyz?profile=vhs").await;
    assert_eq!(unknown_profile.status(), StatusCode::BAD_REQUEST);

    let unavailable = get(
        app(launcher.clone(), resolver_for(Err("missing"))),
        "/stream/ffmpeg/xyz",
    )
    .await;
    assert_eq!(unavailable.status(), StatusCode::NOT_FOUND);

    let broken = get(
        app(launcher.clone(), resolver_for(Err("upstream down"))),
        "/stream/ffmpeg/xyz",
    )
    .await;
    assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(launcher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn encoder_start_failure_is_a_server_error() {
    let launcher = Arc::new(StreamingLauncher {
        fail: true,
        ..StreamingLauncher::default()
    });
    let response = get(
        app(launcher, resolver_for(Ok("http://upstream.test"))),
        "/stream/ffmpeg/xyz?mp3",
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn quotes_in_video_id_are_escaped_in_disposition() {
    let launcher = Arc::new(StreamingLauncher::default());
    let ok = resolver_for(Ok("http://upstream.test"));

    let quoted = get(app(launcher.clone(), ok.clone()), "/stream/ffmpeg/a%22b?aac").await;
    assert_eq!(quoted.status(), StatusCode::OK);
    assert_eq!(
        quoted.headers()["content-disposition"],
        "inline; filename=\"a\\\"b_aac.mp4\""
    );

    let control = get(app(launcher.clone(), ok), "/stream/ffmpeg/a%0Db").await;
    assert_eq!(control.status(), StatusCode::BAD_REQUEST);
    assert_eq!(launcher.requests.lock().unwrap().len(), 1);
}
