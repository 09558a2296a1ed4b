#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use retrocast_core::{
    EncoderExit, EncoderHandle, EncoderLauncher, EncoderProcess, EncoderSettings, InputAcquirer,
    LaunchRequest, MediaDescription, PublisherId, ResolveError, ResolverFn, SessionContext,
    SessionOptions, SessionRegistry, StreamError, StreamKey, StreamResolver, UpstreamSection,
};

pub const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=retrocast\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H263-1998/90000\r\n\
a=control:streamid=0\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 AMR/8000/1\r\n\
a=control:streamid=1\r\n";

pub fn description() -> MediaDescription {
    MediaDescription::parse(SDP.as_bytes()).unwrap()
}

/// Records launches instead of starting processes. With a registry attached
/// it plays the encoder's part and announces itself shortly after launch.
#[derive(Default)]
pub struct FakeLauncher {
    launches: Mutex<Vec<LaunchRequest>>,
    tokens: Mutex<Vec<CancellationToken>>,
    registry: Mutex<Option<Weak<SessionRegistry>>>,
    notify: Mutex<Option<mpsc::UnboundedSender<LaunchRequest>>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn auto_publish(&self, registry: &Arc<SessionRegistry>) {
        *self.registry.lock().unwrap() = Some(Arc::downgrade(registry));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LaunchRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify.lock().unwrap() = Some(tx);
        rx
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    pub fn cancelled_count(&self) -> usize {
        self.tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|token| token.is_cancelled())
            .count()
    }
}

/// Stream key the encoder was told to publish to.
pub fn publish_key(request: &LaunchRequest) -> StreamKey {
    let target = Url::parse(request.args.last().unwrap()).unwrap();
    StreamKey::new(target.path(), target.query().unwrap_or("")).unwrap()
}

#[async_trait]
impl EncoderLauncher for FakeLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<EncoderProcess, StreamError> {
        self.launches.lock().unwrap().push(request.clone());
        self.tokens.lock().unwrap().push(cancel.clone());
        if let Some(notify) = self.notify.lock().unwrap().as_ref() {
            let _ = notify.send(request.clone());
        }

        let registry = self
            .registry
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(registry) = registry {
            let key = publish_key(&request);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(session) = registry.get(&key) {
                    let publisher = PublisherId::new();
                    let _ = registry.attach_publisher(publisher, &session, description());
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let watched = cancel.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            let _ = exit_tx.send(EncoderExit::Killed);
        });
        Ok(EncoderProcess {
            handle: EncoderHandle::new(None, cancel),
            stdin: None,
            stdout: None,
            exit: exit_rx,
        })
    }
}

pub fn resolver() -> Arc<dyn StreamResolver> {
    Arc::new(ResolverFn::new(|id: String| async move {
        Ok(format!("http://upstream.test/{id}.mp4"))
    }))
}

pub fn failing_resolver() -> Arc<dyn StreamResolver> {
    Arc::new(ResolverFn::new(|id: String| async move {
        Err(ResolveError::NotAvailable(id))
    }))
}

pub fn options(publish_port: u16) -> SessionOptions {
    SessionOptions {
        publish_host: "127.0.0.1".into(),
        publish_port,
        udp_enabled: false,
        publisher_timeout: Duration::from_secs(2),
        resolve_timeout: Duration::from_secs(1),
        seek_tolerance: 0.5,
    }
}

pub fn context(
    launcher: Arc<dyn EncoderLauncher>,
    resolver: Arc<dyn StreamResolver>,
) -> SessionContext {
    SessionContext {
        resolver,
        launcher,
        acquirer: InputAcquirer::new(&UpstreamSection::default()).unwrap(),
        settings: EncoderSettings::default(),
        options: options(8554),
    }
}

/// What the server sent: a response or an interleaved RTP frame.
#[derive(Debug)]
pub enum Incoming {
    Response(RawResponse),
    Data { channel: u8, payload: Vec<u8> },
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn parse_incoming(buf: &[u8]) -> Option<(Incoming, usize)> {
    if buf.first() == Some(&b'$') {
        if buf.len() < 4 {
            return None;
        }
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return None;
        }
        let payload = buf[4..4 + len].to_vec();
        return Some((
            Incoming::Data {
                channel: buf[1],
                payload,
            },
            4 + len,
        ));
    }
    let end = buf.windows(4).position(|window| window == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..end]).ok()?;
    let mut lines = head.split("\r\n");
    let status = lines.next()?.split_whitespace().nth(1)?.parse().ok()?;
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();
    let len = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let total = end + 4 + len;
    if buf.len() < total {
        return None;
    }
    Some((
        Incoming::Response(RawResponse {
            status,
            headers,
            body: buf[end + 4..total].to_vec(),
        }),
        total,
    ))
}

/// Just enough of an RTSP client to drive the server in tests.
pub struct RtspClient {
    stream: tokio::net::TcpStream,
    buf: Vec<u8>,
    cseq: u32,
    pub session: Option<String>,
}

impl RtspClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: tokio::net::TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
            cseq: 0,
            session: None,
        }
    }

    pub async fn request(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> RawResponse {
        use tokio::io::AsyncWriteExt;

        self.cseq += 1;
        let mut text = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        if let Some(session) = &self.session {
            text.push_str(&format!("Session: {session}\r\n"));
        }
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        if !body.is_empty() {
            text.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        text.push_str("\r\n");
        self.stream.write_all(text.as_bytes()).await.unwrap();
        self.stream.write_all(body).await.unwrap();

        loop {
            if let Incoming::Response(response) = self.next().await {
                assert_eq!(
                    response.header("CSeq"),
                    Some(self.cseq.to_string().as_str())
                );
                if let Some(session) = response.header("Session") {
                    let id = session.split(';').next().unwrap_or_default().to_string();
                    self.session = Some(id);
                }
                return response;
            }
        }
    }

    pub async fn send_rtp(&mut self, channel: u8, payload: &[u8]) {
        use tokio::io::AsyncWriteExt;

        let mut frame = vec![b'$', channel];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn next(&mut self) -> Incoming {
        use tokio::io::AsyncReadExt;

        loop {
            if let Some((incoming, consumed)) = parse_incoming(&self.buf) {
                self.buf.drain(..consumed);
                return incoming;
            }
            let mut chunk = [0u8; 4096];
            let read = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("server reply timed out")
                .unwrap();
            assert!(read > 0, "server closed the connection");
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Next interleaved frame, skipping anything else.
    pub async fn next_rtp(&mut self) -> (u8, Vec<u8>) {
        loop {
            if let Incoming::Data { channel, payload } = self.next().await {
                return (channel, payload);
            }
        }
    }
}
