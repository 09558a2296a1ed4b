use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rtsp_types::headers::{
    self, HeaderName, NptRange, NptTime, Public, Range, RtpTransport, Session, Transports,
};
use rtsp_types::{Message, Method, ParseError, Request, Response, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StreamError;
use crate::session::{PublisherFeed, PublisherId, SessionRegistry, StreamSession};

use super::media::{MediaDescription, MediaSubscription, RtpPacket};
use super::path::{npt_start, parse_request, split_track, RtspTransport, StreamKey};
use super::transport::{
    self, client_ports, interleaved_channels, interleaved_reply, is_tcp, udp_reply,
};
use super::udp::UdpTransport;

const PUBLIC_METHODS: [Method; 10] = [
    Method::Options,
    Method::Describe,
    Method::Announce,
    Method::Setup,
    Method::Play,
    Method::Pause,
    Method::Record,
    Method::Teardown,
    Method::GetParameter,
    Method::SetParameter,
];
const SESSION_TIMEOUT_SECS: u64 = 60;
const READ_CHUNK: usize = 16 * 1024;
const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;
const OUTBOUND_CAPACITY: usize = 1024;

/// State shared by every connection of one server.
pub(crate) struct ServerShared {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) default_transport: Option<RtspTransport>,
    pub(crate) read_timeout: Duration,
    pub(crate) udp: Option<Arc<UdpTransport>>,
}

#[derive(Debug, Error)]
enum ConnError {
    #[error("connection io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed rtsp message")]
    Malformed,
    #[error("no data within {0:?}")]
    Idle(Duration),
    #[error("failed to encode response: {0}")]
    Encode(String),
    #[error("connection writer closed")]
    WriterClosed,
}

struct PublisherRole {
    id: PublisherId,
    session: Arc<StreamSession>,
    /// Interleaved RTP channel to track index.
    channels: HashMap<u8, usize>,
    /// Client RTP port to track index.
    udp_ports: Vec<(u16, usize)>,
    setups: usize,
    feed: Option<PublisherFeed>,
}

#[derive(Debug, Clone, Copy)]
enum PlayerTrack {
    Interleaved { track: usize, channel: u8 },
    Udp { track: usize, client: SocketAddr },
}

impl PlayerTrack {
    fn track(&self) -> usize {
        match self {
            PlayerTrack::Interleaved { track, .. } | PlayerTrack::Udp { track, .. } => *track,
        }
    }
}

struct PlayerRole {
    session: Arc<StreamSession>,
    tracks: Vec<PlayerTrack>,
    forward: Option<CancellationToken>,
}

enum Role {
    Idle,
    Publisher(PublisherRole),
    Player(PlayerRole),
}

struct Reply {
    status: u16,
    headers: Vec<(HeaderName, String)>,
    public: Option<Public>,
    transports: Option<Transports>,
    range: Option<Range>,
    body: Vec<u8>,
    start_forwarding: bool,
}

impl Reply {
    fn ok() -> Self {
        Self::status(200)
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            public: None,
            transports: None,
            range: None,
            body: Vec::new(),
            start_forwarding: false,
        }
    }

    fn error(err: &StreamError) -> Self {
        Self::status(err.rtsp_status())
    }

    fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn transports(mut self, transports: Transports) -> Self {
        self.transports = Some(transports);
        self
    }

    fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push((headers::CONTENT_TYPE, content_type.to_string()));
        self.body = body;
        self
    }
}

struct Connection {
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    out: mpsc::Sender<Bytes>,
    role: Role,
    session_id: Option<String>,
}

/// Serves one RTSP connection until the peer disconnects, the server shuts
/// down or the connection idles out.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let (out, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
    tokio::spawn(write_loop(writer, outbound, peer));

    let mut conn = Connection {
        peer,
        shared,
        out,
        role: Role::Idle,
        session_id: None,
    };
    debug!(%peer, "rtsp connection opened");
    let outcome = conn.read_loop(&mut reader, &shutdown).await;
    conn.release_role();
    match outcome {
        Ok(()) => debug!(%peer, "rtsp connection closed"),
        Err(err) => info!(%peer, error = %err, "rtsp connection dropped"),
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>, peer: SocketAddr) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!(%peer, error = %err, "rtsp write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

impl Connection {
    async fn read_loop(
        &mut self,
        reader: &mut OwnedReadHalf,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            while let Some((message, consumed)) = parse_message(&buf)? {
                buf.advance(consumed);
                self.handle_message(message).await?;
            }
            if buf.len() > MAX_PENDING_BYTES {
                return Err(ConnError::Malformed);
            }
            buf.reserve(READ_CHUNK);
            let limit = self.idle_limit();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = read_with_limit(reader, &mut buf, limit) => read?,
            };
            if read == 0 {
                return Ok(());
            }
        }
    }

    /// Players may sit silent while media flows; everyone else must keep
    /// talking.
    fn idle_limit(&self) -> Option<Duration> {
        match self.role {
            Role::Player(_) => None,
            _ if self.shared.read_timeout.is_zero() => None,
            _ => Some(self.shared.read_timeout),
        }
    }

    async fn handle_message(&mut self, message: Message<Vec<u8>>) -> Result<(), ConnError> {
        match message {
            Message::Request(request) => {
                let reply = self.dispatch(&request).await;
                let start_forwarding = reply.start_forwarding && reply.status == 200;
                self.send_reply(&request, reply).await?;
                if start_forwarding {
                    self.start_forwarding();
                }
            }
            Message::Data(data) => {
                let channel = data.channel_id();
                self.route_interleaved(channel, data.into_body());
            }
            Message::Response(_) => {}
        }
        Ok(())
    }

    async fn dispatch(&mut self, request: &Request<Vec<u8>>) -> Reply {
        debug!(
            peer = %self.peer,
            method = ?request.method(),
            uri = request.request_uri().map(|uri| uri.as_str()).unwrap_or("*"),
            "rtsp request"
        );
        match request.method() {
            Method::Options => {
                let mut reply = Reply::ok();
                reply.public = Some(Public::from(&PUBLIC_METHODS[..]));
                reply
            }
            Method::Describe => self.describe(request).await,
            Method::Announce => self.announce(request),
            Method::Setup => self.setup(request),
            Method::Play => self.play(request).await,
            Method::Pause => self.pause(),
            Method::Record => self.record(),
            Method::Teardown => {
                self.release_role();
                Reply::ok()
            }
            Method::GetParameter | Method::SetParameter => Reply::ok(),
            _ => Reply::status(501),
        }
    }

    async fn send_reply(&self, request: &Request<Vec<u8>>, reply: Reply) -> Result<(), ConnError> {
        let mut builder = Response::builder(request.version(), StatusCode::from(reply.status));
        if let Some(cseq) = header(request, &headers::CSEQ) {
            builder = builder.header(headers::CSEQ, cseq);
        }
        if let Some(id) = &self.session_id {
            if !matches!(request.method(), Method::Options | Method::Describe) {
                let session = Session::with_timeout(id.clone(), SESSION_TIMEOUT_SECS);
                builder = builder.typed_header::<Session>(&session);
            }
        }
        if let Some(public) = &reply.public {
            builder = builder.typed_header::<Public>(public);
        }
        if let Some(transports) = &reply.transports {
            builder = builder.typed_header::<Transports>(transports);
        }
        if let Some(range) = &reply.range {
            builder = builder.typed_header::<Range>(range);
        }
        for (name, value) in reply.headers {
            builder = builder.header(name, value);
        }
        if !reply.body.is_empty() {
            builder = builder.header(headers::CONTENT_LENGTH, reply.body.len().to_string());
        }
        let response = builder.build(reply.body);
        let mut encoded = Vec::new();
        response
            .write(&mut encoded)
            .map_err(|err| ConnError::Encode(format!("{err:?}")))?;
        self.out
            .send(Bytes::from(encoded))
            .await
            .map_err(|_| ConnError::WriterClosed)
    }

    fn ensure_session_id(&mut self) {
        self.session_id.get_or_insert_with(|| {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(16);
            id
        });
    }

    async fn describe(&mut self, request: &Request<Vec<u8>>) -> Reply {
        let Some((path, query, _)) = target(request) else {
            return Reply::status(400);
        };
        let stream = match parse_request(&path, &query, self.shared.default_transport) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(peer = %self.peer, %path, error = %err, "rejected describe");
                return Reply::error(&err);
            }
        };

        let registry = &self.shared.registry;
        let session = registry.get_or_create(&stream);
        session.ensure_started();
        let ready = if session.offset_differs(stream.start) {
            session.seek(stream.start).await
        } else {
            session
                .wait_ready(registry.context().options.publisher_timeout)
                .await
        };
        match ready {
            Ok(description) => {
                let base = request
                    .request_uri()
                    .map(|uri| format!("{}/", uri.as_str().trim_end_matches('/')))
                    .unwrap_or_default();
                Reply::ok()
                    .header(headers::CONTENT_BASE, base)
                    .body("application/sdp", description.for_players().into_bytes())
            }
            Err(err) => {
                warn!(key = %stream.key, error = %err, "describe failed");
                Reply::error(&err)
            }
        }
    }

    fn announce(&mut self, request: &Request<Vec<u8>>) -> Reply {
        if !is_loopback(self.peer.ip()) {
            let err = StreamError::PublisherRejected(self.peer.to_string());
            warn!(peer = %self.peer, "rejected announce from non-loopback peer");
            return Reply::error(&err);
        }
        let Some((path, query, _)) = target(request) else {
            return Reply::status(400);
        };
        let Some(session) = StreamKey::new(&path, &query)
            .ok()
            .and_then(|key| self.shared.registry.get(&key))
        else {
            warn!(peer = %self.peer, %path, %query, "announce for unknown stream");
            return Reply::error(&StreamError::UnknownStream(path));
        };
        let description = match MediaDescription::parse(request.body()) {
            Ok(description) => description,
            Err(err) => {
                warn!(key = %session.key(), error = %err, "rejected announce");
                return Reply::error(&err);
            }
        };

        let publisher = match &self.role {
            Role::Publisher(current) if Arc::ptr_eq(&current.session, &session) => current.id,
            _ => PublisherId::new(),
        };
        if let Err(err) = self
            .shared
            .registry
            .attach_publisher(publisher, &session, description)
        {
            warn!(key = %session.key(), error = %err, "rejected announce");
            return Reply::error(&err);
        }
        if !matches!(&self.role, Role::Publisher(current) if current.id == publisher) {
            self.release_role();
            self.role = Role::Publisher(PublisherRole {
                id: publisher,
                session,
                channels: HashMap::new(),
                udp_ports: Vec::new(),
                setups: 0,
                feed: None,
            });
        }
        self.ensure_session_id();
        Reply::ok()
    }

    fn setup(&mut self, request: &Request<Vec<u8>>) -> Reply {
        let Some((path, query, track)) = target(request) else {
            return Reply::status(400);
        };
        let Some(requested) = transport::requested(request) else {
            return Reply::status(461);
        };
        if matches!(self.role, Role::Publisher(_)) {
            self.setup_publisher(track, &requested)
        } else {
            self.setup_player(&path, &query, track, &requested)
        }
    }

    fn setup_publisher(&mut self, track: Option<usize>, requested: &RtpTransport) -> Reply {
        let server_ports = self.shared.udp.as_ref().map(|udp| udp.ports());
        let Role::Publisher(publisher) = &mut self.role else {
            return Reply::status(455);
        };
        let track = track.unwrap_or(publisher.setups);
        if is_tcp(requested) {
            let (rtp, rtcp) =
                interleaved_channels(requested).unwrap_or_else(|| default_channels(track));
            publisher.channels.insert(rtp, track);
            publisher.setups += 1;
            return Reply::ok().transports(interleaved_reply(rtp, rtcp));
        }
        match (server_ports, client_ports(requested)) {
            (Some(server), Some(client)) => {
                publisher.udp_ports.push((client.0, track));
                publisher.setups += 1;
                Reply::ok().transports(udp_reply(client, server))
            }
            _ => Reply::status(461),
        }
    }

    fn setup_player(
        &mut self,
        path: &str,
        query: &str,
        track: Option<usize>,
        requested: &RtpTransport,
    ) -> Reply {
        if requested.params.multicast {
            return Reply::status(461);
        }
        let Some(session) = StreamKey::new(path, query)
            .ok()
            .and_then(|key| self.shared.registry.get(&key))
        else {
            return Reply::status(404);
        };
        let Some(description) = session.description() else {
            return Reply::status(404);
        };
        let server_ports = self.shared.udp.as_ref().map(|udp| udp.ports());
        let client = client_ports(requested);
        let tcp = is_tcp(requested);
        if !tcp && (server_ports.is_none() || client.is_none()) {
            return Reply::status(461);
        }

        let same_session = matches!(&self.role, Role::Player(player) if Arc::ptr_eq(&player.session, &session));
        if !same_session {
            self.release_role();
            self.role = Role::Player(PlayerRole {
                session,
                tracks: Vec::new(),
                forward: None,
            });
        }
        self.ensure_session_id();
        let peer = self.peer;
        let Role::Player(player) = &mut self.role else {
            return Reply::status(455);
        };
        let track = track.unwrap_or(player.tracks.len());
        if track >= description.track_count() {
            return Reply::status(404);
        }
        player.tracks.retain(|existing| existing.track() != track);

        match (tcp, server_ports, client) {
            (false, Some(server), Some(client)) => {
                player.tracks.push(PlayerTrack::Udp {
                    track,
                    client: SocketAddr::new(peer.ip(), client.0),
                });
                Reply::ok().transports(udp_reply(client, server))
            }
            _ => {
                let (rtp, rtcp) =
                    interleaved_channels(requested).unwrap_or_else(|| default_channels(track));
                player.tracks.push(PlayerTrack::Interleaved {
                    track,
                    channel: rtp,
                });
                Reply::ok().transports(interleaved_reply(rtp, rtcp))
            }
        }
    }

    async fn play(&mut self, request: &Request<Vec<u8>>) -> Reply {
        let session = match &self.role {
            Role::Player(player) if !player.tracks.is_empty() => Arc::clone(&player.session),
            _ => return Reply::status(455),
        };
        let start = match request.typed_header::<Range>() {
            Ok(Some(range)) => npt_start(&range),
            Ok(None) => Ok(None),
            Err(_) => Err(StreamError::InvalidRange(
                header(request, &headers::RANGE).unwrap_or_default().to_string(),
            )),
        };
        match start {
            Ok(Some(start)) => {
                if let Err(err) = session.seek(start).await {
                    warn!(key = %session.key(), start, error = %err, "seek failed");
                    return Reply::error(&err);
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "rejected play range");
                return Reply::error(&err);
            }
        }
        let mut reply = Reply::ok();
        reply.range = Some(playing_from(session.offset()));
        reply.start_forwarding = true;
        reply
    }

    fn pause(&mut self) -> Reply {
        match &mut self.role {
            Role::Player(player) => {
                if let Some(forward) = player.forward.take() {
                    forward.cancel();
                }
                Reply::ok()
            }
            _ => Reply::status(455),
        }
    }

    fn record(&mut self) -> Reply {
        let peer = self.peer;
        let udp = self.shared.udp.clone();
        let Role::Publisher(publisher) = &mut self.role else {
            return Reply::status(455);
        };
        let Some(feed) = publisher.session.publisher_feed(publisher.id) else {
            return Reply::status(455);
        };
        if let Some(udp) = &udp {
            for (port, track) in &publisher.udp_ports {
                udp.register_source(SocketAddr::new(peer.ip(), *port), publisher.id, *track, feed.clone());
            }
        }
        info!(key = %publisher.session.key(), publisher = %publisher.id, "publisher recording");
        publisher.feed = Some(feed);
        Reply::ok()
    }

    fn route_interleaved(&self, channel: u8, payload: Vec<u8>) {
        let Role::Publisher(publisher) = &self.role else {
            return;
        };
        let (Some(feed), Some(track)) = (&publisher.feed, publisher.channels.get(&channel)) else {
            return;
        };
        if feed.attempt.is_cancelled() {
            return;
        }
        feed.hub.publish(RtpPacket {
            track: *track,
            payload: Bytes::from(payload),
        });
    }

    fn start_forwarding(&mut self) {
        let udp = self.shared.udp.clone();
        let out = self.out.clone();
        let peer = self.peer;
        let Role::Player(player) = &mut self.role else {
            return;
        };
        if player.forward.is_some() {
            return;
        }
        let Some(hub) = player.session.hub() else {
            return;
        };
        let token = CancellationToken::new();
        player.forward = Some(token.clone());
        tokio::spawn(forward_packets(
            hub.subscribe(),
            player.tracks.clone(),
            out,
            udp,
            token,
            peer,
        ));
    }

    /// Drops whatever this connection was doing. A publisher leaving takes
    /// its session down with it.
    fn release_role(&mut self) {
        match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Publisher(publisher) => {
                if let Some(udp) = &self.shared.udp {
                    udp.unregister_publisher(publisher.id);
                }
                if self.shared.registry.close_publisher(publisher.id) {
                    info!(key = %publisher.session.key(), publisher = %publisher.id, "publisher left, session closed");
                }
            }
            Role::Player(player) => {
                if let Some(forward) = player.forward {
                    forward.cancel();
                }
            }
            Role::Idle => {}
        }
    }
}

async fn forward_packets(
    mut subscription: MediaSubscription,
    tracks: Vec<PlayerTrack>,
    out: mpsc::Sender<Bytes>,
    udp: Option<Arc<UdpTransport>>,
    token: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            packet = subscription.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        for target in tracks.iter().filter(|target| target.track() == packet.track) {
            match target {
                PlayerTrack::Interleaved { channel, .. } => {
                    if out.send(interleaved_frame(*channel, &packet.payload)).await.is_err() {
                        return;
                    }
                }
                PlayerTrack::Udp { client, .. } => {
                    if let Some(udp) = &udp {
                        if let Err(err) = udp.send_rtp(&packet.payload, *client).await {
                            debug!(%peer, error = %err, "udp rtp send failed");
                        }
                    }
                }
            }
        }
    }
    debug!(%peer, "player forwarding stopped");
}

/// `$`, channel, big-endian length, payload.
fn interleaved_frame(channel: u8, payload: &[u8]) -> Bytes {
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut frame = BytesMut::with_capacity(4 + len as usize);
    frame.extend_from_slice(&[b'$', channel]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload[..len as usize]);
    frame.freeze()
}

fn parse_message(buf: &[u8]) -> Result<Option<(Message<Vec<u8>>, usize)>, ConnError> {
    if buf.is_empty() {
        return Ok(None);
    }
    match Message::<Vec<u8>>::parse(buf) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(ParseError::Error) => Err(ConnError::Malformed),
        Err(_) => Ok(None),
    }
}

async fn read_with_limit(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    limit: Option<Duration>,
) -> Result<usize, ConnError> {
    match limit {
        Some(limit) => timeout(limit, reader.read_buf(buf))
            .await
            .map_err(|_| ConnError::Idle(limit))?
            .map_err(ConnError::from),
        None => Ok(reader.read_buf(buf).await?),
    }
}

fn header<'a>(request: &'a Request<Vec<u8>>, name: &HeaderName) -> Option<&'a str> {
    request.header(name).map(|value| value.as_str())
}

/// Request path and query with any track selector split off.
fn target(request: &Request<Vec<u8>>) -> Option<(String, String, Option<usize>)> {
    let uri = request.request_uri()?;
    Some(split_track(uri.path(), uri.query().unwrap_or("")))
}

/// `npt=<offset>-`, rounded to the millisecond.
fn playing_from(offset: f64) -> Range {
    let millis = (offset.max(0.0) * 1000.0).round() as u64;
    let fraction = match millis % 1000 {
        0 => None,
        rest => Some(rest as u32 * 1_000_000),
    };
    Range::Npt(NptRange::From(NptTime::Seconds(millis / 1000, fraction)))
}

fn default_channels(track: usize) -> (u8, u8) {
    let rtp = u8::try_from(track * 2).unwrap_or(u8::MAX - 1);
    (rtp, rtp + 1)
}

/// Publishers must run on this host. Unspecified and IPv4-mapped loopback
/// addresses count.
pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.to_ipv4_mapped().map_or(false, |v4| v4.is_loopback())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_interleaved_packets() {
        let frame = interleaved_frame(2, b"abc");
        assert_eq!(&frame[..], &[b'$', 2, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_loopback("0.0.0.0".parse().unwrap()));
        assert!(!is_loopback("192.168.1.20".parse().unwrap()));
        assert!(!is_loopback("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn play_range_reports_the_offset() {
        assert_eq!(playing_from(30.0).to_string(), "npt=30-");
        assert_eq!(playing_from(12.3456).to_string(), "npt=12.346000000-");
        assert_eq!(playing_from(-1.0).to_string(), "npt=0-");
    }

    #[test]
    fn channels_follow_track_index() {
        assert_eq!(default_channels(0), (0, 1));
        assert_eq!(default_channels(1), (2, 3));
        assert_eq!(default_channels(500), (254, 255));
    }

    #[test]
    fn partial_messages_wait_for_more_bytes() {
        let request = b"OPTIONS rtsp://127.0.0.1/retro/abc RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        assert!(parse_message(&request[..20]).unwrap().is_none());
        let (message, consumed) = parse_message(request).unwrap().unwrap();
        assert_eq!(consumed, request.len());
        assert!(matches!(message, Message::Request(_)));
    }
}
