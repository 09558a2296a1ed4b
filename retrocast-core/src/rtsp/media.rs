use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StreamError;

const HUB_CAPACITY: usize = 512;

/// SDP announced by a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    sdp: String,
    tracks: usize,
}

impl MediaDescription {
    pub fn parse(body: &[u8]) -> Result<Self, StreamError> {
        let sdp = std::str::from_utf8(body)
            .map_err(|_| StreamError::InvalidDescription("body is not utf-8".into()))?
            .replace("\r\n", "\n");
        if !sdp.lines().any(|line| line.starts_with("v=")) {
            return Err(StreamError::InvalidDescription("missing version line".into()));
        }
        let tracks = sdp.lines().filter(|line| line.starts_with("m=")).count();
        if tracks == 0 {
            return Err(StreamError::InvalidDescription("no media sections".into()));
        }
        Ok(Self { sdp, tracks })
    }

    pub fn track_count(&self) -> usize {
        self.tracks
    }

    pub fn raw(&self) -> &str {
        &self.sdp
    }

    /// SDP served to players: session-level `a=control:*`, one
    /// `a=control:trackID=N` per media section and a wildcard connection
    /// address.
    pub fn for_players(&self) -> String {
        let mut out = String::with_capacity(self.sdp.len() + 64);
        let mut track = None::<usize>;
        for line in self.sdp.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with("a=control:") {
                continue;
            }
            if line.starts_with("m=") {
                match track {
                    None => out.push_str("a=control:*\r\n"),
                    Some(index) => push_track_control(&mut out, index),
                }
                track = Some(track.map_or(0, |index| index + 1));
            }
            if line.starts_with("c=") {
                out.push_str("c=IN IP4 0.0.0.0\r\n");
                continue;
            }
            out.push_str(line);
            out.push_str("\r\n");
        }
        if let Some(index) = track {
            push_track_control(&mut out, index);
        }
        out
    }
}

fn push_track_control(out: &mut String, index: usize) {
    out.push_str(&format!("a=control:trackID={index}\r\n"));
}

/// One RTP packet from the publisher, tagged with its track index.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub track: usize,
    pub payload: Bytes,
}

/// Fan-out of a publisher's packets to every attached player. Survives seeks;
/// closed when the session is torn down.
#[derive(Debug, Clone)]
pub struct MediaHub {
    tx: broadcast::Sender<RtpPacket>,
    closed: CancellationToken,
}

impl Default for MediaHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(HUB_CAPACITY);
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Returns how many players received the packet.
    pub fn publish(&self, packet: RtpPacket) -> usize {
        if self.closed.is_cancelled() {
            return 0;
        }
        self.tx.send(packet).unwrap_or(0)
    }

    pub fn subscribe(&self) -> MediaSubscription {
        MediaSubscription {
            rx: self.tx.subscribe(),
            closed: self.closed.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub struct MediaSubscription {
    rx: broadcast::Receiver<RtpPacket>,
    closed: CancellationToken,
}

impl MediaSubscription {
    /// Next packet, or `None` once the hub is closed. Lagging players skip
    /// the packets they missed.
    pub async fn recv(&mut self) -> Option<RtpPacket> {
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                received = self.rx.recv() => match received {
                    Ok(packet) => return Some(packet),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "player lagging behind publisher");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}
