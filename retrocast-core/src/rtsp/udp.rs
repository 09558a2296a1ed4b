use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::normalize_address;
use crate::session::{PublisherFeed, PublisherId};

use super::media::RtpPacket;

const DATAGRAM_LIMIT: usize = 64 * 1024;

struct UdpSource {
    publisher: PublisherId,
    track: usize,
    feed: PublisherFeed,
}

/// Server RTP/RTCP socket pair shared by every UDP publisher and player.
pub(crate) struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_port: u16,
    rtcp_port: u16,
    sources: Mutex<HashMap<SocketAddr, UdpSource>>,
}

impl UdpTransport {
    pub(crate) async fn bind(rtp_address: &str, rtcp_address: &str) -> io::Result<Arc<Self>> {
        let rtp = UdpSocket::bind(normalize_address(rtp_address)).await?;
        let rtcp = UdpSocket::bind(normalize_address(rtcp_address)).await?;
        let rtp_port = rtp.local_addr()?.port();
        let rtcp_port = rtcp.local_addr()?.port();
        info!(rtp_port, rtcp_port, "rtsp udp transport bound");
        Ok(Arc::new(Self {
            rtp,
            rtcp,
            rtp_port,
            rtcp_port,
            sources: Mutex::new(HashMap::new()),
        }))
    }

    pub(crate) fn ports(&self) -> (u16, u16) {
        (self.rtp_port, self.rtcp_port)
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<SocketAddr, UdpSource>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes datagrams from `from` into `feed` as `track`.
    pub(crate) fn register_source(
        &self,
        from: SocketAddr,
        publisher: PublisherId,
        track: usize,
        feed: PublisherFeed,
    ) {
        debug!(%from, %publisher, track, "registered udp rtp source");
        self.sources().insert(
            from,
            UdpSource {
                publisher,
                track,
                feed,
            },
        );
    }

    pub(crate) fn unregister_publisher(&self, publisher: PublisherId) {
        self.sources()
            .retain(|_, source| source.publisher != publisher);
    }

    pub(crate) async fn send_rtp(&self, payload: &[u8], to: SocketAddr) -> io::Result<()> {
        self.rtp.send_to(payload, to).await.map(|_| ())
    }

    fn route(&self, from: SocketAddr, datagram: &[u8]) {
        let sources = self.sources();
        let Some(source) = sources.get(&from) else {
            return;
        };
        if source.feed.attempt.is_cancelled() {
            return;
        }
        source.feed.hub.publish(RtpPacket {
            track: source.track,
            payload: Bytes::copy_from_slice(datagram),
        });
    }

    /// Receives publisher RTP until `shutdown`. RTCP is read and dropped.
    pub(crate) fn spawn_receivers(self: &Arc<Self>, shutdown: CancellationToken) {
        let transport = Arc::clone(self);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_LIMIT];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = transport.rtp.recv_from(&mut buf) => match received {
                        Ok((len, from)) => transport.route(from, &buf[..len]),
                        Err(err) => warn!(error = %err, "udp rtp receive failed"),
                    },
                }
            }
        });

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_LIMIT];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = transport.rtcp.recv_from(&mut buf) => {
                        if let Err(err) = received {
                            debug!(error = %err, "udp rtcp receive failed");
                        }
                    }
                }
            }
        });
    }
}
