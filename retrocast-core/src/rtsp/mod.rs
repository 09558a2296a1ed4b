//! RTSP side of the engine: stream addressing, the publisher/player
//! connection handling and the server accept loop.

mod conn;
mod media;
mod path;
mod transport;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{normalize_address, RtspSection};
use crate::encoder::{EncoderLauncher, EncoderSettings};
use crate::input::InputAcquirer;
use crate::profile::Profile;
use crate::resolver::StreamResolver;
use crate::session::{SessionContext, SessionOptions, SessionRegistry};

use conn::{serve_connection, ServerShared};
use udp::UdpTransport;

pub use conn::is_loopback;
pub use media::{MediaDescription, MediaHub, MediaSubscription, RtpPacket};
pub use path::{
    canonical_query, npt_start, parse_request, public_url, range_start, split_track,
    start_from_query, strip_port, transport_from_query, RtspTransport, StreamKey, StreamRequest,
    UnsupportedTransport,
};

#[derive(Debug, Error)]
pub enum RtspServerError {
    #[error("failed to bind rtsp listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind rtsp udp sockets: {0}")]
    BindUdp(#[source] io::Error),
    #[error("rtsp server io error: {0}")]
    Io(#[from] io::Error),
}

/// Engine collaborators the server hands to every session.
pub struct EngineParts {
    pub resolver: Arc<dyn StreamResolver>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub acquirer: InputAcquirer,
    pub settings: EncoderSettings,
}

/// Embedded RTSP server. Encoders publish into it over loopback and players
/// read from it.
pub struct RtspServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
}

impl RtspServer {
    pub async fn bind(config: &RtspSection, parts: EngineParts) -> Result<Self, RtspServerError> {
        let address = normalize_address(&config.address);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| RtspServerError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let udp = match (&config.udp_rtp_address, &config.udp_rtcp_address) {
            (Some(rtp), Some(rtcp)) => Some(
                UdpTransport::bind(rtp, rtcp)
                    .await
                    .map_err(RtspServerError::BindUdp)?,
            ),
            _ => None,
        };

        let mut options = SessionOptions::from_config(config, local_addr.port());
        options.udp_enabled = udp.is_some();
        let registry = SessionRegistry::new(SessionContext {
            resolver: parts.resolver,
            launcher: parts.launcher,
            acquirer: parts.acquirer,
            settings: parts.settings,
            options,
        });

        info!(%local_addr, udp = udp.is_some(), "rtsp server listening");
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(ServerShared {
                registry,
                default_transport: config.default_transport(),
                read_timeout: config.read_timeout(),
                udp,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Cancelling the token stops `run` and closes every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Player URL for `video_id` on this server.
    pub fn public_url(
        &self,
        host: &str,
        profile: Profile,
        video_id: &str,
        start: f64,
        transport: Option<RtspTransport>,
    ) -> String {
        public_url(host, self.local_addr.port(), profile, video_id, start, transport)
    }

    pub async fn run(self) -> Result<(), RtspServerError> {
        if let Some(udp) = &self.shared.udp {
            udp.spawn_receivers(self.shutdown.clone());
        }
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "rtsp accept failed");
                        continue;
                    }
                },
            };
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%peer, error = %err, "failed to disable nagle");
            }
            tokio::spawn(serve_connection(
                stream,
                peer,
                Arc::clone(&self.shared),
                self.shutdown.clone(),
            ));
        }
        info!(sessions = self.shared.registry.len(), "rtsp server stopping");
        self.shared.registry.shutdown_all();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
