use rtsp_types::headers::{
    RtpLowerTransport, RtpProfile, RtpTransport, RtpTransportParameters, Transport, Transports,
};
use rtsp_types::Request;

/// First RTP/AVP alternative of the request's `Transport` header, if the
/// header is present and well formed.
pub(crate) fn requested(request: &Request<Vec<u8>>) -> Option<RtpTransport> {
    let transports = request.typed_header::<Transports>().ok()??;
    first_avp(&transports)
}

fn first_avp(transports: &Transports) -> Option<RtpTransport> {
    transports.iter().find_map(|transport| match transport {
        Transport::Rtp(rtp)
            if rtp.profile == RtpProfile::Avp
                && !matches!(rtp.lower_transport, Some(RtpLowerTransport::Other(_))) =>
        {
            Some(rtp.clone())
        }
        _ => None,
    })
}

/// `RTP/AVP` without a lower transport means UDP.
pub(crate) fn is_tcp(rtp: &RtpTransport) -> bool {
    matches!(rtp.lower_transport, Some(RtpLowerTransport::Tcp))
}

/// Requested channel pair. A lone `interleaved=N` means `N-(N+1)`.
pub(crate) fn interleaved_channels(rtp: &RtpTransport) -> Option<(u8, u8)> {
    let (first, second) = rtp.params.interleaved?;
    Some((first, second.or_else(|| first.checked_add(1))?))
}

pub(crate) fn client_ports(rtp: &RtpTransport) -> Option<(u16, u16)> {
    let (first, second) = rtp.params.client_port?;
    Some((first, second.or_else(|| first.checked_add(1))?))
}

pub(crate) fn interleaved_reply(rtp: u8, rtcp: u8) -> Transports {
    reply(
        RtpLowerTransport::Tcp,
        RtpTransportParameters {
            unicast: true,
            interleaved: Some((rtp, Some(rtcp))),
            ..Default::default()
        },
    )
}

pub(crate) fn udp_reply(client: (u16, u16), server: (u16, u16)) -> Transports {
    reply(
        RtpLowerTransport::Udp,
        RtpTransportParameters {
            unicast: true,
            client_port: Some((client.0, Some(client.1))),
            server_port: Some((server.0, Some(server.1))),
            ..Default::default()
        },
    )
}

// The mode is left out of replies: rtsp-types renders it quoted, which
// ffmpeg's muxer does not accept.
fn reply(lower: RtpLowerTransport, params: RtpTransportParameters) -> Transports {
    Transports::from(vec![Transport::Rtp(RtpTransport {
        profile: RtpProfile::Avp,
        lower_transport: Some(lower),
        params,
    })])
}
