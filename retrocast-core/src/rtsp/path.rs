use std::fmt;

use rtsp_types::headers::{NptRange, NptTime, Range};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::form_urlencoded;

use crate::error::StreamError;
use crate::profile::{profile_segment, Profile};
use crate::timespec::parse_time_spec;

/// Filename suffixes players append to the video id.
const KNOWN_SUFFIXES: [&str; 3] = [".3gp", ".mp4", ".avi"];
const TRANSPORT_KEYS: [&str; 2] = ["transport", "rtsp_transport"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtspTransport {
    Tcp,
    Udp,
    UdpMulticast,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported rtsp transport {0:?}")]
pub struct UnsupportedTransport(pub String);

impl RtspTransport {
    /// `auto` and the empty string clear the preference.
    pub fn parse(raw: &str) -> Result<Option<Self>, UnsupportedTransport> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(None),
            "tcp" => Ok(Some(RtspTransport::Tcp)),
            "udp" => Ok(Some(RtspTransport::Udp)),
            "udp_multicast" => Ok(Some(RtspTransport::UdpMulticast)),
            other => Err(UnsupportedTransport(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
            RtspTransport::UdpMulticast => "udp_multicast",
        }
    }

    /// Value for the encoder's `-rtsp_transport`. The encoder cannot push
    /// multicast, so that preference publishes over plain udp.
    pub fn publish_flag(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp | RtspTransport::UdpMulticast => "udp",
        }
    }
}

impl fmt::Display for RtspTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical identity of a playback intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    path: String,
    query: String,
}

impl StreamKey {
    pub fn new(path: &str, query: &str) -> Result<Self, StreamError> {
        let (profile, video_id) = split_path(path)?;
        Ok(Self {
            path: format!("/{}/{}", profile_segment(profile), video_id),
            query: canonical_query(query),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Path and query as the encoder should publish them, e.g.
    /// `/retro/abc123?transport=tcp`.
    pub fn resource(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.query.is_empty() {
            f.write_str(&self.path)
        } else {
            write!(f, "{}?{}", self.path, self.query)
        }
    }
}

/// Everything a DESCRIBE needs to know about a stream URL.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub key: StreamKey,
    pub profile: Profile,
    pub video_id: String,
    pub start: f64,
    pub transport: Option<RtspTransport>,
}

pub fn parse_request(
    path: &str,
    query: &str,
    default_transport: Option<RtspTransport>,
) -> Result<StreamRequest, StreamError> {
    let (profile, video_id) = split_path(path)?;
    Ok(StreamRequest {
        key: StreamKey::new(path, query)?,
        profile,
        video_id,
        start: start_from_query(query).unwrap_or(0.0),
        transport: transport_from_query(query, default_transport),
    })
}

fn split_path(path: &str) -> Result<(Profile, String), StreamError> {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let (profile, raw_id) = match segments.as_slice() {
        [id] => (Profile::Retro, *id),
        [profile, id] => (Profile::parse(profile)?, *id),
        _ => return Err(StreamError::InvalidPath(path.to_string())),
    };
    if !profile.spec().rtsp_capable {
        return Err(StreamError::RtspUnsupported(profile.as_str()));
    }
    let video_id = strip_known_suffix(raw_id.trim());
    if video_id.is_empty() {
        return Err(StreamError::InvalidPath(path.to_string()));
    }
    Ok((profile, video_id.to_string()))
}

fn strip_known_suffix(id: &str) -> &str {
    let lower = id.to_ascii_lowercase();
    KNOWN_SUFFIXES
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map(|suffix| &id[..id.len() - suffix.len()])
        .unwrap_or(id)
}

/// Sorted, deduplicated query with lower-cased keys and transport values.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| {
            let key = key.trim().to_ascii_lowercase();
            let value = if TRANSPORT_KEYS.contains(&key.as_str()) {
                value.trim().to_ascii_lowercase()
            } else {
                value.into_owned()
            };
            (key, value)
        })
        .collect();
    pairs.sort();
    pairs.dedup();
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn query_value(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn start_from_query(query: &str) -> Option<f64> {
    query_value(query, "start")
        .or_else(|| query_value(query, "t"))
        .and_then(|spec| parse_time_spec(&spec))
}

/// An explicit query preference wins over the server default. Unsupported
/// values are logged and ignored.
pub fn transport_from_query(
    query: &str,
    fallback: Option<RtspTransport>,
) -> Option<RtspTransport> {
    for key in TRANSPORT_KEYS {
        let Some(raw) = query_value(query, key) else {
            continue;
        };
        match RtspTransport::parse(&raw) {
            Ok(preference) => return preference,
            Err(err) => warn!(error = %err, "using fallback rtsp transport"),
        }
    }
    fallback
}

/// Splits a track selector (`/trackID=N` or `/streamid=N`) off a request
/// target. Players append it after the query when one is present.
pub fn split_track(path: &str, query: &str) -> (String, String, Option<usize>) {
    let mut target = path.to_string();
    if !query.is_empty() {
        target.push('?');
        target.push_str(query);
    }
    let mut track = None;
    if let Some(idx) = target.rfind('/') {
        let tail = target[idx + 1..].to_ascii_lowercase();
        let number = tail
            .strip_prefix("trackid=")
            .or_else(|| tail.strip_prefix("streamid="));
        if let Some(number) = number {
            track = number.parse().ok();
            target.truncate(idx);
        }
    }
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string(), track),
        None => (target, String::new(), track),
    }
}

/// Start offset requested by an RTSP `Range` header value.
pub fn range_start(header: &str) -> Result<Option<f64>, StreamError> {
    let range = header
        .trim()
        .parse::<Range>()
        .map_err(|_| StreamError::InvalidRange(header.to_string()))?;
    npt_start(&range)
}

/// Only `npt` ranges with a start time carry a seek. `now`, open starts and
/// the other known units are not seeks; an unknown unit is an error.
pub fn npt_start(range: &Range) -> Result<Option<f64>, StreamError> {
    match range {
        Range::Npt(NptRange::From(start) | NptRange::FromTo(start, _)) => Ok(npt_seconds(start)),
        Range::Npt(_) | Range::Smpte(_) | Range::Utc(_) => Ok(None),
        Range::Other(other) => Err(StreamError::InvalidRange(other.clone())),
    }
}

fn npt_seconds(time: &NptTime) -> Option<f64> {
    let (whole, nanos) = match *time {
        NptTime::Now => return None,
        NptTime::Seconds(seconds, nanos) => (seconds, nanos),
        NptTime::Hms(hours, minutes, seconds, nanos) => (
            hours
                .saturating_mul(3600)
                .saturating_add(u64::from(minutes) * 60 + u64::from(seconds)),
            nanos,
        ),
    };
    let total = u128::from(whole) * 1_000_000_000 + u128::from(nanos.unwrap_or(0));
    Some(total as f64 / 1e9)
}

/// Drops the port from a `Host`-style value, keeping bracketed IPv6 hosts.
pub fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        return match host.rfind(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.matches(':').count() {
        1 => match host.split_once(':') {
            Some(("", _)) => "localhost",
            Some((name, _)) => name,
            None => host,
        },
        _ => host,
    }
}

/// URL handed to players, e.g. `rtsp://host:8554/retro/abc123.3gp?start=30`.
pub fn public_url(
    host: &str,
    port: u16,
    profile: Profile,
    video_id: &str,
    start: f64,
    transport: Option<RtspTransport>,
) -> String {
    let host = match strip_port(host) {
        "" => "localhost",
        host => host,
    };
    let mut url = if port > 0 {
        format!("rtsp://{host}:{port}/{}/{video_id}.3gp", profile_segment(profile))
    } else {
        format!("rtsp://{host}/{}/{video_id}.3gp", profile_segment(profile))
    };
    let mut query = form_urlencoded::Serializer::new(String::new());
    if start > 0.0 {
        query.append_pair("start", &(start.floor() as u64).to_string());
    }
    if let Some(transport) = transport {
        query.append_pair("transport", transport.as_str());
    }
    let query = query.finish();
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_ignore_order_and_case() {
        let a = StreamKey::new("/retro/abc123.3gp", "transport=tcp").unwrap();
        let b = StreamKey::new("/RETRO/abc123.3gp/", "transport=TCP&").unwrap();
        let c = StreamKey::new("retro/abc123", "").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "/retro/abc123?transport=tcp");
        assert_eq!(c.to_string(), "/retro/abc123");

        let x = StreamKey::new("/edge/v.3gp", "start=30&b=2&a=1").unwrap();
        let y = StreamKey::new("/Edge/v.3GP", "a=1&start=30&b=2&a=1").unwrap();
        assert_eq!(x, y);
        assert_eq!(x.query(), "a=1&b=2&start=30");
    }

    #[test]
    fn single_segment_defaults_to_retro() {
        let request = parse_request("/abc123.3gp", "", None).unwrap();
        assert_eq!(request.profile, Profile::Retro);
        assert_eq!(request.video_id, "abc123");
        assert_eq!(request.key.path(), "/retro/abc123");
    }

    #[test]
    fn request_carries_start_and_transport() {
        let request = parse_request(
            "/android/Xy_9.3gp",
            "t=1:30&rtsp_transport=UDP",
            Some(RtspTransport::Tcp),
        )
        .unwrap();
        assert_eq!(request.profile, Profile::Android);
        assert_eq!(request.video_id, "Xy_9");
        assert_eq!(request.start, 90.0);
        assert_eq!(request.transport, Some(RtspTransport::Udp));
        assert_eq!(start_from_query("start=1:-30"), None);
        let negative = parse_request("/retro/a", "start=1:-30", None).unwrap();
        assert_eq!(negative.start, 0.0);

        let auto = parse_request("/retro/a", "transport=auto", Some(RtspTransport::Tcp)).unwrap();
        assert_eq!(auto.transport, None);
        let bogus = parse_request("/retro/a", "transport=carrier-pigeon", Some(RtspTransport::Tcp))
            .unwrap();
        assert_eq!(bogus.transport, Some(RtspTransport::Tcp));
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(matches!(
            parse_request("/", "", None),
            Err(StreamError::InvalidPath(_))
        ));
        assert!(matches!(
            parse_request("/retro/a/b", "", None),
            Err(StreamError::InvalidPath(_))
        ));
        assert!(matches!(
            parse_request("/vhs/a", "", None),
            Err(StreamError::UnknownProfile(_))
        ));
        assert!(matches!(
            parse_request("/aac/a", "", None),
            Err(StreamError::RtspUnsupported("aac"))
        ));
    }

    #[test]
    fn track_selectors_are_split_off() {
        assert_eq!(
            split_track("/retro/abc.3gp/trackID=1", ""),
            ("/retro/abc.3gp".to_string(), String::new(), Some(1))
        );
        assert_eq!(
            split_track("/retro/abc", "transport=tcp/streamid=0"),
            ("/retro/abc".to_string(), "transport=tcp".to_string(), Some(0))
        );
        assert_eq!(
            split_track("/retro/abc", "start=5"),
            ("/retro/abc".to_string(), "start=5".to_string(), None)
        );
    }

    #[test]
    fn npt_ranges() {
        assert_eq!(range_start("npt=30-").unwrap(), Some(30.0));
        assert_eq!(range_start("npt=30.2-60").unwrap(), Some(30.2));
        assert_eq!(range_start("npt=00:01:30.5-").unwrap(), Some(90.5));
        assert_eq!(range_start("npt=now-").unwrap(), None);
        assert_eq!(range_start("npt=-60").unwrap(), None);
        assert_eq!(range_start("clock=20240101T000000Z-").unwrap(), None);
        assert!(matches!(
            range_start("npt=abc-"),
            Err(StreamError::InvalidRange(_))
        ));
        assert!(matches!(range_start("npt=-"), Err(StreamError::InvalidRange(_))));
        assert!(matches!(range_start("garbage"), Err(StreamError::InvalidRange(_))));
    }

    #[test]
    fn npt_start_reads_typed_ranges() {
        let range = Range::Npt(NptRange::FromTo(
            NptTime::Hms(1, 2, 3, Some(250_000_000)),
            NptTime::Seconds(4000, None),
        ));
        assert_eq!(npt_start(&range).unwrap(), Some(3723.25));
        assert_eq!(npt_start(&Range::Npt(NptRange::Empty)).unwrap(), None);
    }

    #[test]
    fn public_urls() {
        assert_eq!(
            public_url("tv.local:8080", 8554, Profile::Edge, "abc", 0.0, None),
            "rtsp://tv.local:8554/edge/abc.3gp"
        );
        assert_eq!(
            public_url("", 8554, Profile::Aac, "abc", 42.7, Some(RtspTransport::Udp)),
            "rtsp://localhost:8554/retro/abc.3gp?start=42&transport=udp"
        );
        assert_eq!(strip_port("[::1]:8554"), "[::1]");
        assert_eq!(strip_port("10.0.0.2"), "10.0.0.2");
    }
}
