use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::{ConfigError, Result};
use crate::profile::DEFAULT_RETRO_FILTER;
use crate::rtsp::RtspTransport;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";
pub const DEFAULT_REFERER: &str = "https://www.youtube.com/";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrocastConfig {
    pub encoder: EncoderSection,
    pub upstream: UpstreamSection,
    pub resolver: ResolverSection,
    pub rtsp: RtspSection,
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub binary: String,
    pub log_level: String,
    /// `"default"` selects the built-in retro look, `"off"` disables.
    pub extra_filter: Option<String>,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".into(),
            log_level: "warning".into(),
            extra_filter: None,
        }
    }
}

impl EncoderSection {
    pub fn effective_filter(&self) -> Option<String> {
        let raw = self.extra_filter.as_deref()?.trim();
        match raw.to_ascii_lowercase().as_str() {
            "" | "off" | "false" | "0" | "disable" => None,
            "default" => Some(DEFAULT_RETRO_FILTER.to_string()),
            _ => Some(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureInput {
    Proxy,
    Pipe,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub user_agent: String,
    pub referer: String,
    pub secure_input: SecureInput,
    pub connect_timeout_seconds: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.into(),
            referer: DEFAULT_REFERER.into(),
            secure_input: SecureInput::Proxy,
            connect_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    /// Program and arguments; `{id}` is replaced with the video id.
    pub command: Vec<String>,
    pub url_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtspSection {
    pub enabled: bool,
    pub address: String,
    pub transport: Option<String>,
    pub udp_rtp_address: Option<String>,
    pub udp_rtcp_address: Option<String>,
    pub publisher_timeout_seconds: u64,
    pub resolve_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub seek_tolerance_seconds: f64,
}

impl Default for RtspSection {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0:8554".into(),
            transport: None,
            udp_rtp_address: None,
            udp_rtcp_address: None,
            publisher_timeout_seconds: 12,
            resolve_timeout_seconds: 15,
            read_timeout_seconds: 10,
            seek_tolerance_seconds: 0.5,
        }
    }
}

impl RtspSection {
    pub fn publisher_timeout(&self) -> Duration {
        Duration::from_secs(self.publisher_timeout_seconds)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// Server-wide transport preference. `auto` and unknown values mean none.
    pub fn default_transport(&self) -> Option<RtspTransport> {
        let raw = self.transport.as_deref()?;
        match RtspTransport::parse(raw) {
            Ok(transport) => transport,
            Err(_) => {
                warn!(transport = raw, "ignoring unsupported rtsp transport");
                None
            }
        }
    }

    pub fn udp_enabled(&self) -> bool {
        self.udp_rtp_address.is_some() && self.udp_rtcp_address.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub address: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8090".into(),
        }
    }
}

impl RetrocastConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `RETROCAST_*` overrides. Takes a lookup so tests need not touch
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(addr) = get("RETROCAST_RTSP_ADDR") {
            self.rtsp.address = normalize_address(&addr);
        }
        if let Some(transport) = get("RETROCAST_RTSP_TRANSPORT") {
            self.rtsp.transport = Some(transport);
        }
        let rtp = get("RETROCAST_RTSP_UDP_RTP");
        let rtcp = get("RETROCAST_RTSP_UDP_RTCP");
        if rtp.is_some() || rtcp.is_some() {
            self.rtsp.udp_rtp_address = rtp.map(|value| normalize_address(&value));
            self.rtsp.udp_rtcp_address = rtcp.map(|value| normalize_address(&value));
        }
        if let Some(filter) = get("RETROCAST_EXTRA_FILTER") {
            self.encoder.extra_filter = Some(filter);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.encoder.binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "encoder.binary",
                value: self.encoder.binary.clone(),
            });
        }
        if !(self.rtsp.seek_tolerance_seconds >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "rtsp.seek_tolerance_seconds",
                value: self.rtsp.seek_tolerance_seconds.to_string(),
            });
        }
        if self.rtsp.udp_rtp_address.is_some() != self.rtsp.udp_rtcp_address.is_some() {
            return Err(ConfigError::Invalid {
                field: "rtsp.udp_rtcp_address",
                value: "udp rtp and rtcp addresses must be set together".into(),
            });
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RetrocastConfig> {
    RetrocastConfig::load(path)
}

/// Accepts the `:8554` shorthand for "all interfaces".
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
