use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Video filter appended to the base chain when the operator asks for the
/// built-in look: slight desaturation and grain, like a cheap phone sensor.
pub const DEFAULT_RETRO_FILTER: &str = "eq=saturation=0.85:contrast=1.05,noise=alls=6:allf=t";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Retro,
    Edge,
    Aac,
    Mp3,
    Android,
}

impl Profile {
    pub const ALL: [Profile; 5] = [
        Profile::Retro,
        Profile::Edge,
        Profile::Aac,
        Profile::Mp3,
        Profile::Android,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Retro => "retro",
            Profile::Edge => "edge",
            Profile::Aac => "aac",
            Profile::Mp3 => "mp3",
            Profile::Android => "android",
        }
    }

    /// Parses a profile identifier. The empty string selects retro.
    pub fn parse(value: &str) -> Result<Self, StreamError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "retro" => Ok(Profile::Retro),
            "edge" => Ok(Profile::Edge),
            "aac" => Ok(Profile::Aac),
            "mp3" => Ok(Profile::Mp3),
            "android" => Ok(Profile::Android),
            other => Err(StreamError::UnknownProfile(other.to_string())),
        }
    }

    pub fn spec(&self) -> &'static ProfileSpec {
        match self {
            Profile::Retro => &RETRO,
            Profile::Edge => &EDGE,
            Profile::Aac => &AAC,
            Profile::Mp3 => &MP3,
            Profile::Android => &ANDROID,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Profile::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: &'static str,
    pub bitrate: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpec {
    pub codec: &'static str,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub format: &'static str,
    /// Muxer flags placed before `-f` for file-style output.
    pub mux_flags: &'static [&'static str],
}

/// Content-type and naming metadata for direct HTTP output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFormat {
    pub content_type: &'static str,
    pub extension: &'static str,
    pub suffix: &'static str,
}

impl OutputFormat {
    pub fn file_name(&self, video_id: &str) -> String {
        format!("{}{}.{}", video_id, self.suffix, self.extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    pub profile: Profile,
    pub video: VideoSpec,
    pub audio: AudioSpec,
    pub container: ContainerSpec,
    pub output: OutputFormat,
    pub rtsp_capable: bool,
}

const GSM_3GP_FLAGS: &[&str] = &[
    "-use_editlist",
    "0",
    "-movflags",
    "+faststart+frag_keyframe+empty_moov",
];

static RETRO: ProfileSpec = ProfileSpec {
    profile: Profile::Retro,
    video: VideoSpec {
        width: 176,
        height: 144,
        fps: 12,
        codec: "h263",
        bitrate: "120k",
    },
    audio: AudioSpec {
        codec: "libopencore_amrnb",
        sample_rate: 8000,
        channels: 1,
        bitrate: "12.2k",
    },
    container: ContainerSpec {
        format: "3gp",
        mux_flags: GSM_3GP_FLAGS,
    },
    output: OutputFormat {
        content_type: "video/3gpp",
        extension: "3gp",
        suffix: "_retro",
    },
    rtsp_capable: true,
};

static EDGE: ProfileSpec = ProfileSpec {
    profile: Profile::Edge,
    video: VideoSpec {
        width: 128,
        height: 96,
        fps: 10,
        codec: "h263",
        bitrate: "60k",
    },
    audio: AudioSpec {
        codec: "libopencore_amrnb",
        sample_rate: 8000,
        channels: 1,
        bitrate: "10.2k",
    },
    container: ContainerSpec {
        format: "3gp",
        mux_flags: GSM_3GP_FLAGS,
    },
    output: OutputFormat {
        content_type: "video/3gpp",
        extension: "3gp",
        suffix: "_edge",
    },
    rtsp_capable: true,
};

static AAC: ProfileSpec = ProfileSpec {
    profile: Profile::Aac,
    video: VideoSpec {
        width: 320,
        height: 240,
        fps: 15,
        codec: "mpeg4",
        bitrate: "256k",
    },
    audio: AudioSpec {
        codec: "aac",
        sample_rate: 16000,
        channels: 1,
        bitrate: "32k",
    },
    container: ContainerSpec {
        format: "mp4",
        mux_flags: &["-movflags", "frag_keyframe+empty_moov"],
    },
    output: OutputFormat {
        content_type: "video/mp4",
        extension: "mp4",
        suffix: "_aac",
    },
    rtsp_capable: false,
};

static MP3: ProfileSpec = ProfileSpec {
    profile: Profile::Mp3,
    video: VideoSpec {
        width: 176,
        height: 144,
        fps: 12,
        codec: "mpeg4",
        bitrate: "120k",
    },
    audio: AudioSpec {
        codec: "libmp3lame",
        sample_rate: 11025,
        channels: 1,
        bitrate: "24k",
    },
    container: ContainerSpec {
        format: "avi",
        mux_flags: &[],
    },
    output: OutputFormat {
        content_type: "video/x-msvideo",
        extension: "avi",
        suffix: "_mp3",
    },
    rtsp_capable: false,
};

static ANDROID: ProfileSpec = ProfileSpec {
    profile: Profile::Android,
    video: VideoSpec {
        width: 320,
        height: 240,
        fps: 15,
        codec: "mpeg4",
        bitrate: "300k",
    },
    audio: AudioSpec {
        codec: "aac",
        sample_rate: 22050,
        channels: 1,
        bitrate: "48k",
    },
    container: ContainerSpec {
        format: "mp4",
        mux_flags: &["-movflags", "frag_keyframe+empty_moov"],
    },
    output: OutputFormat {
        content_type: "video/mp4",
        extension: "mp4",
        suffix: "_android",
    },
    rtsp_capable: true,
};

impl ProfileSpec {
    /// Device filter chain, with the operator's extra filter appended.
    pub fn filter_chain(&self, extra: Option<&str>) -> String {
        let mut chain = format!(
            "scale={}:{},fps={}",
            self.video.width, self.video.height, self.video.fps
        );
        if let Some(extra) = extra.map(str::trim).filter(|value| !value.is_empty()) {
            chain.push(',');
            chain.push_str(extra);
        }
        chain
    }

    pub fn codec_args(&self) -> Vec<String> {
        let video = &self.video;
        let audio = &self.audio;
        vec![
            "-c:v".to_string(),
            video.codec.to_string(),
            "-b:v".to_string(),
            video.bitrate.to_string(),
            "-c:a".to_string(),
            audio.codec.to_string(),
            "-ar".to_string(),
            audio.sample_rate.to_string(),
            "-ac".to_string(),
            audio.channels.to_string(),
            "-b:a".to_string(),
            audio.bitrate.to_string(),
        ]
    }

    /// Arguments for writing the container to standard output.
    pub fn pipe_output_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .container
            .mux_flags
            .iter()
            .map(|token| token.to_string())
            .collect();
        args.extend(["-f", self.container.format, "pipe:1"].map(String::from));
        args
    }
}

/// Looks up the encoder template and output metadata for a profile identifier.
pub fn resolve(profile: &str) -> Result<&'static ProfileSpec, StreamError> {
    Profile::parse(profile).map(|profile| profile.spec())
}

/// Path segment used in RTSP URLs. Profiles without RTSP output map to retro.
pub fn profile_segment(profile: Profile) -> &'static str {
    match profile {
        Profile::Edge => "edge",
        Profile::Android => "android",
        _ => "retro",
    }
}
