pub mod config;
pub mod encoder;
pub mod error;
pub mod http;
pub mod input;
pub mod profile;
pub mod resolver;
pub mod rtsp;
pub mod session;
pub mod timespec;

pub use config::{
    load_config, EncoderSection, HttpSection, ResolverSection, RetrocastConfig, RtspSection,
    SecureInput, UpstreamSection,
};
pub use encoder::{
    compose_args, EncodeTarget, EncoderExit, EncoderHandle, EncoderLauncher, EncoderProcess,
    EncoderSettings, FfmpegLauncher, LaunchRequest,
};
pub use error::{ConfigError, Result, StreamError, StreamResult};
pub use http::{profile_from_query, router, start_from_query, DirectTranscoder, HttpState};
pub use input::{choose_input_mode, InputAcquirer, InputDescriptor, InputError, InputMode, InputRelease};
pub use profile::{profile_segment, resolve, OutputFormat, Profile, ProfileSpec};
pub use resolver::{
    CommandResolver, ResolveError, ResolverFn, StreamResolver, TemplateResolver,
};
pub use rtsp::{
    public_url, EngineParts, MediaDescription, MediaHub, RtspServer, RtspServerError,
    RtspTransport, StreamKey, StreamRequest,
};
pub use session::{
    GateSignal, PublisherId, SessionContext, SessionOptions, SessionRegistry, SessionSnapshot,
    StreamSession,
};
pub use timespec::{clamp_offset, format_offset, parse_time_spec};
