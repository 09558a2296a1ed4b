use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use retrocast_core::config::normalize_address;
use retrocast_core::{
    compose_args, load_config, parse_time_spec, public_url, resolver, router, DirectTranscoder,
    EncodeTarget, EncoderLauncher, EncoderSettings, EngineParts, FfmpegLauncher, HttpState,
    InputAcquirer, Profile, RetrocastConfig, RtspServer, RtspTransport,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] retrocast_core::ConfigError),
    #[error("rtsp server error: {0}")]
    Rtsp(#[from] retrocast_core::RtspServerError),
    #[error("input error: {0}")]
    Input(#[from] retrocast_core::InputError),
    #[error("stream error: {0}")]
    Stream(#[from] retrocast_core::StreamError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Retrocast legacy-device streaming control", long_about = None)]
pub struct Cli {
    /// Path to retrocast.toml
    #[arg(long, default_value = "configs/retrocast.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the RTSP server and the HTTP transcode endpoint until interrupted
    Serve,
    /// Prints the RTSP URL a legacy player should open
    Url(UrlArgs),
    /// Prints the encoder arguments for a source URL
    Args(ArgsArgs),
    /// Lists the output profiles
    Profiles,
}

#[derive(Args, Debug)]
pub struct UrlArgs {
    /// Video identifier understood by the resolver
    pub video_id: String,
    #[arg(long, default_value = "retro")]
    pub profile: Profile,
    /// Host players use to reach the server
    #[arg(long, default_value = "localhost")]
    pub host: String,
    /// Start offset in seconds or as a clock, e.g. `90` or `1:30`
    #[arg(long)]
    pub start: Option<String>,
    /// tcp, udp, udp_multicast or auto
    #[arg(long)]
    pub transport: Option<String>,
}

#[derive(Args, Debug)]
pub struct ArgsArgs {
    /// Upstream media URL
    pub source: String,
    #[arg(long, default_value = "retro")]
    pub profile: Profile,
    #[arg(long)]
    pub start: Option<String>,
    /// Publish to this RTSP URL instead of writing to stdout
    #[arg(long)]
    pub rtsp: Option<String>,
    #[arg(long)]
    pub transport: Option<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Serve => {
            let config = load_config(&cli.config)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config))?;
        }
        Commands::Url(args) => {
            let config = load_config(&cli.config)?;
            let url = stream_url(&config, args)?;
            render(&url, cli.format)?;
        }
        Commands::Args(args) => {
            let config = load_config(&cli.config)?;
            let runtime = tokio::runtime::Runtime::new()?;
            let listing = runtime.block_on(encoder_args(&config, args))?;
            render(&listing, cli.format)?;
        }
        Commands::Profiles => {
            render(&profile_catalog(), cli.format)?;
        }
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

async fn serve(config: RetrocastConfig) -> Result<()> {
    let stream_resolver = resolver::from_config(&config.resolver).ok_or_else(|| {
        AppError::MissingResource("resolver.command or resolver.url_template".into())
    })?;
    let launcher: Arc<dyn EncoderLauncher> =
        Arc::new(FfmpegLauncher::new(config.encoder.binary.clone()));
    let acquirer = InputAcquirer::new(&config.upstream)?;
    let settings = EncoderSettings::from(&config.encoder);
    let (stop_tx, stop_rx) = watch::channel(false);

    let rtsp = if config.rtsp.enabled {
        let server = RtspServer::bind(
            &config.rtsp,
            EngineParts {
                resolver: Arc::clone(&stream_resolver),
                launcher: Arc::clone(&launcher),
                acquirer: acquirer.clone(),
                settings: settings.clone(),
            },
        )
        .await?;
        info!(address = %server.local_addr(), "rtsp server listening");
        let token = server.shutdown_token();
        Some((token, tokio::spawn(server.run())))
    } else {
        warn!("rtsp server disabled by configuration");
        None
    };

    let app = router(HttpState {
        resolver: stream_resolver,
        transcoder: DirectTranscoder::new(launcher, acquirer, settings),
        resolve_timeout: config.rtsp.resolve_timeout(),
    });
    let listener = tokio::net::TcpListener::bind(http_bind_address(&config)).await?;
    info!(address = %listener.local_addr()?, "http transcode endpoint listening");
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_stop(stop_rx))
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = stop_tx.send(true);
    if let Some((token, task)) = rtsp {
        token.cancel();
        task.await??;
    }
    http.await??;
    Ok(())
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn parse_transport(raw: Option<&str>) -> Result<Option<RtspTransport>> {
    match raw {
        Some(raw) => {
            RtspTransport::parse(raw).map_err(|err| AppError::InvalidArgument(err.to_string()))
        }
        None => Ok(None),
    }
}

fn parse_start(raw: Option<&str>) -> Result<f64> {
    match raw {
        Some(raw) => parse_time_spec(raw)
            .ok_or_else(|| AppError::InvalidArgument(format!("unparseable start {raw:?}"))),
        None => Ok(0.0),
    }
}

/// `:8080` style addresses bind every interface, as for the RTSP listener.
fn http_bind_address(config: &RetrocastConfig) -> String {
    normalize_address(&config.http.address)
}

fn listen_port(address: &str) -> u16 {
    address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(8554)
}

#[derive(Debug, Serialize)]
pub struct StreamUrl {
    pub video_id: String,
    pub profile: Profile,
    pub start: f64,
    pub url: String,
}

impl DisplayFallback for StreamUrl {
    fn display(&self) -> String {
        self.url.clone()
    }
}

fn stream_url(config: &RetrocastConfig, args: &UrlArgs) -> Result<StreamUrl> {
    let spec = args.profile.spec();
    if !spec.rtsp_capable {
        return Err(retrocast_core::StreamError::RtspUnsupported(spec.profile.as_str()).into());
    }
    let start = parse_start(args.start.as_deref())?;
    let transport = match parse_transport(args.transport.as_deref())? {
        Some(transport) => Some(transport),
        None => config.rtsp.default_transport(),
    };
    let url = public_url(
        &args.host,
        listen_port(&config.rtsp.address),
        args.profile,
        &args.video_id,
        start,
        transport,
    );
    Ok(StreamUrl {
        video_id: args.video_id.clone(),
        profile: args.profile,
        start,
        url,
    })
}

#[derive(Debug, Serialize)]
pub struct EncoderArgs {
    pub binary: String,
    pub args: Vec<String>,
}

impl DisplayFallback for EncoderArgs {
    fn display(&self) -> String {
        let mut line = self.binary.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push_str(&format!("{arg:?}"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

async fn encoder_args(config: &RetrocastConfig, args: &ArgsArgs) -> Result<EncoderArgs> {
    let settings = EncoderSettings::from(&config.encoder);
    let start = parse_start(args.start.as_deref())?;
    let target = match &args.rtsp {
        Some(url) => EncodeTarget::Rtsp {
            url: url.clone(),
            transport: parse_transport(args.transport.as_deref())?
                .or_else(|| config.rtsp.default_transport())
                .unwrap_or(RtspTransport::Tcp),
        },
        None => EncodeTarget::Stdout,
    };
    let acquirer = InputAcquirer::new(&config.upstream)?;
    // A proxied input binds a loopback port; it is released when `_release` drops.
    let (input, _release) = acquirer.build_input(&args.source, start).await?;
    let composed = compose_args(&settings, args.profile.spec(), &input, &target)?;
    Ok(EncoderArgs {
        binary: settings.binary,
        args: composed,
    })
}

#[derive(Debug, Serialize)]
pub struct ProfileEntry {
    pub profile: Profile,
    pub video: String,
    pub audio: String,
    pub container: &'static str,
    pub content_type: &'static str,
    pub rtsp: bool,
}

impl DisplayFallback for Vec<ProfileEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "{profile:<8} {video:<28} {audio:<20} {container:<5} {content_type}{rtsp}",
                    profile = entry.profile.as_str(),
                    video = entry.video,
                    audio = entry.audio,
                    container = entry.container,
                    content_type = entry.content_type,
                    rtsp = if entry.rtsp { " (rtsp)" } else { "" },
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn profile_catalog() -> Vec<ProfileEntry> {
    Profile::ALL
        .iter()
        .map(|profile| {
            let spec = profile.spec();
            ProfileEntry {
                profile: *profile,
                video: format!(
                    "{} {}x{}@{} {}",
                    spec.video.codec,
                    spec.video.width,
                    spec.video.height,
                    spec.video.fps,
                    spec.video.bitrate
                ),
                audio: format!(
                    "{} {}Hz/{}ch {}",
                    spec.audio.codec, spec.audio.sample_rate, spec.audio.channels, spec.audio.bitrate
                ),
                container: spec.container.format,
                content_type: spec.output.content_type,
                rtsp: spec.rtsp_capable,
            }
        })
        .collect()
}
