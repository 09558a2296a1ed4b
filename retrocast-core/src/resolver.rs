use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ResolverSection;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("stream not available for {0}")]
    NotAvailable(String),
    #[error("resolver command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Turns a video identifier into a playable upstream URL.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, video_id: &str) -> Result<String, ResolveError>;
}

type BoxedResolve =
    Pin<Box<dyn Future<Output = Result<String, ResolveError>> + Send + 'static>>;

/// Adapts a closure returning a future into a [`StreamResolver`].
pub struct ResolverFn {
    inner: Box<dyn Fn(String) -> BoxedResolve + Send + Sync>,
}

impl ResolverFn {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ResolveError>> + Send + 'static,
    {
        Self {
            inner: Box::new(move |id| Box::pin(func(id))),
        }
    }
}

impl fmt::Debug for ResolverFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamResolver for ResolverFn {
    async fn resolve(&self, video_id: &str) -> Result<String, ResolveError> {
        (self.inner)(video_id.to_string()).await
    }
}

/// Formats a fixed URL template, replacing `{id}`.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    template: String,
}

impl TemplateResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl StreamResolver for TemplateResolver {
    async fn resolve(&self, video_id: &str) -> Result<String, ResolveError> {
        Ok(self.template.replace("{id}", video_id))
    }
}

/// Runs an external metadata tool and reads the URL from the first non-empty
/// line of its standard output.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
}

impl CommandResolver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render(&self, video_id: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{id}", video_id))
            .collect()
    }
}

#[async_trait]
impl StreamResolver for CommandResolver {
    async fn resolve(&self, video_id: &str) -> Result<String, ResolveError> {
        let args = self.render(video_id);
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = command.output().await?;
        if !output.status.success() {
            return Err(ResolveError::CommandFailure {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ResolveError::NotAvailable(video_id.to_string()))
    }
}

/// Builds the resolver described by the `[resolver]` config section.
pub fn from_config(section: &ResolverSection) -> Option<Arc<dyn StreamResolver>> {
    if let Some((program, args)) = section.command.split_first() {
        return Some(Arc::new(CommandResolver::new(program.clone(), args.to_vec())));
    }
    section
        .url_template
        .as_ref()
        .map(|template| Arc::new(TemplateResolver::new(template.clone())) as Arc<dyn StreamResolver>)
}
