use thiserror::Error;

use crate::config::Mode;
use crate::plugin::Handler;

/// A descriptor could not be turned into a live plugin. Fatal at startup.
#[derive(Debug, Error)]
pub enum PluginLoadError {
    #[error("plugin {name} ({slug}) does not support {mode} mode")]
    UnsupportedMode {
        slug: String,
        name: String,
        mode: Mode,
    },
    #[error("plugin {name} ({slug}) failed to initialize: {cause:#}")]
    Init {
        slug: String,
        name: String,
        cause: anyhow::Error,
    },
}

impl PluginLoadError {
    pub fn slug(&self) -> &str {
        match self {
            PluginLoadError::UnsupportedMode { slug, .. } | PluginLoadError::Init { slug, .. } => slug,
        }
    }
}

/// A consumer or listener failed while handling a candle or an event.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{slug} is already handling an event (subscription cycle)")]
    Reentrant { slug: String },
    #[error("{slug} is unusable after a previous panic")]
    Poisoned { slug: String },
    #[error("{slug} failed in {handler}: {cause:#}")]
    Handler {
        slug: String,
        handler: Handler,
        cause: anyhow::Error,
    },
    #[error("{slug} failed to finalize: {cause:#}")]
    Finalize {
        slug: String,
        cause: anyhow::Error,
    },
}

/// A rule names an emitter that is absent or disabled. Logged, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedSubscription {
    pub listener: String,
    pub emitter: String,
    /// Event name as written in the table.
    pub event: String,
}

impl std::fmt::Display for UnresolvedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} wanted to listen to the {}, however the {} is disabled.",
            self.listener, self.emitter, self.emitter
        )
    }
}
