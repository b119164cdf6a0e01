//! Plugin capability surface and the live instances the orchestrator owns.
//!
//! A plugin advertises its capabilities explicitly:
//! - named handlers via [`Plugin::handlers`] (the candle handler makes it a
//!   stream consumer),
//! - a finalize hook via [`Plugin::finalizer`],
//! - event emission via the descriptor's `emits` flag, in which case the
//!   loader hands it an [`Emitter`] through the [`PluginContext`].
//!
//! Capabilities are captured once at load time on the [`PluginInstance`];
//! wiring never inspects the plugin object by name.

pub mod loader;

use std::fmt;
use std::sync::{Arc, Mutex, TryLockError};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Mode, PluginSection};
use crate::error::DeliveryError;
use crate::events::{Emitter, Event, Listener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handler {
    #[serde(rename = "processCandle")]
    Candle,
    #[serde(rename = "processTrade")]
    Trade,
    #[serde(rename = "processAdvice")]
    Advice,
    #[serde(rename = "processPortfolioUpdate")]
    PortfolioUpdate,
    #[serde(rename = "processRoundtrip")]
    Roundtrip,
    #[serde(rename = "processPerformanceReport")]
    PerformanceReport,
}

impl Handler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Candle => "processCandle",
            Handler::Trade => "processTrade",
            Handler::Advice => "processAdvice",
            Handler::PortfolioUpdate => "processPortfolioUpdate",
            Handler::Roundtrip => "processRoundtrip",
            Handler::PerformanceReport => "processPerformanceReport",
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity shared by a descriptor and the instance built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMeta {
    pub slug: String,
    pub name: String,
    pub description: String,
}

pub trait Plugin: Send {
    /// Handlers this plugin exposes. Read once when the plugin is loaded.
    fn handlers(&self) -> &'static [Handler] {
        &[]
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        let _ = event;
        bail!("{} is not implemented", handler)
    }

    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        None
    }
}

/// One-time hook run after the candle stream has drained.
pub trait Finalizer {
    fn finalize(&mut self) -> Result<()>;
}

/// Everything a factory gets to build its plugin.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub meta: PluginMeta,
    pub mode: Mode,
    pub settings: PluginSection,
    /// Present iff the descriptor declares `emits`.
    pub emitter: Option<Arc<Emitter>>,
}

impl PluginContext {
    pub fn emitter(&self) -> Result<Arc<Emitter>> {
        self.emitter
            .clone()
            .ok_or_else(|| anyhow!("{} is not declared as an emitter", self.meta.slug))
    }
}

#[async_trait]
pub trait PluginFactory: Send + Sync {
    async fn create(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>>;
}

struct FnFactory<F>(F);

#[async_trait]
impl<F> PluginFactory for FnFactory<F>
where
    F: Fn(PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync,
{
    async fn create(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous constructor as a factory.
pub fn factory_fn<F>(f: F) -> Arc<dyn PluginFactory>
where
    F: Fn(PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
{
    Arc::new(FnFactory(f))
}

/// Static catalog entry describing a plugin the system knows about.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub meta: PluginMeta,
    pub emits: bool,
    pub modes: Vec<Mode>,
    pub factory: Arc<dyn PluginFactory>,
}

impl PluginDescriptor {
    pub fn new(slug: &str, name: &str, factory: Arc<dyn PluginFactory>) -> Self {
        Self {
            meta: PluginMeta {
                slug: slug.to_string(),
                name: name.to_string(),
                description: String::new(),
            },
            emits: false,
            modes: vec![Mode::Backtest, Mode::Realtime],
            factory,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.meta.description = description.to_string();
        self
    }

    pub fn emits(mut self) -> Self {
        self.emits = true;
        self
    }

    pub fn modes(mut self, modes: &[Mode]) -> Self {
        self.modes = modes.to_vec();
        self
    }

    pub fn supports(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("meta", &self.meta)
            .field("emits", &self.emits)
            .field("modes", &self.modes)
            .finish()
    }
}

pub type PluginHandle = Arc<Mutex<Box<dyn Plugin>>>;

/// A loaded plugin plus the capabilities captured when it was built.
#[derive(Clone)]
pub struct PluginInstance {
    meta: PluginMeta,
    handlers: Vec<Handler>,
    finalizes: bool,
    emitter: Option<Arc<Emitter>>,
    plugin: PluginHandle,
}

impl PluginInstance {
    pub fn new(meta: PluginMeta, mut plugin: Box<dyn Plugin>, emitter: Option<Arc<Emitter>>) -> Self {
        let handlers = plugin.handlers().to_vec();
        let finalizes = plugin.finalizer().is_some();
        Self {
            meta,
            handlers,
            finalizes,
            emitter,
            plugin: Arc::new(Mutex::new(plugin)),
        }
    }

    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    pub fn slug(&self) -> &str {
        &self.meta.slug
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn emits(&self) -> bool {
        self.emitter.is_some()
    }

    pub fn emitter(&self) -> Option<&Arc<Emitter>> {
        self.emitter.as_ref()
    }

    pub fn exposes(&self, handler: Handler) -> bool {
        self.handlers.contains(&handler)
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizes
    }

    pub fn deliver(&self, handler: Handler, event: &Event) -> Result<(), DeliveryError> {
        let mut plugin = self.lock()?;
        plugin.handle(handler, event).map_err(|cause| DeliveryError::Handler {
            slug: self.meta.slug.clone(),
            handler,
            cause,
        })
    }

    /// Run the finalize hook, if the plugin has one.
    pub fn finalize(&self) -> Result<(), DeliveryError> {
        let mut plugin = self.lock()?;
        match plugin.finalizer() {
            Some(hook) => hook.finalize().map_err(|cause| DeliveryError::Finalize {
                slug: self.meta.slug.clone(),
                cause,
            }),
            None => Ok(()),
        }
    }

    /// A listener that routes events into `handler` on this instance.
    pub fn listener(&self, handler: Handler) -> Listener {
        let target = self.clone();
        Arc::new(move |event: &Event| target.deliver(handler, event))
    }

    // Delivery is single-threaded, so a held lock means a subscription cycle.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn Plugin>>, DeliveryError> {
        match self.plugin.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(DeliveryError::Reentrant { slug: self.meta.slug.clone() }),
            Err(TryLockError::Poisoned(_)) => Err(DeliveryError::Poisoned { slug: self.meta.slug.clone() }),
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("meta", &self.meta)
            .field("handlers", &self.handlers)
            .field("finalizes", &self.finalizes)
            .field("emits", &self.emits())
            .finish()
    }
}
