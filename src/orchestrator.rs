//! Top-level control flow: load plugins, index emitters, wire subscriptions,
//! then hand the candle consumers to the stream.

use anyhow::Result;
use serde_json::json;

use crate::config::{Mode, PluginSettings};
use crate::error::PluginLoadError;
use crate::logging::{self, obj, v_str, Domain};
use crate::market::CandleSource;
use crate::plugin::loader::load_plugins;
use crate::plugin::{PluginDescriptor, PluginInstance};
use crate::router::{subscribe_plugins, ConsumerList, EmitterRegistry, RoutingReport, SubscriptionRule};
use crate::stream::{CandleStream, PipelineStats, StreamOptions};

pub struct Orchestrator {
    mode: Mode,
    plugins: Vec<PluginInstance>,
    emitters: EmitterRegistry,
    consumers: ConsumerList,
    report: RoutingReport,
    options: StreamOptions,
}

impl Orchestrator {
    /// Load and wire everything. Nothing is streamed yet.
    pub async fn setup(
        descriptors: &[PluginDescriptor],
        settings: &PluginSettings,
        rules: &[SubscriptionRule],
        mode: Mode,
        options: StreamOptions,
    ) -> Result<Self, PluginLoadError> {
        let plugins = load_plugins(descriptors, settings, mode).await?;
        let emitters = EmitterRegistry::from_plugins(&plugins);
        let (consumers, report) = subscribe_plugins(&plugins, &emitters, rules);

        logging::info(
            Domain::System,
            "orchestrator.ready",
            obj(&[
                ("mode", v_str(mode.as_str())),
                ("plugins", json!(plugins.iter().map(|p| p.slug()).collect::<Vec<_>>())),
                ("emitters", json!(emitters.len())),
                ("candle_consumers", json!(consumers.slugs())),
                ("unresolved", json!(report.unresolved.len())),
            ]),
        );

        Ok(Self { mode, plugins, emitters, consumers, report, options })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn plugins(&self) -> &[PluginInstance] {
        &self.plugins
    }

    pub fn emitters(&self) -> &EmitterRegistry {
        &self.emitters
    }

    pub fn consumers(&self) -> &ConsumerList {
        &self.consumers
    }

    pub fn report(&self) -> &RoutingReport {
        &self.report
    }

    /// Stream `source` through the consumers until it ends.
    pub async fn run<S>(self, source: &mut S) -> Result<PipelineStats>
    where
        S: CandleSource + ?Sized,
    {
        if self.consumers.is_empty() {
            logging::warn(
                Domain::Pipeline,
                "stream.no_consumers",
                obj(&[("mode", v_str(self.mode.as_str()))]),
            );
        }
        CandleStream::new(self.consumers, self.options).run(source).await
    }
}
