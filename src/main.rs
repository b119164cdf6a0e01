use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use serde_json::{json, Value};

use candleflow::catalog::{default_descriptors, default_subscriptions};
use candleflow::config::{Config, Mode, PluginSettings};
use candleflow::error::PluginLoadError;
use candleflow::logging::{self, obj, v_str, Domain, Level};
use candleflow::market::build_source;
use candleflow::orchestrator::Orchestrator;
use candleflow::plugins::candle_writer;
use candleflow::router::load_subscriptions;
use candleflow::stream::StreamOptions;

/// The candle writer records to the configured store unless its section
/// names a path of its own.
fn apply_store_path(settings: &mut PluginSettings, cfg: &Config) {
    if let Some(section) = settings.section(candle_writer::SLUG) {
        if !section.options.contains_key("path") {
            let mut section = section.clone();
            section.options.insert("path".to_string(), Value::String(cfg.sqlite_path.clone()));
            settings.set(candle_writer::SLUG, section);
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    let mut settings = cfg.plugin_settings()?;
    apply_store_path(&mut settings, &cfg);
    let rules = match &cfg.subscriptions_path {
        Some(path) => load_subscriptions(Path::new(path))?,
        None => default_subscriptions(),
    };
    let options = StreamOptions { halt_on_consumer_error: cfg.halt_on_consumer_error };

    let orchestrator = Orchestrator::setup(&default_descriptors(), &settings, &rules, cfg.mode, options).await?;
    let mut source = build_source(&cfg)?;
    let stats = orchestrator.run(source.as_mut()).await?;

    logging::info(
        Domain::System,
        "run.complete",
        obj(&[
            ("mode", v_str(cfg.mode.as_str())),
            ("candles", json!(stats.candles)),
            ("failures", json!(stats.failures)),
            ("finalize_failures", json!(stats.finalize_failures)),
            ("last_ts", json!(stats.last_ts)),
        ]),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::info(
        Domain::System,
        "startup",
        obj(&[
            ("name", v_str(env!("CARGO_PKG_NAME"))),
            ("version", v_str(env!("CARGO_PKG_VERSION"))),
        ]),
    );

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            logging::log(Level::Fatal, Domain::System, "config.invalid", obj(&[("msg", v_str(&format!("{err:#}")))]));
            return ExitCode::FAILURE;
        }
    };
    if cfg.mode == Mode::Realtime {
        logging::info(
            Domain::System,
            "realtime",
            obj(&[("symbol", v_str(&cfg.symbol)), ("candle_secs", json!(cfg.candle_secs))]),
        );
    }

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let mut fields = obj(&[("msg", v_str(&format!("{err:#}")))]);
            let event = match err.downcast_ref::<PluginLoadError>() {
                Some(load) => {
                    fields.insert("plugin".to_string(), v_str(load.slug()));
                    "plugin.load_failed"
                }
                None => "run.failed",
            };
            logging::log(Level::Fatal, Domain::System, event, fields);
            eprintln!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
