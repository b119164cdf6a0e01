use std::sync::Arc;

use serde_json::json;

use crate::config::{Mode, PluginSettings};
use crate::error::PluginLoadError;
use crate::events::Emitter;
use crate::logging::{self, obj, v_str, Domain};

use super::{PluginContext, PluginDescriptor, PluginInstance};

/// Instantiate every enabled descriptor, one after the other.
///
/// Descriptor `i + 1` is only started once descriptor `i` (including any
/// awaiting inside its factory) has finished. The first failure aborts the
/// whole load and nothing built so far is returned. Output order equals the
/// input order of the enabled subset.
pub async fn load_plugins(
    descriptors: &[PluginDescriptor],
    settings: &PluginSettings,
    mode: Mode,
) -> Result<Vec<PluginInstance>, PluginLoadError> {
    let mut plugins = Vec::new();
    for descriptor in descriptors {
        if let Some(instance) = load_plugin(descriptor, settings, mode).await? {
            plugins.push(instance);
        }
    }
    logging::info(
        Domain::Plugin,
        "plugins.loaded",
        obj(&[
            ("count", json!(plugins.len())),
            ("known", json!(descriptors.len())),
            ("mode", v_str(mode.as_str())),
        ]),
    );
    Ok(plugins)
}

/// Build a single plugin; `Ok(None)` when it is disabled.
pub async fn load_plugin(
    descriptor: &PluginDescriptor,
    settings: &PluginSettings,
    mode: Mode,
) -> Result<Option<PluginInstance>, PluginLoadError> {
    let meta = &descriptor.meta;
    let section = match settings.section(&meta.slug) {
        Some(section) if section.enabled => section.clone(),
        _ => {
            logging::debug(
                Domain::Plugin,
                "plugin.skipped",
                obj(&[("plugin", v_str(&meta.name)), ("slug", v_str(&meta.slug))]),
            );
            return Ok(None);
        }
    };

    if !descriptor.supports(mode) {
        return Err(PluginLoadError::UnsupportedMode {
            slug: meta.slug.clone(),
            name: meta.name.clone(),
            mode,
        });
    }

    let emitter = descriptor.emits.then(|| Arc::new(Emitter::new(&meta.slug)));
    let ctx = PluginContext {
        meta: meta.clone(),
        mode,
        settings: section,
        emitter: emitter.clone(),
    };
    let plugin = descriptor
        .factory
        .create(ctx)
        .await
        .map_err(|cause| PluginLoadError::Init {
            slug: meta.slug.clone(),
            name: meta.name.clone(),
            cause,
        })?;

    let instance = PluginInstance::new(meta.clone(), plugin, emitter);
    logging::info(
        Domain::Plugin,
        "plugin.load",
        obj(&[
            ("plugin", v_str(&meta.name)),
            ("slug", v_str(&meta.slug)),
            ("description", v_str(&meta.description)),
            ("emits", json!(instance.emits())),
            (
                "handlers",
                json!(instance.handlers().iter().map(|h| h.as_str()).collect::<Vec<_>>()),
            ),
        ]),
    );
    Ok(Some(instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginSection;
    use crate::plugin::{factory_fn, Handler, Plugin, PluginFactory};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    struct Named;

    impl Plugin for Named {
        fn handlers(&self) -> &'static [Handler] {
            &[Handler::Candle]
        }
    }

    /// Records construction order; sleeps to prove the loader awaits each one.
    struct SlowFactory {
        delay_ms: u64,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl PluginFactory for SlowFactory {
        async fn create(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>> {
            self.log.lock().unwrap().push(format!("start:{}", ctx.meta.slug));
            sleep(Duration::from_millis(self.delay_ms)).await;
            self.log.lock().unwrap().push(format!("done:{}", ctx.meta.slug));
            if self.fail {
                return Err(anyhow!("missing api key"));
            }
            Ok(Box::new(Named))
        }
    }

    fn slow(slug: &str, delay_ms: u64, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> PluginDescriptor {
        PluginDescriptor::new(
            slug,
            slug,
            Arc::new(SlowFactory { delay_ms, log: log.clone(), fail }),
        )
    }

    fn enable(slugs: &[&str]) -> PluginSettings {
        let mut settings = PluginSettings::default();
        for slug in slugs {
            settings.set(slug, PluginSection::enabled());
        }
        settings
    }

    #[tokio::test]
    async fn test_load_order_matches_enabled_input_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let descriptors = vec![
            slow("a", 5, false, &log),
            slow("b", 0, false, &log),
            slow("c", 1, false, &log),
            slow("d", 0, false, &log),
        ];
        let settings = enable(&["a", "c", "d"]);
        let plugins = load_plugins(&descriptors, &settings, Mode::Backtest).await.unwrap();
        let slugs: Vec<&str> = plugins.iter().map(|p| p.slug()).collect();
        assert_eq!(slugs, vec!["a", "c", "d"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "done:a", "start:c", "done:c", "start:d", "done:d"]
        );
    }

    #[tokio::test]
    async fn test_first_failure_aborts_the_load() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let descriptors = vec![
            slow("a", 0, false, &log),
            slow("b", 0, true, &log),
            slow("c", 0, false, &log),
        ];
        let settings = enable(&["a", "b", "c"]);
        let err = load_plugins(&descriptors, &settings, Mode::Backtest).await.unwrap_err();
        assert_eq!(err.slug(), "b");
        assert!(matches!(err, PluginLoadError::Init { .. }));
        assert!(err.to_string().contains("missing api key"));
        // a and b were attempted, c never was.
        assert_eq!(*log.lock().unwrap(), vec!["start:a", "done:a", "start:b", "done:b"]);
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_fatal() {
        let descriptors = vec![PluginDescriptor::new(
            "candleWriter",
            "Candle writer",
            factory_fn(|_| Ok(Box::new(Named) as Box<dyn Plugin>)),
        )
        .modes(&[Mode::Realtime])];
        let settings = enable(&["candleWriter"]);
        let err = load_plugins(&descriptors, &settings, Mode::Backtest).await.unwrap_err();
        assert!(matches!(err, PluginLoadError::UnsupportedMode { mode: Mode::Backtest, .. }));
    }

    #[tokio::test]
    async fn test_disabled_plugin_with_unsupported_mode_is_skipped() {
        let descriptors = vec![PluginDescriptor::new(
            "candleWriter",
            "Candle writer",
            factory_fn(|_| Ok(Box::new(Named) as Box<dyn Plugin>)),
        )
        .modes(&[Mode::Realtime])];
        let plugins = load_plugins(&descriptors, &PluginSettings::default(), Mode::Backtest)
            .await
            .unwrap();
        assert!(plugins.is_empty());
    }

    #[tokio::test]
    async fn test_emitter_only_for_emitting_descriptors() {
        let descriptors = vec![
            PluginDescriptor::new("quiet", "Quiet", factory_fn(|ctx| {
                assert!(ctx.emitter.is_none());
                Ok(Box::new(Named) as Box<dyn Plugin>)
            })),
            PluginDescriptor::new("loud", "Loud", factory_fn(|ctx| {
                ctx.emitter()?;
                Ok(Box::new(Named) as Box<dyn Plugin>)
            }))
            .emits(),
        ];
        let plugins = load_plugins(&descriptors, &enable(&["quiet", "loud"]), Mode::Realtime)
            .await
            .unwrap();
        assert!(!plugins[0].emits());
        assert!(plugins[1].emits());
        assert_eq!(plugins[1].emitter().unwrap().owner(), "loud");
    }
}
