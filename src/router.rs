//! Emitter registry and subscription routing.
//!
//! Routing is resolved once at startup from a static table of
//! `{emitter, event, handler}` rules:
//!
//! ```text
//!   rules ──┬── emitter != "market" ──► Pass A: attach listener on plugin emitter
//!           │                                   (or warn if emitter missing)
//!           └── emitter == "market" ──► Pass B: candle consumers, load order
//! ```
//!
//! A rule only applies to plugins that expose its handler; others are
//! skipped without a diagnostic. Event and handler names the build does not
//! know are accepted when the table is read and simply match nothing.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::UnresolvedSubscription;
use crate::events::{EventKind, Listener};
use crate::logging::{self, obj, v_str, Domain};
use crate::plugin::{Handler, PluginInstance};

/// Reserved emitter name of the primary candle stream.
pub const MARKET: &str = "market";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EmitterId {
    Market,
    Plugin(String),
}

impl From<String> for EmitterId {
    fn from(s: String) -> Self {
        if s == MARKET {
            EmitterId::Market
        } else {
            EmitterId::Plugin(s)
        }
    }
}

impl From<&str> for EmitterId {
    fn from(s: &str) -> Self {
        EmitterId::from(s.to_string())
    }
}

impl From<EmitterId> for String {
    fn from(id: EmitterId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for EmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitterId::Market => f.write_str(MARKET),
            EmitterId::Plugin(slug) => f.write_str(slug),
        }
    }
}

/// An event or handler name from a rule table. Names this build does not
/// know are kept as written and never match a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleName<T> {
    Known(T),
    Unknown(String),
}

impl<T: Copy> RuleName<T> {
    pub fn known(&self) -> Option<T> {
        match self {
            RuleName::Known(value) => Some(*value),
            RuleName::Unknown(_) => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for RuleName<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleName::Known(value) => fmt::Display::fmt(value, f),
            RuleName::Unknown(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRule {
    pub emitter: EmitterId,
    pub event: RuleName<EventKind>,
    pub handler: RuleName<Handler>,
}

impl SubscriptionRule {
    pub fn new(emitter: impl Into<EmitterId>, event: EventKind, handler: Handler) -> Self {
        Self {
            emitter: emitter.into(),
            event: RuleName::Known(event),
            handler: RuleName::Known(handler),
        }
    }

    pub fn is_market(&self) -> bool {
        self.emitter == EmitterId::Market
    }

    /// The handler, if `plugin` exposes it.
    fn handler_on(&self, plugin: &PluginInstance) -> Option<Handler> {
        self.handler.known().filter(|h| plugin.exposes(*h))
    }
}

/// Read a JSON subscription table: `[{"emitter", "event", "handler"}, ...]`.
pub fn load_subscriptions(path: &Path) -> Result<Vec<SubscriptionRule>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading subscriptions {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("parsing subscriptions {}", path.display()))
}

/// Loaded plugins that declare `emits`, keyed by slug.
#[derive(Debug, Default)]
pub struct EmitterRegistry {
    emitters: HashMap<String, PluginInstance>,
}

impl EmitterRegistry {
    pub fn from_plugins(plugins: &[PluginInstance]) -> Self {
        let emitters = plugins
            .iter()
            .filter(|p| p.emits())
            .map(|p| (p.slug().to_string(), p.clone()))
            .collect();
        Self { emitters }
    }

    pub fn get(&self, slug: &str) -> Option<&PluginInstance> {
        self.emitters.get(slug)
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.emitters.contains_key(slug)
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }

    /// Register `listener` for `kind` on the named emitter. `false` if the
    /// emitter is not registered.
    pub fn attach(&self, slug: &str, kind: EventKind, listener: Listener) -> bool {
        match self.emitters.get(slug).and_then(|p| p.emitter()) {
            Some(emitter) => {
                emitter.on(kind, listener);
                true
            }
            None => false,
        }
    }
}

/// A stream consumer and the handler its candles are routed to.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub plugin: PluginInstance,
    pub handler: Handler,
}

/// Plugins receiving market candles, in load order. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ConsumerList {
    consumers: Vec<Consumer>,
}

impl ConsumerList {
    pub fn iter(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.iter()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn slugs(&self) -> Vec<&str> {
        self.consumers.iter().map(|c| c.plugin.slug()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingReport {
    pub attached: usize,
    pub unresolved: Vec<UnresolvedSubscription>,
    /// Market events other than `candle`, as named in the table. Not wired.
    pub ignored_market_events: Vec<String>,
}

/// Wire plugins to emitting plugins (pass A) and collect candle consumers
/// (pass B).
pub fn subscribe_plugins(
    plugins: &[PluginInstance],
    registry: &EmitterRegistry,
    rules: &[SubscriptionRule],
) -> (ConsumerList, RoutingReport) {
    let mut report = RoutingReport::default();
    let (market_rules, plugin_rules): (Vec<&SubscriptionRule>, Vec<&SubscriptionRule>) =
        rules.iter().partition(|r| r.is_market());

    for plugin in plugins {
        for rule in &plugin_rules {
            let Some(handler) = rule.handler_on(plugin) else {
                continue;
            };
            let slug = rule.emitter.to_string();
            if !registry.contains(&slug) {
                let unresolved = UnresolvedSubscription {
                    listener: plugin.name().to_string(),
                    emitter: slug.clone(),
                    event: rule.event.to_string(),
                };
                logging::warn(
                    Domain::Router,
                    "subscription.unresolved",
                    obj(&[
                        ("plugin", v_str(plugin.name())),
                        ("emitter", v_str(&slug)),
                        ("event_kind", v_str(&unresolved.event)),
                        ("msg", v_str(&unresolved.to_string())),
                    ]),
                );
                report.unresolved.push(unresolved);
                continue;
            }
            let Some(kind) = rule.event.known() else {
                // Nothing ever emits it.
                logging::debug(
                    Domain::Router,
                    "subscription.ignored",
                    obj(&[
                        ("plugin", v_str(plugin.name())),
                        ("emitter", v_str(&slug)),
                        ("event_kind", v_str(&rule.event.to_string())),
                    ]),
                );
                continue;
            };
            if registry.attach(&slug, kind, plugin.listener(handler)) {
                report.attached += 1;
                logging::debug(
                    Domain::Router,
                    "subscription.attached",
                    obj(&[
                        ("plugin", v_str(plugin.name())),
                        ("emitter", v_str(&slug)),
                        ("event_kind", v_str(kind.as_str())),
                        ("handler", v_str(handler.as_str())),
                    ]),
                );
            }
        }
    }

    // Only candles are routed from the market for now.
    let (candle_rules, ignored): (Vec<&SubscriptionRule>, Vec<&SubscriptionRule>) = market_rules
        .into_iter()
        .partition(|r| r.event == RuleName::Known(EventKind::Candle));
    for rule in ignored {
        let event = rule.event.to_string();
        logging::debug(
            Domain::Router,
            "subscription.ignored",
            obj(&[
                ("emitter", v_str(MARKET)),
                ("event_kind", v_str(&event)),
                ("handler", v_str(&rule.handler.to_string())),
            ]),
        );
        report.ignored_market_events.push(event);
    }

    let mut consumers: Vec<Consumer> = Vec::new();
    for plugin in plugins {
        for rule in &candle_rules {
            let Some(handler) = rule.handler_on(plugin) else {
                continue;
            };
            let duplicate = consumers
                .iter()
                .any(|c| c.plugin.slug() == plugin.slug() && c.handler == handler);
            if !duplicate {
                consumers.push(Consumer { plugin: plugin.clone(), handler });
            }
        }
    }

    logging::info(
        Domain::Router,
        "subscriptions.resolved",
        obj(&[
            ("attached", json!(report.attached)),
            ("unresolved", json!(report.unresolved.len())),
            ("candle_consumers", json!(consumers.iter().map(|c| c.plugin.slug()).collect::<Vec<_>>())),
        ]),
    );

    (ConsumerList { consumers }, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Advice, Direction, Emitter, Event};
    use crate::plugin::{Plugin, PluginMeta};
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    struct Stub {
        handlers: &'static [Handler],
        seen: Arc<Mutex<Vec<(String, Handler)>>>,
        slug: String,
    }

    impl Plugin for Stub {
        fn handlers(&self) -> &'static [Handler] {
            self.handlers
        }

        fn handle(&mut self, handler: Handler, _event: &Event) -> Result<()> {
            self.seen.lock().unwrap().push((self.slug.clone(), handler));
            Ok(())
        }
    }

    fn instance(
        slug: &str,
        handlers: &'static [Handler],
        emits: bool,
        seen: &Arc<Mutex<Vec<(String, Handler)>>>,
    ) -> PluginInstance {
        let meta = PluginMeta { slug: slug.to_string(), name: format!("{} plugin", slug), description: String::new() };
        let emitter = emits.then(|| Arc::new(Emitter::new(slug)));
        let stub = Stub { handlers, seen: seen.clone(), slug: slug.to_string() };
        PluginInstance::new(meta, Box::new(stub), emitter)
    }

    fn advice() -> Event {
        Event::Advice(Advice { ts: 1, direction: Direction::Short, price: 2.0 })
    }

    #[test]
    fn test_emitter_id_from_string() {
        assert_eq!(EmitterId::from("market"), EmitterId::Market);
        assert_eq!(EmitterId::from("paperTrader"), EmitterId::Plugin("paperTrader".to_string()));
        assert_eq!(EmitterId::Market.to_string(), "market");
    }

    #[test]
    fn test_rule_table_parses_from_json() {
        let rules: Vec<SubscriptionRule> = serde_json::from_str(
            r#"[{"emitter":"market","event":"candle","handler":"processCandle"},
                {"emitter":"tradingAdvisor","event":"advice","handler":"processAdvice"}]"#,
        )
        .unwrap();
        assert!(rules[0].is_market());
        assert_eq!(rules[1].emitter, EmitterId::Plugin("tradingAdvisor".to_string()));
        assert_eq!(rules[1].handler, RuleName::Known(Handler::Advice));
    }

    #[test]
    fn test_registry_contains_exactly_the_emitters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            instance("a", &[], true, &seen),
            instance("b", &[], false, &seen),
            instance("c", &[], true, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
        assert!(registry.contains("c"));
        assert!(EmitterRegistry::from_plugins(&[]).is_empty());
    }

    #[test]
    fn test_positive_subscription_invokes_listener_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            instance("advisor", &[], true, &seen),
            instance("trader", &[Handler::Advice], false, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let rules = vec![SubscriptionRule::new("advisor", EventKind::Advice, Handler::Advice)];
        let (_, report) = subscribe_plugins(&plugins, &registry, &rules);
        assert_eq!(report.attached, 1);
        assert!(report.unresolved.is_empty());

        let emitter = registry.get("advisor").unwrap().emitter().unwrap();
        assert_eq!(emitter.emit(advice()), 1);
        assert_eq!(*seen.lock().unwrap(), vec![("trader".to_string(), Handler::Advice)]);
    }

    #[test]
    fn test_missing_emitter_warns_without_attaching() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            // Loaded but not an emitter: behaves like a disabled one.
            instance("advisor", &[], false, &seen),
            instance("trader", &[Handler::Advice], false, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let rules = vec![
            SubscriptionRule::new("advisor", EventKind::Advice, Handler::Advice),
            SubscriptionRule::new("ghost", EventKind::Trade, Handler::Advice),
        ];
        let (consumers, report) = subscribe_plugins(&plugins, &registry, &rules);
        assert_eq!(report.attached, 0);
        assert_eq!(report.unresolved.len(), 2);
        assert_eq!(report.unresolved[0].listener, "trader plugin");
        assert_eq!(report.unresolved[0].emitter, "advisor");
        assert_eq!(
            report.unresolved[1].to_string(),
            "trader plugin wanted to listen to the ghost, however the ghost is disabled."
        );
        assert!(consumers.is_empty());
    }

    #[test]
    fn test_listener_without_handler_is_never_attached() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            instance("advisor", &[], true, &seen),
            instance("logger", &[Handler::Trade], false, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let rules = vec![
            SubscriptionRule::new("advisor", EventKind::Advice, Handler::Advice),
            // Missing emitter, but logger lacks the handler so no warning either.
            SubscriptionRule::new("ghost", EventKind::Advice, Handler::Advice),
        ];
        let (_, report) = subscribe_plugins(&plugins, &registry, &rules);
        assert_eq!(report.attached, 0);
        assert!(report.unresolved.is_empty());
        let emitter = registry.get("advisor").unwrap().emitter().unwrap();
        assert_eq!(emitter.listener_count(EventKind::Advice), 0);
    }

    #[test]
    fn test_listeners_attach_in_load_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            instance("z_first", &[Handler::Advice], false, &seen),
            instance("advisor", &[], true, &seen),
            instance("a_last", &[Handler::Advice], false, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let rules = vec![SubscriptionRule::new("advisor", EventKind::Advice, Handler::Advice)];
        subscribe_plugins(&plugins, &registry, &rules);
        registry.get("advisor").unwrap().emitter().unwrap().emit(advice());
        let order: Vec<String> = seen.lock().unwrap().iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(order, vec!["z_first", "a_last"]);
    }

    #[test]
    fn test_market_rules_build_consumer_list_in_load_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            instance("c1", &[Handler::Candle], false, &seen),
            instance("skip", &[Handler::Trade], false, &seen),
            instance("c2", &[Handler::Candle, Handler::Trade], true, &seen),
            instance("c3", &[Handler::Candle], false, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let rules = vec![
            SubscriptionRule::new(MARKET, EventKind::Candle, Handler::Candle),
            SubscriptionRule::new(MARKET, EventKind::Trade, Handler::Trade),
            // Repeated rule must not deliver twice.
            SubscriptionRule::new(MARKET, EventKind::Candle, Handler::Candle),
        ];
        let (consumers, report) = subscribe_plugins(&plugins, &registry, &rules);
        assert_eq!(consumers.slugs(), vec!["c1", "c2", "c3"]);
        assert_eq!(report.ignored_market_events, vec!["trade"]);
        assert!(report.unresolved.is_empty());
        // Market rules never attach listeners to plugin emitters.
        let emitter = registry.get("c2").unwrap().emitter().unwrap();
        assert_eq!(emitter.listener_count(EventKind::Trade), 0);
    }

    #[test]
    fn test_load_subscriptions_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        std::fs::write(&path, r#"[{"emitter":"market","event":"candle","handler":"processCandle"}]"#).unwrap();
        let rules = load_subscriptions(&path).unwrap();
        assert_eq!(rules, vec![SubscriptionRule::new(MARKET, EventKind::Candle, Handler::Candle)]);

        std::fs::write(&path, r#"[{"emitter":"market","event":"candle"}]"#).unwrap();
        assert!(load_subscriptions(&path).is_err());
    }

    #[test]
    fn test_unknown_names_load_and_match_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        std::fs::write(
            &path,
            r#"[{"emitter":"market","event":"candle","handler":"processCandle"},
                {"emitter":"market","event":"orderbook","handler":"processOrderbook"},
                {"emitter":"advisor","event":"advice","handler":"onAdvice"},
                {"emitter":"advisor","event":"sentiment","handler":"processAdvice"}]"#,
        )
        .unwrap();
        let rules = load_subscriptions(&path).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[1].event, RuleName::Unknown("orderbook".to_string()));
        assert_eq!(rules[2].handler, RuleName::Unknown("onAdvice".to_string()));
        assert_eq!(rules[3].event.to_string(), "sentiment");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![
            instance("advisor", &[Handler::Candle], true, &seen),
            instance("trader", &[Handler::Candle, Handler::Advice], false, &seen),
        ];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let (consumers, report) = subscribe_plugins(&plugins, &registry, &rules);
        assert_eq!(consumers.slugs(), vec!["advisor", "trader"]);
        assert_eq!(report.ignored_market_events, vec!["orderbook"]);
        assert_eq!(report.attached, 0);
        assert!(report.unresolved.is_empty());
        let emitter = registry.get("advisor").unwrap().emitter().unwrap();
        assert_eq!(emitter.listener_count(EventKind::Advice), 0);
    }

    #[test]
    fn test_unknown_event_from_missing_emitter_still_warns() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = vec![instance("trader", &[Handler::Advice], false, &seen)];
        let registry = EmitterRegistry::from_plugins(&plugins);
        let rules: Vec<SubscriptionRule> = serde_json::from_str(
            r#"[{"emitter":"advisor","event":"sentiment","handler":"processAdvice"}]"#,
        )
        .unwrap();
        let (_, report) = subscribe_plugins(&plugins, &registry, &rules);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].event, "sentiment");
    }
}
