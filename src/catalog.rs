//! Built-in plugin catalog and the default subscription table.

use crate::config::Mode;
use crate::events::EventKind;
use crate::plugin::{Handler, PluginDescriptor};
use crate::plugins::{advisor, candle_writer, event_logger, paper_trader, performance_analyzer};
use crate::router::{SubscriptionRule, MARKET};

/// Known plugins in load order. Candle consumers are delivered in this order.
pub fn default_descriptors() -> Vec<PluginDescriptor> {
    vec![
        PluginDescriptor::new(advisor::SLUG, "Trading Advisor", advisor::factory())
            .description("Momentum strategy emitting long/short advice")
            .emits(),
        PluginDescriptor::new(paper_trader::SLUG, "Paper Trader", paper_trader::factory())
            .description("Simulated portfolio filling advice at the last close")
            .emits(),
        PluginDescriptor::new(
            performance_analyzer::SLUG,
            "Performance Analyzer",
            performance_analyzer::factory(),
        )
        .description("Roundtrips, drawdown and the end-of-run report")
        .emits(),
        PluginDescriptor::new(candle_writer::SLUG, "Candle Writer", candle_writer::factory())
            .description("Records live candles to SQLite")
            .modes(&[Mode::Realtime]),
        PluginDescriptor::new(event_logger::SLUG, "Event Logger", event_logger::factory())
            .description("Logs every routed event"),
    ]
}

pub fn default_subscriptions() -> Vec<SubscriptionRule> {
    vec![
        SubscriptionRule::new(MARKET, EventKind::Candle, Handler::Candle),
        SubscriptionRule::new(advisor::SLUG, EventKind::Advice, Handler::Advice),
        SubscriptionRule::new(paper_trader::SLUG, EventKind::Trade, Handler::Trade),
        SubscriptionRule::new(paper_trader::SLUG, EventKind::PortfolioUpdate, Handler::PortfolioUpdate),
        SubscriptionRule::new(performance_analyzer::SLUG, EventKind::Roundtrip, Handler::Roundtrip),
        SubscriptionRule::new(
            performance_analyzer::SLUG,
            EventKind::PerformanceReport,
            Handler::PerformanceReport,
        ),
    ]
}
