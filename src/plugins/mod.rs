//! Built-in plugins. Each module exposes a `factory()` used by the catalog.

pub mod advisor;
pub mod candle_writer;
pub mod event_logger;
pub mod paper_trader;
pub mod performance_analyzer;

use crate::events::Event;
use crate::plugin::Handler;

/// Payload mismatch between a handler and the event routed into it.
pub(crate) fn unexpected(handler: Handler, event: &Event) -> anyhow::Error {
    anyhow::anyhow!("{} cannot take a {} event", handler, event.kind())
}
