//! Typed publish/subscribe between plugins.
//!
//! An [`Emitter`] belongs to one plugin and keeps, per [`EventKind`], an
//! ordered list of listeners. `emit` calls them synchronously in
//! registration order. A failing listener is logged and counted; the
//! remaining listeners still receive the event.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::candle::Candle;
use crate::error::DeliveryError;
use crate::logging::{self, obj, v_str, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Candle,
    Trade,
    Advice,
    PortfolioUpdate,
    Roundtrip,
    PerformanceReport,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Candle => "candle",
            EventKind::Trade => "trade",
            EventKind::Advice => "advice",
            EventKind::PortfolioUpdate => "portfolioUpdate",
            EventKind::Roundtrip => "roundtrip",
            EventKind::PerformanceReport => "performanceReport",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub ts: u64,
    pub direction: Direction,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ts: u64,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    /// Portfolio value right after the fill.
    pub equity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioUpdate {
    pub ts: u64,
    pub cash: f64,
    pub asset: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roundtrip {
    pub entry_ts: u64,
    pub exit_ts: u64,
    pub entry_equity: f64,
    pub exit_equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub start_ts: u64,
    pub end_ts: u64,
    pub start_equity: f64,
    pub end_equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub market_pct: f64,
    pub trades: u64,
    pub roundtrips: u64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum Event {
    Candle(Candle),
    Trade(Trade),
    Advice(Advice),
    PortfolioUpdate(PortfolioUpdate),
    Roundtrip(Roundtrip),
    PerformanceReport(PerformanceReport),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Candle(_) => EventKind::Candle,
            Event::Trade(_) => EventKind::Trade,
            Event::Advice(_) => EventKind::Advice,
            Event::PortfolioUpdate(_) => EventKind::PortfolioUpdate,
            Event::Roundtrip(_) => EventKind::Roundtrip,
            Event::PerformanceReport(_) => EventKind::PerformanceReport,
        }
    }
}

pub type Listener = Arc<dyn Fn(&Event) -> Result<(), DeliveryError> + Send + Sync>;

pub struct Emitter {
    owner: String,
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    failures: AtomicU64,
}

impl Emitter {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            listeners: RwLock::new(HashMap::new()),
            failures: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn on(&self, kind: EventKind, listener: Listener) {
        if let Ok(mut map) = self.listeners.write() {
            map.entry(kind).or_default().push(listener);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .map(|map| map.get(&kind).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Listener failures since creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Deliver `event` to its listeners in registration order and return how
    /// many handled it successfully.
    pub fn emit(&self, event: Event) -> usize {
        let kind = event.kind();
        // Snapshot so listeners never run under the registry lock.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .map(|map| map.get(&kind).cloned().unwrap_or_default())
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in listeners {
            match listener(&event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    logging::error(
                        Domain::Router,
                        "listener.failed",
                        obj(&[
                            ("emitter", v_str(&self.owner)),
                            ("event_kind", v_str(kind.as_str())),
                            ("msg", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }
        delivered
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(EventKind, usize)> = self
            .listeners
            .read()
            .map(|map| map.iter().map(|(k, v)| (*k, v.len())).collect())
            .unwrap_or_default();
        f.debug_struct("Emitter")
            .field("owner", &self.owner)
            .field("listeners", &counts)
            .finish()
    }
}
