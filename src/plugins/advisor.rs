//! Trading advisor: close-to-close momentum, advice only on direction change.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;

use crate::candle::Candle;
use crate::events::{Advice, Direction, Emitter, Event};
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::plugin::{factory_fn, Finalizer, Handler, Plugin, PluginFactory};

use super::unexpected;

pub const SLUG: &str = "tradingAdvisor";

pub struct TradingAdvisor {
    emitter: Arc<Emitter>,
    threshold: f64,
    prev_close: Option<f64>,
    direction: Option<Direction>,
    candles: u64,
    advices: u64,
}

impl TradingAdvisor {
    pub fn new(emitter: Arc<Emitter>, threshold: f64) -> Self {
        Self {
            emitter,
            threshold,
            prev_close: None,
            direction: None,
            candles: 0,
            advices: 0,
        }
    }

    /// Direction the last move points at, if it cleared the threshold.
    fn signal(&self, candle: &Candle) -> Option<Direction> {
        let prev = self.prev_close?;
        let move_pct = if prev > 0.0 { (candle.c / prev) - 1.0 } else { 0.0 };
        if move_pct > self.threshold {
            Some(Direction::Long)
        } else if move_pct < -self.threshold {
            Some(Direction::Short)
        } else {
            None
        }
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.candles += 1;
        let signal = self.signal(candle);
        self.prev_close = Some(candle.c);

        let Some(direction) = signal else {
            return;
        };
        if self.direction == Some(direction) {
            return;
        }
        self.direction = Some(direction);
        self.advices += 1;
        logging::debug(
            Domain::Strategy,
            "advice",
            obj(&[
                ("plugin", v_str(SLUG)),
                ("ts", json!(candle.ts)),
                ("direction", json!(direction)),
                ("price", v_num(candle.c)),
            ]),
        );
        self.emitter.emit(Event::Advice(Advice { ts: candle.ts, direction, price: candle.c }));
    }
}

impl Plugin for TradingAdvisor {
    fn handlers(&self) -> &'static [Handler] {
        &[Handler::Candle]
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        match (handler, event) {
            (Handler::Candle, Event::Candle(candle)) => {
                self.on_candle(candle);
                Ok(())
            }
            _ => Err(unexpected(handler, event)),
        }
    }

    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        Some(self)
    }
}

impl Finalizer for TradingAdvisor {
    fn finalize(&mut self) -> Result<()> {
        logging::info(
            Domain::Strategy,
            "advisor.summary",
            obj(&[
                ("plugin", v_str(SLUG)),
                ("candles", json!(self.candles)),
                ("advices", json!(self.advices)),
                ("threshold", v_num(self.threshold)),
            ]),
        );
        Ok(())
    }
}

pub fn factory() -> Arc<dyn PluginFactory> {
    factory_fn(|ctx| {
        let threshold = ctx.settings.f64_or("threshold", 0.002);
        if !threshold.is_finite() || threshold < 0.0 {
            bail!("{}: threshold must be a non-negative number, got {}", ctx.meta.slug, threshold);
        }
        Ok(Box::new(TradingAdvisor::new(ctx.emitter()?, threshold)))
    })
}
