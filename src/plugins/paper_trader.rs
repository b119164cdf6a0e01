//! Paper trader: all-in/all-out simulated portfolio driven by advice.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;

use crate::candle::Candle;
use crate::events::{Advice, Direction, Emitter, Event, PortfolioUpdate, Side, Trade};
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::plugin::{factory_fn, Handler, Plugin, PluginFactory};

use super::unexpected;

pub const SLUG: &str = "paperTrader";

#[derive(Debug, Clone, Copy)]
pub struct Portfolio {
    pub cash: f64,
    pub position: f64,
    pub entry_price: f64,
    pub equity: f64,
}

impl Portfolio {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            position: 0.0,
            entry_price: 0.0,
            equity: cash,
        }
    }

    /// Signed fill: positive `qty` buys, negative sells. `fee` is paid in cash.
    pub fn apply_fill(&mut self, price: f64, qty: f64, fee: f64) {
        if qty == 0.0 {
            return;
        }
        let prev_pos = self.position;
        let new_pos = prev_pos + qty;
        if prev_pos == 0.0 || (prev_pos > 0.0) == (new_pos > 0.0) {
            let total = prev_pos.abs() + qty.abs();
            if total > 0.0 {
                self.entry_price = (self.entry_price * prev_pos.abs() + price * qty.abs()) / total;
            }
        } else {
            self.entry_price = 0.0;
        }
        self.cash -= qty * price;
        self.cash -= fee;
        self.position = new_pos;
        self.mark(price);
    }

    pub fn mark(&mut self, price: f64) {
        self.equity = self.cash + self.position * price;
    }
}

pub struct PaperTrader {
    emitter: Arc<Emitter>,
    portfolio: Portfolio,
    fee_rate: f64,
    last: Option<Candle>,
    trades: u64,
}

impl PaperTrader {
    pub fn new(emitter: Arc<Emitter>, cash: f64, fee_rate: f64) -> Self {
        Self {
            emitter,
            portfolio: Portfolio::new(cash),
            fee_rate,
            last: None,
            trades: 0,
        }
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.last = Some(*candle);
        self.portfolio.mark(candle.c);
        self.emit_portfolio(candle.ts);
    }

    fn on_advice(&mut self, advice: &Advice) {
        // The advisor runs ahead of us on the same candle, so its price is the
        // freshest close.
        let price = if advice.price > 0.0 {
            advice.price
        } else {
            match self.last {
                Some(c) => c.c,
                None => return,
            }
        };
        let (side, qty, fee) = match advice.direction {
            Direction::Long if self.portfolio.position == 0.0 && self.portfolio.cash > 0.0 => {
                let spend = self.portfolio.cash;
                let fee = spend * self.fee_rate;
                (Side::Buy, (spend - fee) / price, fee)
            }
            Direction::Short if self.portfolio.position > 0.0 => {
                let qty = self.portfolio.position;
                (Side::Sell, -qty, qty * price * self.fee_rate)
            }
            _ => return,
        };
        self.portfolio.apply_fill(price, qty, fee);
        self.trades += 1;

        let trade = Trade {
            ts: advice.ts,
            side,
            price,
            qty: qty.abs(),
            fee,
            equity: self.portfolio.equity,
        };
        logging::info(
            Domain::Trade,
            "trade.filled",
            obj(&[
                ("plugin", v_str(SLUG)),
                ("ts", json!(trade.ts)),
                ("side", json!(trade.side)),
                ("price", v_num(trade.price)),
                ("qty", v_num(trade.qty)),
                ("fee", v_num(trade.fee)),
                ("equity", v_num(trade.equity)),
            ]),
        );
        self.emitter.emit(Event::Trade(trade));
        self.emit_portfolio(advice.ts);
    }

    fn emit_portfolio(&self, ts: u64) {
        self.emitter.emit(Event::PortfolioUpdate(PortfolioUpdate {
            ts,
            cash: self.portfolio.cash,
            asset: self.portfolio.position,
            equity: self.portfolio.equity,
        }));
    }
}

impl Plugin for PaperTrader {
    fn handlers(&self) -> &'static [Handler] {
        &[Handler::Candle, Handler::Advice]
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        match (handler, event) {
            (Handler::Candle, Event::Candle(candle)) => self.on_candle(candle),
            (Handler::Advice, Event::Advice(advice)) => self.on_advice(advice),
            _ => return Err(unexpected(handler, event)),
        }
        Ok(())
    }
}

pub fn factory() -> Arc<dyn PluginFactory> {
    factory_fn(|ctx| {
        let cash = ctx.settings.f64_or("cash", 1000.0);
        let fee_rate = ctx.settings.f64_or("fee_rate", 0.001);
        if !cash.is_finite() || cash <= 0.0 {
            bail!("{}: starting cash must be positive, got {}", ctx.meta.slug, cash);
        }
        if !(0.0..1.0).contains(&fee_rate) {
            bail!("{}: fee_rate must be in [0, 1), got {}", ctx.meta.slug, fee_rate);
        }
        Ok(Box::new(PaperTrader::new(ctx.emitter()?, cash, fee_rate)))
    })
}
