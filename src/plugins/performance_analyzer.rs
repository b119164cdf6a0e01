//! Performance analyzer: roundtrips, drawdown and the end-of-run report.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::candle::Candle;
use crate::events::{Emitter, Event, PerformanceReport, PortfolioUpdate, Roundtrip, Side, Trade};
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::plugin::{factory_fn, Finalizer, Handler, Plugin, PluginFactory};

use super::unexpected;

pub const SLUG: &str = "performanceAnalyzer";

#[derive(Debug, Default, Clone, Copy)]
struct Equity {
    start: Option<f64>,
    current: f64,
    peak: f64,
    max_drawdown: f64,
}

impl Equity {
    fn update(&mut self, equity: f64) {
        if self.start.is_none() {
            self.start = Some(equity);
        }
        self.current = equity;
        if equity > self.peak {
            self.peak = equity;
        }
        let drawdown = if self.peak > 0.0 { (equity - self.peak) / self.peak } else { 0.0 };
        if drawdown < self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }
}

pub struct PerformanceAnalyzer {
    emitter: Arc<Emitter>,
    first: Option<Candle>,
    last: Option<Candle>,
    equity: Equity,
    open_entry: Option<(u64, f64)>,
    trades: u64,
    roundtrips: u64,
    reported: bool,
}

impl PerformanceAnalyzer {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self {
            emitter,
            first: None,
            last: None,
            equity: Equity::default(),
            open_entry: None,
            trades: 0,
            roundtrips: 0,
            reported: false,
        }
    }

    fn on_candle(&mut self, candle: &Candle) {
        if self.first.is_none() {
            self.first = Some(*candle);
        }
        self.last = Some(*candle);
    }

    fn on_portfolio(&mut self, update: &PortfolioUpdate) {
        self.equity.update(update.equity);
    }

    fn on_trade(&mut self, trade: &Trade) {
        self.trades += 1;
        match trade.side {
            Side::Buy => {
                // Equity before the entry fee, so the roundtrip carries its cost.
                self.open_entry = Some((trade.ts, trade.equity + trade.fee));
            }
            Side::Sell => {
                let Some((entry_ts, entry_equity)) = self.open_entry.take() else {
                    return;
                };
                let pnl = trade.equity - entry_equity;
                let roundtrip = Roundtrip {
                    entry_ts,
                    exit_ts: trade.ts,
                    entry_equity,
                    exit_equity: trade.equity,
                    pnl,
                    pnl_pct: if entry_equity > 0.0 { pnl / entry_equity * 100.0 } else { 0.0 },
                };
                self.roundtrips += 1;
                self.emitter.emit(Event::Roundtrip(roundtrip));
            }
        }
    }

    pub fn report(&self) -> PerformanceReport {
        let start_equity = self.equity.start.unwrap_or(0.0);
        let end_equity = if self.equity.start.is_some() { self.equity.current } else { 0.0 };
        let pnl = end_equity - start_equity;
        let market_pct = match (self.first, self.last) {
            (Some(first), Some(last)) if first.c > 0.0 => (last.c / first.c - 1.0) * 100.0,
            _ => 0.0,
        };
        PerformanceReport {
            start_ts: self.first.map(|c| c.ts).unwrap_or(0),
            end_ts: self.last.map(|c| c.ts).unwrap_or(0),
            start_equity,
            end_equity,
            pnl,
            pnl_pct: if start_equity > 0.0 { pnl / start_equity * 100.0 } else { 0.0 },
            market_pct,
            trades: self.trades,
            roundtrips: self.roundtrips,
            max_drawdown: self.equity.max_drawdown,
        }
    }
}

impl Plugin for PerformanceAnalyzer {
    fn handlers(&self) -> &'static [Handler] {
        &[Handler::Candle, Handler::Trade, Handler::PortfolioUpdate]
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        match (handler, event) {
            (Handler::Candle, Event::Candle(candle)) => self.on_candle(candle),
            (Handler::Trade, Event::Trade(trade)) => self.on_trade(trade),
            (Handler::PortfolioUpdate, Event::PortfolioUpdate(update)) => self.on_portfolio(update),
            _ => return Err(unexpected(handler, event)),
        }
        Ok(())
    }

    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        Some(self)
    }
}

impl Finalizer for PerformanceAnalyzer {
    fn finalize(&mut self) -> Result<()> {
        if self.reported {
            return Ok(());
        }
        self.reported = true;
        let report = self.report();
        logging::info(
            Domain::Strategy,
            "performance.report",
            obj(&[
                ("plugin", v_str(SLUG)),
                ("start_ts", json!(report.start_ts)),
                ("end_ts", json!(report.end_ts)),
                ("pnl", v_num(report.pnl)),
                ("pnl_pct", v_num(report.pnl_pct)),
                ("market_pct", v_num(report.market_pct)),
                ("trades", json!(report.trades)),
                ("roundtrips", json!(report.roundtrips)),
                ("max_drawdown", v_num(report.max_drawdown)),
            ]),
        );
        self.emitter.emit(Event::PerformanceReport(report));
        Ok(())
    }
}

pub fn factory() -> Arc<dyn PluginFactory> {
    factory_fn(|ctx| Ok(Box::new(PerformanceAnalyzer::new(ctx.emitter()?))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::Mutex;

    fn candle(ts: u64, c: f64) -> Event {
        Event::Candle(Candle { ts, o: c, h: c, l: c, c, v: 1.0 })
    }

    fn portfolio(ts: u64, equity: f64) -> Event {
        Event::PortfolioUpdate(PortfolioUpdate { ts, cash: 0.0, asset: 0.0, equity })
    }

    fn trade(ts: u64, side: Side, equity: f64, fee: f64) -> Event {
        Event::Trade(Trade { ts, side, price: 1.0, qty: 1.0, fee, equity })
    }

    #[test]
    fn test_drawdown_tracks_peak() {
        let mut eq = Equity::default();
        for v in [100.0, 120.0, 90.0, 130.0, 117.0] {
            eq.update(v);
        }
        assert_eq!(eq.start, Some(100.0));
        assert!((eq.max_drawdown - (-0.25)).abs() < 1e-9);
        assert_eq!(eq.current, 117.0);
    }

    #[test]
    fn test_roundtrip_and_report() {
        let emitter = Arc::new(Emitter::new(SLUG));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Roundtrip, EventKind::PerformanceReport] {
            let sink = seen.clone();
            emitter.on(
                kind,
                Arc::new(move |event: &Event| {
                    sink.lock().unwrap().push(*event);
                    Ok(())
                }),
            );
        }
        let mut analyzer = PerformanceAnalyzer::new(emitter);

        analyzer.handle(Handler::PortfolioUpdate, &portfolio(60, 1000.0)).unwrap();
        analyzer.handle(Handler::Candle, &candle(60, 100.0)).unwrap();
        analyzer.handle(Handler::Trade, &trade(120, Side::Buy, 990.0, 10.0)).unwrap();
        analyzer.handle(Handler::PortfolioUpdate, &portfolio(120, 990.0)).unwrap();
        analyzer.handle(Handler::Candle, &candle(120, 100.0)).unwrap();
        analyzer.handle(Handler::Trade, &trade(180, Side::Sell, 1078.0, 10.0)).unwrap();
        analyzer.handle(Handler::PortfolioUpdate, &portfolio(180, 1078.0)).unwrap();
        analyzer.handle(Handler::Candle, &candle(180, 110.0)).unwrap();

        analyzer.finalize().unwrap();
        analyzer.finalize().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let Event::Roundtrip(rt) = seen[0] else { panic!("expected roundtrip") };
        assert_eq!((rt.entry_ts, rt.exit_ts), (120, 180));
        assert!((rt.pnl - 78.0).abs() < 1e-9);
        let Event::PerformanceReport(report) = seen[1] else { panic!("expected report") };
        assert_eq!((report.start_ts, report.end_ts), (60, 180));
        assert!((report.pnl - 78.0).abs() < 1e-9);
        assert!((report.market_pct - 10.0).abs() < 1e-9);
        assert_eq!(report.trades, 2);
        assert_eq!(report.roundtrips, 1);
        assert!((report.max_drawdown - (-0.01)).abs() < 1e-9);
    }

    #[test]
    fn test_report_without_portfolio_is_flat() {
        let mut analyzer = PerformanceAnalyzer::new(Arc::new(Emitter::new(SLUG)));
        analyzer.handle(Handler::Candle, &candle(60, 50.0)).unwrap();
        let report = analyzer.report();
        assert_eq!(report.start_equity, 0.0);
        assert_eq!(report.pnl, 0.0);
        assert_eq!(report.market_pct, 0.0);
    }
}
