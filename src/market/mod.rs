//! Candle sources: the producing side of the pipeline.
//!
//! A source yields candles in strictly increasing time order and signals
//! end-of-stream by returning `Ok(None)`. The fan-out stage only calls
//! [`CandleSource::next_candle`] again after the previous candle has been
//! fully delivered, so a source never has more than one candle in flight.

mod historical;
mod realtime;
pub mod retry;

use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;

use crate::candle::Candle;
use crate::config::{Config, DataSource, Mode};

pub use historical::{HistoricalMarket, SqliteMarket};
pub use realtime::{parse_klines, RealtimeMarket};

#[async_trait]
pub trait CandleSource: Send {
    /// Next candle, or `None` once the source is exhausted.
    async fn next_candle(&mut self) -> Result<Option<Candle>>;
}

/// In-memory source.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    candles: VecDeque<Candle>,
}

impl VecSource {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles: candles.into() }
    }

    pub fn remaining(&self) -> usize {
        self.candles.len()
    }
}

#[async_trait]
impl CandleSource for VecSource {
    async fn next_candle(&mut self) -> Result<Option<Candle>> {
        Ok(self.candles.pop_front())
    }
}

/// Pick the market for the configured mode.
pub fn build_source(cfg: &Config) -> Result<Box<dyn CandleSource>> {
    match (cfg.mode, cfg.data_source) {
        (Mode::Realtime, _) => Ok(Box::new(RealtimeMarket::new(cfg)?)),
        (Mode::Backtest, DataSource::Csv) => Ok(Box::new(HistoricalMarket::from_csv(cfg.data_path.as_ref())?)),
        (Mode::Backtest, DataSource::Sqlite) => Ok(Box::new(SqliteMarket::open(&cfg.sqlite_path, 0, u64::MAX)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_source_drains_in_order_then_ends() {
        let candles: Vec<Candle> = (1..=3)
            .map(|ts| Candle { ts, o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 1.0 })
            .collect();
        let mut source = VecSource::new(candles);
        assert_eq!(source.remaining(), 3);
        for ts in 1..=3 {
            assert_eq!(source.next_candle().await.unwrap().unwrap().ts, ts);
        }
        assert!(source.next_candle().await.unwrap().is_none());
    }
}
