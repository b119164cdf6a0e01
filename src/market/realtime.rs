use std::collections::VecDeque;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

use crate::candle::Candle;
use crate::config::Config;
use crate::logging::{self, obj, v_str, Domain};

use super::retry::{HttpStatusError, RetryPolicy};
use super::CandleSource;

/// Live market polling the Binance kline endpoint. Never ends on its own.
pub struct RealtimeMarket {
    client: Client,
    base: String,
    symbol: String,
    interval: &'static str,
    poll: Duration,
    retry: RetryPolicy,
    last_ts: Option<u64>,
    pending: VecDeque<Candle>,
}

impl RealtimeMarket {
    /// Fails when `candle_secs` has no kline interval of the same length.
    pub fn new(cfg: &Config) -> Result<Self> {
        let Some(interval) = Self::as_kline_interval(cfg.candle_secs) else {
            bail!("CANDLE_SECS={} has no matching kline interval", cfg.candle_secs);
        };
        Ok(Self {
            client: Client::new(),
            base: cfg.binance_base.clone(),
            symbol: cfg.symbol.clone(),
            interval,
            poll: Duration::from_secs(cfg.poll_secs.max(1)),
            retry: RetryPolicy::default(),
            last_ts: None,
            pending: VecDeque::new(),
        })
    }

    fn as_kline_interval(granularity: u64) -> Option<&'static str> {
        let interval = match granularity {
            60 => "1m",
            180 => "3m",
            300 => "5m",
            900 => "15m",
            1800 => "30m",
            3600 => "1h",
            7200 => "2h",
            14_400 => "4h",
            21_600 => "6h",
            43_200 => "12h",
            86_400 => "1d",
            _ => return None,
        };
        Some(interval)
    }

    async fn fetch_closed(&self) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit=5",
            self.base, self.symbol, self.interval
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpStatusError { endpoint: "klines".to_string(), status, body }.into());
        }
        let rows: Vec<Vec<Value>> = resp.json().await?;
        parse_klines(&rows, chrono::Utc::now().timestamp_millis() as u64)
    }

    /// Queue closed candles newer than the last one handed out. On the first
    /// poll only the most recent closed candle is taken.
    fn absorb(&mut self, closed: Vec<Candle>) {
        let fresh: Vec<Candle> = match self.last_ts {
            Some(last) => closed.into_iter().filter(|c| c.ts > last).collect(),
            None => closed.into_iter().last().into_iter().collect(),
        };
        for candle in fresh {
            self.last_ts = Some(candle.ts);
            self.pending.push_back(candle);
        }
    }
}

#[async_trait]
impl CandleSource for RealtimeMarket {
    async fn next_candle(&mut self) -> Result<Option<Candle>> {
        loop {
            if let Some(candle) = self.pending.pop_front() {
                return Ok(Some(candle));
            }
            let closed = self.retry.run("fetch_klines", || self.fetch_closed()).await?;
            self.absorb(closed);
            if self.pending.is_empty() {
                logging::debug(
                    Domain::Market,
                    "poll.idle",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("last_ts", json!(self.last_ts)),
                    ]),
                );
                sleep(self.poll).await;
            }
        }
    }
}

/// Turn kline rows into closed candles, oldest first.
///
/// Row layout: `[open_time_ms, "o", "h", "l", "c", "v", close_time_ms, ...]`.
/// Rows whose close time is not yet past `now_ms` are still forming.
pub fn parse_klines(rows: &[Vec<Value>], now_ms: u64) -> Result<Vec<Candle>> {
    let num = |row: &[Value], idx: usize| -> Result<f64> {
        row.get(idx)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("kline field {} is not a decimal string", idx))
    };
    let mut out = Vec::new();
    for row in rows {
        let row = row.as_slice();
        let open_ms = row.first().and_then(Value::as_u64).ok_or_else(|| anyhow!("kline without open time"))?;
        let close_ms = row.get(6).and_then(Value::as_u64).ok_or_else(|| anyhow!("kline without close time"))?;
        if close_ms >= now_ms {
            continue;
        }
        out.push(Candle {
            ts: open_ms / 1000,
            o: num(row, 1)?,
            h: num(row, 2)?,
            l: num(row, 3)?,
            c: num(row, 4)?,
            v: num(row, 5)?,
        });
    }
    out.sort_by_key(|c| c.ts);
    Ok(out)
}
