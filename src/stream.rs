//! Fan-out stage between the market and the candle consumers.
//!
//! ```text
//!   source.next_candle() ──► candle ──► C1 ──► C2 ──► ... ──► Cn ──┐
//!          ▲                                                        │
//!          └──────────────── only after Cn returned ◄───────────────┘
//!
//!   source ends (None) ──► finalize hooks, in consumer order, once
//! ```
//!
//! Consumer failures are isolated: logged, counted, and the candle still
//! reaches the remaining consumers. With `halt_on_consumer_error` the first
//! failure ends the run instead.

use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use crate::candle::Candle;
use crate::error::DeliveryError;
use crate::events::Event;
use crate::logging::{self, obj, v_str, Domain};
use crate::market::CandleSource;
use crate::router::ConsumerList;

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    pub halt_on_consumer_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub candles: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub finalize_failures: u64,
    pub last_ts: Option<u64>,
}

pub struct CandleStream {
    consumers: ConsumerList,
    options: StreamOptions,
    stats: PipelineStats,
}

impl CandleStream {
    pub fn new(consumers: ConsumerList, options: StreamOptions) -> Self {
        Self {
            consumers,
            options,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Deliver one candle to every consumer, in order.
    pub fn write(&mut self, candle: &Candle) -> Result<(), DeliveryError> {
        logging::log_candle(candle.ts, candle.o, candle.h, candle.l, candle.c, candle.v);
        let event = Event::Candle(*candle);
        self.stats.candles += 1;
        self.stats.last_ts = Some(candle.ts);
        for consumer in self.consumers.iter() {
            match consumer.plugin.deliver(consumer.handler, &event) {
                Ok(()) => self.stats.deliveries += 1,
                Err(err) => {
                    self.stats.failures += 1;
                    logging::error(
                        Domain::Pipeline,
                        "consumer.failed",
                        obj(&[
                            ("plugin", v_str(consumer.plugin.name())),
                            ("candle_ts", json!(candle.ts)),
                            ("msg", v_str(&err.to_string())),
                        ]),
                    );
                    if self.options.halt_on_consumer_error {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Pump the source to exhaustion, then finalize. Consumes the stream so
    /// finalize cannot run twice.
    pub async fn run<S>(mut self, source: &mut S) -> Result<PipelineStats>
    where
        S: CandleSource + ?Sized,
    {
        let started = Instant::now();
        while let Some(candle) = source.next_candle().await? {
            self.write(&candle)?;
        }
        self.finalize();
        logging::log_session_summary(
            self.stats.candles,
            self.stats.deliveries,
            self.stats.failures,
            started.elapsed().as_millis() as u64,
        );
        Ok(self.stats)
    }

    fn finalize(&mut self) {
        logging::info(
            Domain::Pipeline,
            "stream.finalize",
            obj(&[
                ("candles", json!(self.stats.candles)),
                ("consumers", json!(self.consumers.len())),
            ]),
        );
        for consumer in self.consumers.iter() {
            if !consumer.plugin.has_finalizer() {
                continue;
            }
            if let Err(err) = consumer.plugin.finalize() {
                self.stats.finalize_failures += 1;
                logging::error(
                    Domain::Pipeline,
                    "consumer.finalize_failed",
                    obj(&[
                        ("plugin", v_str(consumer.plugin.name())),
                        ("msg", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }
}
