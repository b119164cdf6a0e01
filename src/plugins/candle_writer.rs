//! Candle writer: records the live stream into the SQLite candle store.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;

use crate::candle::Candle;
use crate::events::Event;
use crate::logging::{self, obj, v_str, Domain};
use crate::plugin::{factory_fn, Finalizer, Handler, Plugin, PluginFactory};
use crate::storage::CandleStore;

use super::unexpected;

pub const SLUG: &str = "candleWriter";

pub struct CandleWriter {
    store: CandleStore,
    path: String,
    batch_size: usize,
    buffer: Vec<Candle>,
    written: u64,
}

impl CandleWriter {
    pub fn open(path: &str, batch_size: usize) -> Result<Self> {
        let mut store = CandleStore::open(path)?;
        store.init()?;
        Ok(Self {
            store,
            path: path.to_string(),
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let n = self.store.insert_batch(&self.buffer)?;
        self.written += n as u64;
        self.buffer.clear();
        logging::debug(
            Domain::Market,
            "candles.flushed",
            obj(&[("plugin", v_str(SLUG)), ("rows", json!(n)), ("path", v_str(&self.path))]),
        );
        Ok(())
    }
}

impl Plugin for CandleWriter {
    fn handlers(&self) -> &'static [Handler] {
        &[Handler::Candle]
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        let (Handler::Candle, Event::Candle(candle)) = (handler, event) else {
            return Err(unexpected(handler, event));
        };
        self.buffer.push(*candle);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        Some(self)
    }
}

impl Finalizer for CandleWriter {
    fn finalize(&mut self) -> Result<()> {
        self.flush()?;
        logging::info(
            Domain::Market,
            "candles.recorded",
            obj(&[("plugin", v_str(SLUG)), ("rows", json!(self.written)), ("path", v_str(&self.path))]),
        );
        Ok(())
    }
}

pub fn factory() -> Arc<dyn PluginFactory> {
    factory_fn(|ctx| {
        let path = ctx.settings.str_or("path", "./candles.sqlite");
        let batch = ctx.settings.f64_or("batch_size", 1.0);
        if batch.is_nan() || batch < 1.0 {
            bail!("{}: batch_size must be at least 1, got {}", ctx.meta.slug, batch);
        }
        Ok(Box::new(CandleWriter::open(&path, batch as usize)?))
    })
}
