//! Shared stub plugin for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use candleflow::candle::Candle;
use candleflow::config::{PluginSection, PluginSettings};
use candleflow::events::{Advice, Direction, Emitter, Event};
use candleflow::plugin::{Finalizer, Handler, Plugin, PluginContext, PluginDescriptor, PluginFactory};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

pub fn candle(ts: u64, c: f64) -> Candle {
    Candle { ts, o: c, h: c, l: c, c, v: 1.0 }
}

/// Records every call; when it emits, turns each candle into long advice.
pub struct Stub {
    slug: String,
    journal: Journal,
    handlers: &'static [Handler],
    emitter: Option<Arc<Emitter>>,
    finalizes: bool,
}

impl Plugin for Stub {
    fn handlers(&self) -> &'static [Handler] {
        self.handlers
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        let ts = match event {
            Event::Candle(c) => c.ts,
            Event::Advice(a) => a.ts,
            Event::Trade(t) => t.ts,
            _ => 0,
        };
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}:{}", self.slug, handler, ts));
        if let (Some(emitter), Event::Candle(c)) = (&self.emitter, event) {
            emitter.emit(Event::Advice(Advice { ts: c.ts, direction: Direction::Long, price: c.c }));
        }
        Ok(())
    }

    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        if self.finalizes {
            Some(self)
        } else {
            None
        }
    }
}

impl Finalizer for Stub {
    fn finalize(&mut self) -> Result<()> {
        self.journal.lock().unwrap().push(format!("{}:finalize", self.slug));
        Ok(())
    }
}

/// Factory that awaits before building, to expose any overlap between loads.
pub struct StubFactory {
    pub journal: Journal,
    pub handlers: &'static [Handler],
    pub finalizes: bool,
    pub delay_ms: u64,
    pub fail: bool,
}

#[async_trait]
impl PluginFactory for StubFactory {
    async fn create(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>> {
        self.journal.lock().unwrap().push(format!("start:{}", ctx.meta.slug));
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        if self.fail {
            bail!("{} refused to start", ctx.meta.slug);
        }
        self.journal.lock().unwrap().push(format!("done:{}", ctx.meta.slug));
        Ok(Box::new(Stub {
            slug: ctx.meta.slug.clone(),
            journal: self.journal.clone(),
            handlers: self.handlers,
            emitter: ctx.emitter.clone(),
            finalizes: self.finalizes,
        }))
    }
}

pub struct StubDef {
    pub slug: &'static str,
    pub handlers: &'static [Handler],
    pub emits: bool,
    pub finalizes: bool,
    pub delay_ms: u64,
    pub fail: bool,
}

impl StubDef {
    pub fn new(slug: &'static str, handlers: &'static [Handler]) -> Self {
        Self { slug, handlers, emits: false, finalizes: false, delay_ms: 0, fail: false }
    }

    pub fn emits(mut self) -> Self {
        self.emits = true;
        self
    }

    pub fn finalizes(mut self) -> Self {
        self.finalizes = true;
        self
    }

    pub fn delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn descriptor(&self, journal: &Journal) -> PluginDescriptor {
        let factory = StubFactory {
            journal: journal.clone(),
            handlers: self.handlers,
            finalizes: self.finalizes,
            delay_ms: self.delay_ms,
            fail: self.fail,
        };
        let descriptor = PluginDescriptor::new(self.slug, self.slug, Arc::new(factory));
        if self.emits {
            descriptor.emits()
        } else {
            descriptor
        }
    }
}

/// Every slug enabled with no options.
pub fn enabled(slugs: &[&str]) -> PluginSettings {
    let mut settings = PluginSettings::default();
    for slug in slugs {
        settings.set(slug, PluginSection::enabled());
    }
    settings
}
