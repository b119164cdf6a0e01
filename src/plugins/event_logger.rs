//! Event logger: writes every routed plugin event to the structured log.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::events::Event;
use crate::logging::{self, Domain};
use crate::plugin::{factory_fn, Handler, Plugin, PluginFactory};

use super::unexpected;

pub const SLUG: &str = "eventLogger";

#[derive(Debug, Default)]
pub struct EventLogger {
    logged: u64,
}

impl EventLogger {
    pub fn logged(&self) -> u64 {
        self.logged
    }
}

fn domain_for(event: &Event) -> Domain {
    match event {
        Event::Trade(_) | Event::PortfolioUpdate(_) => Domain::Trade,
        _ => Domain::Strategy,
    }
}

fn payload_fields(event: &Event) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("plugin".to_string(), Value::String(SLUG.to_string()));
    fields.insert("event_kind".to_string(), Value::String(event.kind().to_string()));
    if let Ok(Value::Object(body)) = serde_json::to_value(event) {
        if let Some(Value::Object(payload)) = body.get("payload") {
            for (k, v) in payload {
                fields.insert(k.clone(), v.clone());
            }
        }
    }
    fields
}

impl Plugin for EventLogger {
    fn handlers(&self) -> &'static [Handler] {
        &[Handler::Advice, Handler::Trade, Handler::Roundtrip, Handler::PerformanceReport]
    }

    fn handle(&mut self, handler: Handler, event: &Event) -> Result<()> {
        let matches = matches!(
            (handler, event),
            (Handler::Advice, Event::Advice(_))
                | (Handler::Trade, Event::Trade(_))
                | (Handler::Roundtrip, Event::Roundtrip(_))
                | (Handler::PerformanceReport, Event::PerformanceReport(_))
        );
        if !matches {
            return Err(unexpected(handler, event));
        }
        self.logged += 1;
        logging::info(domain_for(event), "event", payload_fields(event));
        Ok(())
    }
}

pub fn factory() -> Arc<dyn PluginFactory> {
    factory_fn(|_ctx| Ok(Box::new(EventLogger::default())))
}
