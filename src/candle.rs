use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Parse `ts,open,high,low,close,volume[,...]`. Extra columns are ignored.
pub fn parse_csv_line(line: &str) -> Result<Candle> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 6 {
        return Err(anyhow!("expected 6+ columns, got {}", parts.len()));
    }
    Ok(Candle {
        ts: parts[0].trim().parse()?,
        o: parts[1].trim().parse()?,
        h: parts[2].trim().parse()?,
        l: parts[3].trim().parse()?,
        c: parts[4].trim().parse()?,
        v: parts[5].trim().parse()?,
    })
}

/// Header, blank and comment lines carry no candle.
pub fn is_skippable_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#') || trimmed.to_lowercase().starts_with("ts,")
}
