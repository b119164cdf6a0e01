use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::candle::{is_skippable_line, parse_csv_line, Candle};
use crate::data::{file_sha256, DatasetManifest};
use crate::logging::{self, obj, v_str, Domain};
use crate::storage::CandleStore;

use super::CandleSource;

/// Rows fetched per query when replaying a SQLite recording.
const SQLITE_BATCH: usize = 1000;

/// Candle rows of a CSV file, parsed one line at a time.
#[derive(Debug)]
struct CsvRows {
    origin: String,
    lines: Lines<BufReader<File>>,
    line_no: u64,
    last_ts: Option<u64>,
    bad_rows: u64,
    report_bad_rows: bool,
}

impl CsvRows {
    fn open(path: &Path, report_bad_rows: bool) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening dataset {}", path.display()))?;
        Ok(Self {
            origin: path.display().to_string(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
            last_ts: None,
            bad_rows: 0,
            report_bad_rows,
        })
    }

    /// Next well-formed row. Unparseable rows are skipped; timestamps that
    /// do not strictly increase are an error.
    fn next_row(&mut self) -> Result<Option<Candle>> {
        for line in self.lines.by_ref() {
            let line = line?;
            self.line_no += 1;
            if is_skippable_line(&line) {
                continue;
            }
            let candle = match parse_csv_line(&line) {
                Ok(c) => c,
                Err(err) => {
                    self.bad_rows += 1;
                    if self.report_bad_rows {
                        logging::warn(
                            Domain::Market,
                            "dataset.bad_row",
                            obj(&[("line", json!(self.line_no)), ("msg", v_str(&err.to_string()))]),
                        );
                    }
                    continue;
                }
            };
            if let Some(prev) = self.last_ts {
                if candle.ts <= prev {
                    bail!(
                        "{}:{}: candle ts {} does not follow {}",
                        self.origin,
                        self.line_no,
                        candle.ts,
                        prev
                    );
                }
            }
            self.last_ts = Some(candle.ts);
            return Ok(Some(candle));
        }
        Ok(None)
    }
}

/// Finite market replayed as fast as the consumers allow. Rows are read
/// from disk as they are pulled.
#[derive(Debug)]
pub struct HistoricalMarket {
    rows: CsvRows,
    manifest: DatasetManifest,
    delivered: u64,
}

impl HistoricalMarket {
    /// Open `ts,open,high,low,close,volume[,...]` rows. A first pass over the
    /// file builds the manifest and rejects out-of-order timestamps; nothing
    /// is kept in memory.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let manifest = scan_csv(path)?;
        logging::info(
            Domain::Market,
            "dataset.opened",
            obj(&[
                ("path", v_str(&manifest.path)),
                ("sha256", v_str(&manifest.hash_sha256)),
                ("rows", json!(manifest.row_count)),
                ("bad_rows", json!(manifest.bad_rows)),
                ("ts_min", json!(manifest.ts_min)),
                ("ts_max", json!(manifest.ts_max)),
            ]),
        );
        Ok(Self { rows: CsvRows::open(path, false)?, manifest, delivered: 0 })
    }

    pub fn manifest(&self) -> &DatasetManifest {
        &self.manifest
    }

    pub fn remaining(&self) -> u64 {
        self.manifest.row_count.saturating_sub(self.delivered)
    }
}

fn scan_csv(path: &Path) -> Result<DatasetManifest> {
    let hash_sha256 = file_sha256(path)?;
    let mut rows = CsvRows::open(path, true)?;
    let mut row_count = 0u64;
    let mut ts_min = None;
    while let Some(candle) = rows.next_row()? {
        ts_min.get_or_insert(candle.ts);
        row_count += 1;
    }
    Ok(DatasetManifest {
        path: path.display().to_string(),
        hash_sha256,
        row_count,
        bad_rows: rows.bad_rows,
        ts_min,
        ts_max: rows.last_ts,
    })
}

#[async_trait]
impl CandleSource for HistoricalMarket {
    async fn next_candle(&mut self) -> Result<Option<Candle>> {
        let next = self.rows.next_row()?;
        if next.is_some() {
            self.delivered += 1;
        }
        Ok(next)
    }
}

/// Candles recorded by the candle writer, replayed oldest first in pages.
pub struct SqliteMarket {
    store: CandleStore,
    next_from: u64,
    to: u64,
    batch_size: usize,
    batch: VecDeque<Candle>,
    drained: bool,
}

impl SqliteMarket {
    /// Replay `from <= ts < to`.
    pub fn open(path: &str, from: u64, to: u64) -> Result<Self> {
        let mut store = CandleStore::open(path)?;
        store.init()?;
        logging::info(
            Domain::Market,
            "dataset.opened",
            obj(&[("path", v_str(path)), ("from", json!(from)), ("to", json!(to))]),
        );
        Ok(Self {
            store,
            next_from: from,
            to,
            batch_size: SQLITE_BATCH,
            batch: VecDeque::new(),
            drained: false,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn refill(&mut self) -> Result<()> {
        let page = self.store.read_page(self.next_from, self.to, self.batch_size)?;
        match page.last() {
            Some(last) if page.len() == self.batch_size => self.next_from = last.ts + 1,
            _ => self.drained = true,
        }
        self.batch.extend(page);
        Ok(())
    }
}

#[async_trait]
impl CandleSource for SqliteMarket {
    async fn next_candle(&mut self) -> Result<Option<Candle>> {
        if self.batch.is_empty() && !self.drained {
            self.refill()?;
        }
        Ok(self.batch.pop_front())
    }
}
