use anyhow::Result;
use rusqlite::{params, Connection};

use crate::candle::Candle;

/// SQLite table of recorded candles, keyed by timestamp.
pub struct CandleStore {
    conn: Connection,
}

impl CandleStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS candles (
                ts INTEGER PRIMARY KEY,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Write a batch in one transaction. Re-recording a timestamp replaces it.
    pub fn insert_batch(&mut self, candles: &[Candle]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for c in candles {
            tx.execute(
                "INSERT OR REPLACE INTO candles (ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![c.ts as i64, c.o, c.h, c.l, c.c, c.v],
            )?;
        }
        tx.commit()?;
        Ok(candles.len())
    }

    /// Candles with `from <= ts < to`, oldest first.
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<Candle>> {
        self.read_page(from, to, usize::MAX)
    }

    /// At most `limit` candles with `from <= ts < to`, oldest first.
    pub fn read_page(&self, from: u64, to: u64, limit: usize) -> Result<Vec<Candle>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ts, open, high, low, close, volume FROM candles
             WHERE ts >= ?1 AND ts < ?2 ORDER BY ts ASC LIMIT ?3",
        )?;
        let to = i64::try_from(to).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![from as i64, to, limit], |row| {
            Ok(Candle {
                ts: row.get::<_, i64>(0)? as u64,
                o: row.get(1)?,
                h: row.get(2)?,
                l: row.get(3)?,
                c: row.get(4)?,
                v: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
