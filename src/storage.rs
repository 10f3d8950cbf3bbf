use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, Result};
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, Duration};

use crate::dns::DnsCache;
use crate::sink::PacketRecord;

/// One persisted capture row, as stored and as served by the history API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredRecord {
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub protocol: u8,
    pub length: u16,
    pub src_hostname: Option<String>,
    pub dst_hostname: Option<String>,
}

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS datagrams (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                protocol INTEGER,
                length INTEGER,
                src_hostname TEXT,
                dst_hostname TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_datagrams_timestamp ON datagrams(timestamp)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Drain the record channel into the database.
    ///
    /// Rows are buffered and written in one transaction every 2 s or every
    /// 1000 rows, whichever comes first. Returns when the channel closes.
    pub async fn run_writer(&self, mut rx: Receiver<PacketRecord>, dns: Option<Arc<DnsCache>>) {
        let mut buffer: Vec<StoredRecord> = Vec::new();
        let mut ticker = interval(Duration::from_secs(2));

        loop {
            tokio::select! {
                maybe_record = rx.recv() => {
                    let Some(record) = maybe_record else { break };
                    buffer.push(self.enrich(record, dns.as_deref()).await);
                    if buffer.len() >= 1000 {
                        self.flush(&mut buffer);
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }
        if !buffer.is_empty() {
            self.flush(&mut buffer);
        }
    }

    /// Attach reverse-DNS hostnames (when enabled) and emit the per-packet
    /// log line.
    async fn enrich(&self, record: PacketRecord, dns: Option<&DnsCache>) -> StoredRecord {
        let (src_hostname, dst_hostname) = match dns {
            Some(cache) => (
                cache.resolve(record.source).await,
                cache.resolve(record.destination).await,
            ),
            None => (None, None),
        };

        if dns.is_some() {
            match &dst_hostname {
                Some(host) => {
                    tracing::debug!("{} -> {} ({host})", record.source, record.destination)
                }
                None => {
                    tracing::debug!("{} -> {} (unresolved)", record.source, record.destination)
                }
            }
        } else {
            tracing::debug!("{} -> {}", record.source, record.destination);
        }

        StoredRecord {
            timestamp: record.timestamp.timestamp_millis(),
            src_ip: record.source.to_string(),
            dst_ip: record.destination.to_string(),
            protocol: record.protocol,
            length: record.length,
            src_hostname,
            dst_hostname,
        }
    }

    fn flush(&self, buffer: &mut Vec<StoredRecord>) {
        let mut conn = self.conn.lock().unwrap();
        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!("failed to start transaction: {e}");
                return;
            }
        };

        {
            let mut stmt = match tx.prepare(
                "INSERT INTO datagrams (timestamp, src_ip, dst_ip, protocol, length, src_hostname, dst_hostname)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    tracing::error!("failed to prepare statement: {e}");
                    return;
                }
            };

            for record in buffer.iter() {
                if let Err(e) = stmt.execute(params![
                    record.timestamp,
                    record.src_ip,
                    record.dst_ip,
                    record.protocol,
                    record.length,
                    record.src_hostname,
                    record.dst_hostname
                ]) {
                    tracing::error!("failed to insert record: {e}");
                }
            }
        }

        if let Err(e) = tx.commit() {
            tracing::error!("failed to commit transaction: {e}");
        } else {
            buffer.clear();
        }
    }

    pub fn query_history(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, src_ip, dst_ip, protocol, length, src_hostname, dst_hostname
             FROM datagrams ORDER BY timestamp DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            Ok(StoredRecord {
                timestamp: row.get(0)?,
                src_ip: row.get(1)?,
                dst_ip: row.get(2)?,
                protocol: row.get(3)?,
                length: row.get(4)?,
                src_hostname: row.get(5)?,
                dst_hostname: row.get(6)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_old_data(&self, older_than_seconds: u64) -> Result<usize> {
        let cutoff_ms = chrono::Utc::now().timestamp_millis() - (older_than_seconds as i64 * 1000);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM datagrams WHERE timestamp < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }
}
