//! The boundary between the capture engine and everything that consumes
//! captured headers.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::Sender;

use crate::packet::{DecodeError, Ipv4Header};
use crate::stats::CaptureStats;

/// Owned summary of one captured datagram, handed to the sink at dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub length: u16,
}

impl PacketRecord {
    pub fn from_header(header: &Ipv4Header<'_>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: header.source,
            destination: header.destination,
            protocol: header.protocol,
            length: header.total_length,
        }
    }
}

/// Consumer of capture results.
///
/// Called synchronously from the receive thread, one dispatch at a time.
/// Errors returned here are contained at the dispatch boundary and never end
/// the receive cycle.
pub trait PacketSink: Send + Sync {
    fn on_header(&self, record: PacketRecord) -> anyhow::Result<()>;
    fn on_decode_error(&self, error: &DecodeError) -> anyhow::Result<()>;
}

/// Production sink: updates live stats and forwards each record to the
/// storage writer over a bounded channel.
pub struct ChannelSink {
    tx: Sender<PacketRecord>,
    stats: Arc<CaptureStats>,
}

impl ChannelSink {
    pub fn new(tx: Sender<PacketRecord>, stats: Arc<CaptureStats>) -> Self {
        Self { tx, stats }
    }
}

impl PacketSink for ChannelSink {
    fn on_header(&self, record: PacketRecord) -> anyhow::Result<()> {
        self.stats.record(&record);
        self.tx
            .blocking_send(record)
            .map_err(|_| anyhow::anyhow!("record channel closed"))
    }

    fn on_decode_error(&self, error: &DecodeError) -> anyhow::Result<()> {
        self.stats.record_decode_error();
        tracing::debug!("undecodable datagram: {error}");
        Ok(())
    }
}
