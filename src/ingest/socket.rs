// Live record ingestion over a local datagram socket
//
// Each datagram carries newline-separated lines of comma-separated fields. There is
// no acknowledgement or flow control: datagrams the kernel drops under load are lost.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixDatagram;

use crate::errors::{PipelineError, PipelineResult};
use crate::metrics::IngestCounters;

use super::record::{FieldRecord, Line, LineParser};

/// Default receive buffer, bytes per datagram.
pub const DEFAULT_RECV_BUFFER: usize = 512;

/// Output of the assembler, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// `batch_size` well-formed records, ready for the windower.
    Records(Vec<FieldRecord>),
    /// The header line reappeared: the sender started a new pass.
    EpochMarker,
}

/// Turns datagrams into groups of well-formed records.
#[derive(Debug)]
pub struct SocketRecordAssembler {
    parser: LineParser,
    batch_size: usize,
    pending: Vec<FieldRecord>,
    epoch: u64,
}

impl SocketRecordAssembler {
    pub fn new(parser: LineParser, batch_size: usize) -> PipelineResult<Self> {
        if batch_size == 0 {
            return Err(PipelineError::config("batch size must be at least 1"));
        }
        Ok(Self {
            parser,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            epoch: 0,
        })
    }

    /// Header markers seen so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Split a datagram into lines and classify each one.
    ///
    /// Malformed lines are dropped and counted; they never fail the stream.
    pub fn push_datagram(
        &mut self,
        datagram: &[u8],
        counters: &mut IngestCounters,
    ) -> Vec<SocketEvent> {
        counters.datagrams += 1;
        let mut events = Vec::new();

        for line in datagram.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            counters.lines += 1;
            match self.parser.classify(line) {
                Line::Record(record) => {
                    counters.records += 1;
                    self.pending.push(record);
                    if self.pending.len() >= self.batch_size {
                        let ready = std::mem::replace(
                            &mut self.pending,
                            Vec::with_capacity(self.batch_size),
                        );
                        events.push(SocketEvent::Records(ready));
                    }
                }
                Line::Marker => {
                    counters.markers += 1;
                    self.epoch += 1;
                    tracing::info!(epoch = self.epoch, "Header marker received, new epoch");
                    events.push(SocketEvent::EpochMarker);
                }
                Line::Malformed => {
                    counters.malformed += 1;
                    tracing::trace!(
                        fields = line.split(|&b| b == b',').count(),
                        expected = self.parser.arity(),
                        "Dropped malformed line"
                    );
                }
            }
        }
        events
    }

    /// Hand over whatever is pending, e.g. when the source ends.
    pub fn take_pending(&mut self) -> Vec<FieldRecord> {
        std::mem::take(&mut self.pending)
    }
}

/// A source of datagrams. `None` means the source has ended.
#[async_trait]
pub trait DatagramSource: Send {
    async fn next_datagram(&mut self) -> PipelineResult<Option<Vec<u8>>>;
}

/// Socket path for a named stream.
pub fn socket_path(stream: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{}.sock", stream))
}

/// Bound datagram socket receiving records from the collector.
pub struct DatagramListener {
    socket: UnixDatagram,
    path: PathBuf,
    buf: Vec<u8>,
}

impl DatagramListener {
    /// Bind at `path`, replacing a stale socket file left by an earlier run.
    pub fn bind(path: impl AsRef<Path>, recv_buffer: usize) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "Removed stale socket file");
        }

        let socket = UnixDatagram::bind(&path)?;
        tracing::info!(path = %path.display(), recv_buffer, "Listening for datagrams");

        Ok(Self {
            socket,
            path,
            buf: vec![0; recv_buffer.max(1)],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next datagram. Blocks indefinitely.
    pub async fn recv(&mut self) -> PipelineResult<&[u8]> {
        let n = self.socket.recv(&mut self.buf).await?;
        Ok(&self.buf[..n])
    }
}

#[async_trait]
impl DatagramSource for DatagramListener {
    async fn next_datagram(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        Ok(Some(self.recv().await?.to_vec()))
    }
}

/// Replays a fixed list of datagrams, then ends.
#[derive(Debug, Default)]
pub struct ReplaySource {
    datagrams: std::collections::VecDeque<Vec<u8>>,
}

impl ReplaySource {
    pub fn new(datagrams: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            datagrams: datagrams.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DatagramSource for ReplaySource {
    async fn next_datagram(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        Ok(self.datagrams.pop_front())
    }
}
