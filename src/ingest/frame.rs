// Length-prefixed frame decoding
//
// A frame is a varint byte count followed by that many payload bytes. Chunks of any
// size are pushed in with `feed`; complete frames are pulled out with `next_frame`.
// A frame is only ever handed out whole.

use std::io::{ErrorKind, Read};

use crate::errors::{PipelineError, PipelineResult};

use super::varint::{self, Varint};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Consumed bytes are compacted out of the buffer once they reach this size.
const COMPACT_AT: usize = 64 * 1024;

/// Default size of the chunks `FrameReader` pulls from its source.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Length prefix of the frame at the read offset, once it has been parsed.
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    prefix_len: usize,
    payload_len: usize,
}

/// Incremental decoder for a stream of length-prefixed frames.
///
/// The first frame of a source is the header/schema record. It is kept aside
/// (see [`FrameDecoder::header`]) and never returned by `next_frame`, unless the
/// decoder was built with [`FrameDecoder::headerless`].
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    /// Stream offset of `buf[0]`.
    base_offset: u64,
    pending: Option<PendingFrame>,
    max_frame_len: usize,
    expect_header: bool,
    header: Option<Vec<u8>>,
    frames: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder for a capture container: the first frame is taken as the header.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            base_offset: 0,
            pending: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            expect_header: true,
            header: None,
            frames: 0,
        }
    }

    /// Decoder for bare framing with no header record.
    pub fn headerless() -> Self {
        Self {
            expect_header: false,
            ..Self::new()
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Header payload, once the first frame has been decoded.
    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    /// Number of data frames handed out so far (header excluded).
    pub fn frames_decoded(&self) -> u64 {
        self.frames
    }

    /// Bytes buffered but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Append a raw chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete data frame, or `None` if more input is needed.
    pub fn next_frame(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        loop {
            let Some(payload) = self.decode_one()? else {
                return Ok(None);
            };

            if self.expect_header && self.header.is_none() {
                tracing::debug!(header_len = payload.len(), "Consumed container header");
                self.header = Some(payload);
                continue;
            }

            self.frames += 1;
            return Ok(Some(payload));
        }
    }

    /// Signal end of input. Fails if a frame is only partly buffered.
    pub fn finish(&self) -> PipelineResult<()> {
        match self.buffered() {
            0 => Ok(()),
            buffered => Err(PipelineError::TruncatedStream { buffered }),
        }
    }

    fn decode_one(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        let frame = match self.pending {
            Some(frame) => frame,
            None => match varint::decode(&self.buf[self.pos..]) {
                Varint::Incomplete => return Ok(None),
                Varint::Overflow => {
                    return Err(PipelineError::MalformedLength {
                        offset: self.base_offset + self.pos as u64,
                    })
                }
                Varint::Complete { value, len } => {
                    let payload_len = usize::try_from(value)
                        .ok()
                        .filter(|&n| n <= self.max_frame_len)
                        .ok_or(PipelineError::OversizedFrame {
                            len: value,
                            max: self.max_frame_len,
                        })?;
                    let frame = PendingFrame {
                        prefix_len: len,
                        payload_len,
                    };
                    self.pending = Some(frame);
                    frame
                }
            },
        };

        let start = self.pos + frame.prefix_len;
        let end = start + frame.payload_len;
        if self.buf.len() < end {
            self.buf.reserve(end - self.buf.len());
            return Ok(None);
        }

        let payload = self.buf[start..end].to_vec();
        self.pos = end;
        self.pending = None;
        Ok(Some(payload))
    }

    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        if self.pos == self.buf.len() || self.pos >= COMPACT_AT {
            self.buf.drain(..self.pos);
            self.base_offset += self.pos as u64;
            self.pos = 0;
        }
    }
}

/// Pulls chunks from a reader and yields frame payloads.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, decoder: FrameDecoder, chunk_size: usize) -> Self {
        Self {
            inner,
            decoder,
            chunk: vec![0; chunk_size.max(1)],
            done: false,
        }
    }

    pub fn header(&self) -> Option<&[u8]> {
        self.decoder.header()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.decoder.frames_decoded()
    }

    /// Next payload; `Ok(None)` once the source is exhausted.
    pub fn next_frame(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            if self.done {
                return Ok(None);
            }

            let n = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // a compressed stream cut off mid-block
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.done = true;
                    return Err(PipelineError::TruncatedStream {
                        buffered: self.decoder.buffered(),
                    });
                }
                Err(e) => {
                    self.done = true;
                    return Err(e.into());
                }
            };

            if n == 0 {
                self.done = true;
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.feed(&self.chunk[..n]);
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = PipelineResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
