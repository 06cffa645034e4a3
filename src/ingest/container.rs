// Capture container files
//
// A container is a header frame followed by payload frames. Paths ending in `.gz`
// are gzip-compressed end to end.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::errors::PipelineResult;

use super::frame::{FrameDecoder, FrameReader, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN};
use super::varint;

/// True when the path names a gzip container.
pub fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

/// Read tuning for containers.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub chunk_size: usize,
    pub max_frame_len: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Iterates the payload frames of one container file.
pub struct ContainerReader {
    path: PathBuf,
    frames: FrameReader<Box<dyn Read + Send>>,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = BufReader::new(File::open(&path)?);
        let source: Box<dyn Read + Send> = if is_gzip(&path) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let decoder = FrameDecoder::new().with_max_frame_len(options.max_frame_len);
        tracing::debug!(path = %path.display(), gzip = is_gzip(&path), "Opened container");

        Ok(Self {
            path,
            frames: FrameReader::new(source, decoder, options.chunk_size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header payload, available once the first data frame has been read.
    pub fn header(&self) -> Option<&[u8]> {
        self.frames.header()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames.frames_decoded()
    }

    pub fn next_frame(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        self.frames.next_frame()
    }
}

impl Iterator for ContainerReader {
    type Item = PipelineResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames.next()
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w,
        }
    }
}

/// Writes a container: the header frame up front, then one frame per record.
pub struct ContainerWriter {
    sink: Sink,
    prefix: Vec<u8>,
    records: u64,
}

impl ContainerWriter {
    pub fn create(path: impl AsRef<Path>, header: &[u8]) -> PipelineResult<Self> {
        let path = path.as_ref();
        let file = BufWriter::new(File::create(path)?);
        let sink = if is_gzip(path) {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };

        let mut writer = Self {
            sink,
            prefix: Vec::with_capacity(varint::MAX_VARINT_LEN),
            records: 0,
        };
        writer.write_frame(header)?;
        Ok(writer)
    }

    pub fn write_record(&mut self, payload: &[u8]) -> PipelineResult<()> {
        self.write_frame(payload)?;
        self.records += 1;
        Ok(())
    }

    /// Number of records written, header excluded.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush everything, including the gzip trailer.
    pub fn finish(self) -> PipelineResult<u64> {
        match self.sink {
            Sink::Plain(mut w) => w.flush()?,
            Sink::Gzip(w) => w.finish()?.flush()?,
        }
        Ok(self.records)
    }

    fn write_frame(&mut self, payload: &[u8]) -> PipelineResult<()> {
        self.prefix.clear();
        varint::encode(payload.len() as u64, &mut self.prefix);
        let out = self.sink.writer();
        out.write_all(&self.prefix)?;
        out.write_all(payload)?;
        Ok(())
    }
}
