// Container files grouped for batch loading

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::metrics::RunContext;

use super::container::{ContainerReader, ReadOptions};
use super::record::RecordDecoder;
use super::sampling::Sampler;

/// Default number of files loaded together.
pub const DEFAULT_FILE_BATCH_SIZE: usize = 50;

/// A list of container files read in groups of `file_batch_size`.
pub struct FileSource<D> {
    files: Vec<PathBuf>,
    decoder: D,
    read_options: ReadOptions,
    file_batch_size: usize,
    sampler: Option<Sampler>,
}

impl<D: RecordDecoder> FileSource<D> {
    pub fn new(files: Vec<PathBuf>, decoder: D) -> Self {
        Self {
            files,
            decoder,
            read_options: ReadOptions::default(),
            file_batch_size: DEFAULT_FILE_BATCH_SIZE,
            sampler: None,
        }
    }

    pub fn with_read_options(mut self, read_options: ReadOptions) -> Self {
        self.read_options = read_options;
        self
    }

    pub fn with_file_batch_size(mut self, file_batch_size: usize) -> Self {
        self.file_batch_size = file_batch_size.max(1);
        self
    }

    pub fn with_sampler(mut self, sampler: Option<Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn file_batch_size(&self) -> usize {
        self.file_batch_size
    }

    /// Number of file groups per pass.
    pub fn group_count(&self) -> usize {
        self.files.len().div_ceil(self.file_batch_size)
    }

    /// File index range covered by group `index`, as used in checkpoint names.
    pub fn group_range(&self, index: usize) -> (u64, u64) {
        let start = index * self.file_batch_size;
        (start as u64, (start + self.file_batch_size) as u64)
    }

    /// Read every record of group `index`, in file order, then apply sampling.
    pub fn load_group(&mut self, index: usize, ctx: &mut RunContext) -> Result<Vec<D::Record>> {
        let start = index * self.file_batch_size;
        let end = (start + self.file_batch_size).min(self.files.len());
        let mut records = Vec::new();

        for path in &self.files[start.min(end)..end] {
            let mut reader = ContainerReader::open(path, self.read_options)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            ctx.ingest.sources += 1;

            while let Some(payload) = reader
                .next_frame()
                .with_context(|| format!("Failed to read {}", path.display()))?
            {
                ctx.ingest.frames += 1;
                match self.decoder.decode(payload) {
                    Some(record) => {
                        ctx.ingest.records += 1;
                        records.push(record);
                    }
                    None => ctx.ingest.malformed += 1,
                }
            }

            tracing::debug!(
                path = %path.display(),
                frames = reader.frames_decoded(),
                "Read container"
            );
        }

        if let Some(sampler) = self.sampler.as_mut() {
            let before = records.len();
            records = sampler.sample(records);
            ctx.ingest.sampled_out += (before - records.len()) as u64;
        }

        tracing::info!(
            group = index + 1,
            groups = self.group_count(),
            files = end.saturating_sub(start),
            records = records.len(),
            "Loaded file group"
        );
        Ok(records)
    }
}
