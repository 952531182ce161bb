use crate::flow::FlowRecord;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Write-only sink for completed flows. Each record is complete on its own,
/// so a run stopped midway leaves every already appended record intact.
pub trait FlowEmitter {
    fn append(&mut self, record: &FlowRecord) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FlowEmitter for Vec<FlowRecord> {
    fn append(&mut self, record: &FlowRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// One JSON object per line; bodies are base64 encoded.
pub struct JsonLinesEmitter<W: Write> {
    writer: W,
    written: usize,
}

impl JsonLinesEmitter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {parent:?}"))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {path:?}"))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl JsonLinesEmitter<BufWriter<io::Stdout>> {
    pub fn stdout() -> Self {
        Self::new(BufWriter::new(io::stdout()))
    }
}

impl<W: Write> JsonLinesEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> FlowEmitter for JsonLinesEmitter<W> {
    fn append(&mut self, record: &FlowRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .with_context(|| format!("Failed to write flow {}", record.id))?;
        self.writer
            .write_all(b"\n")
            .context("Failed to write flow separator")?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush flow output")
    }
}
