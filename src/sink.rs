//! Destinations for report blocks
//!
//! The reporter hands over whole multi-line blocks (a title plus up to
//! `page_lines` transaction lines, or a standalone anomaly block).

use parking_lot::Mutex;
use tracing::info;

/// Appends finished report blocks somewhere
pub trait LineSink: Send + Sync {
    fn append(&self, lines: &[String]);
}

/// Emits each block as one `info!` event on target `txtimer::report`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn append(&self, lines: &[String]) {
        info!(target: "txtimer::report", "\n{}", lines.join("\n"));
    }
}

/// Keeps every block in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    blocks: Mutex<Vec<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks received so far, in order
    pub fn blocks(&self) -> Vec<Vec<String>> {
        self.blocks.lock().clone()
    }

    /// All lines received so far, flattened
    pub fn lines(&self) -> Vec<String> {
        self.blocks.lock().iter().flatten().cloned().collect()
    }

    /// Remove and return everything received so far
    pub fn take(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.blocks.lock())
    }
}

impl LineSink for MemorySink {
    fn append(&self, lines: &[String]) {
        self.blocks.lock().push(lines.to_vec());
    }
}

/// Writes each block to stdout followed by a blank line
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl LineSink for StdoutSink {
    fn append(&self, lines: &[String]) {
        println!("{}\n", lines.join("\n"));
    }
}
