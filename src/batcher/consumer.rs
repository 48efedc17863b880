use super::Batch;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::io::Write;
use std::sync::Mutex;

/// Downstream receiver of flushed batches.
///
/// An `Err` tells the batcher the batch was not accepted; it is requeued and
/// retried on the next flush trigger.
pub trait BatchConsumer: Send + Sync {
    fn consume<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, Result<()>>;
}

/// Writes each batch as one JSON line
pub struct JsonLinesConsumer<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesConsumer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| anyhow::anyhow!("batch writer lock poisoned"))
    }

    fn write_batch(&self, batch: &Batch) -> Result<()> {
        let line = serde_json::to_string(batch).context("Failed to serialize batch")?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("batch writer lock poisoned"))?;
        writeln!(writer, "{}", line).context("Failed to write batch")?;
        writer.flush().context("Failed to flush batch writer")?;
        Ok(())
    }
}

impl<W: Write + Send> BatchConsumer for JsonLinesConsumer<W> {
    fn consume<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, Result<()>> {
        let result = self.write_batch(batch);
        Box::pin(futures::future::ready(result))
    }
}
