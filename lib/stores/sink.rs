use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{RecordSink, SourceRecord, StoreError};

/// Writes each record as one JSON line, for piping into an external shipper.
pub struct NdjsonSink<W = tokio::io::Stdout> {
    out: Mutex<W>,
}

impl NdjsonSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> NdjsonSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W> RecordSink for NdjsonSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    fn push<'a>(&'a self, records: &'a [SourceRecord]) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            let mut buffer = Vec::new();
            for record in records {
                serde_json::to_writer(&mut buffer, record)?;
                buffer.push(b'\n');
            }

            let mut out = self.out.lock().await;
            out.write_all(&buffer).await?;
            out.flush().await?;
            Ok(records.len())
        })
    }
}
