//! Stream fan-out.
//!
//! `tee` splits one byte stream into N independent lazy readers. Each reader
//! gets its own bounded buffer; the producer blocks once the slowest
//! consumer falls `high_water_chunks` behind, which keeps memory bounded
//! without ever dropping data.

use std::io;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use datafetch_core::storage::ByteStream;

/// Default high-water mark, in chunks, per reader.
pub const DEFAULT_HIGH_WATER_CHUNKS: usize = 16;

/// Bounded channel exposed as a byte stream. The sender side is used by
/// blocking extraction threads via `blocking_send`.
pub(crate) fn channel_stream(capacity: usize) -> (mpsc::Sender<io::Result<Bytes>>, ByteStream) {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(capacity.max(1));
    let stream: ByteStream = Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
        rx.recv().await.map(|item| (item, rx))
    }));
    (tx, stream)
}

/// Split `source` into exactly two independent streams.
pub(crate) fn tee_pair(source: ByteStream, high_water_chunks: usize) -> (ByteStream, ByteStream) {
    let mut streams = tee(source, 2, high_water_chunks);
    let second = streams
        .pop()
        .unwrap_or_else(|| Box::pin(futures_util::stream::empty()));
    let first = streams
        .pop()
        .unwrap_or_else(|| Box::pin(futures_util::stream::empty()));
    (first, second)
}

/// Split `source` into `outputs` independent streams.
pub fn tee(source: ByteStream, outputs: usize, high_water_chunks: usize) -> Vec<ByteStream> {
    let capacity = high_water_chunks.max(1);
    let mut senders = Vec::with_capacity(outputs);
    let mut streams: Vec<ByteStream> = Vec::with_capacity(outputs);

    for _ in 0..outputs {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(capacity);
        senders.push(Some(tx));
        streams.push(Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|item| (item, rx))
        })));
    }

    tokio::spawn(pump(source, senders));
    streams
}

async fn pump(mut source: ByteStream, mut senders: Vec<Option<mpsc::Sender<io::Result<Bytes>>>>) {
    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                let mut all_closed = true;
                for slot in senders.iter_mut() {
                    if let Some(tx) = slot {
                        // A closed receiver just stops receiving copies; the
                        // remaining readers keep going.
                        if tx.send(Ok(chunk.clone())).await.is_err() {
                            *slot = None;
                        } else {
                            all_closed = false;
                        }
                    }
                }
                if all_closed {
                    return;
                }
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                for slot in senders.iter_mut() {
                    if let Some(tx) = slot {
                        let _ = tx.send(Err(io::Error::new(kind, message.clone()))).await;
                    }
                }
                return;
            }
        }
    }
}
