//! # Block Streams
//!
//! A read stream yields blocks of a session in index order; a write stream
//! appends whatever it is fed. Piping one into the other copies a core.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::trace;

use omega_core::CoreError;

use crate::application::session::{GetOptions, Hypercore};
use crate::domain::ReplicationError;

/// Blocks buffered ahead of a slow reader.
const READ_AHEAD: usize = 16;

/// Where a read stream starts and when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStreamOptions {
    /// First block.
    pub start: u64,
    /// End (exclusive). Without one the end depends on `live` and
    /// `snapshot`.
    pub end: Option<u64>,
    /// Never end; wait for blocks past the current length.
    pub live: bool,
    /// Without an `end`, stop at the length seen when the stream opened
    /// rather than whatever the length is when the reader gets there.
    pub snapshot: bool,
    /// Start at the length seen when the stream opened.
    pub tail: bool,
    /// Wait for missing blocks.
    pub wait: bool,
    /// Fail once no peer claims a missing block.
    pub if_available: bool,
}

impl Default for ReadStreamOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            live: false,
            snapshot: true,
            tail: false,
            wait: true,
            if_available: false,
        }
    }
}

impl ReadStreamOptions {
    /// Blocks `[start, end)`.
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            ..Self::default()
        }
    }

    /// Every block from `start` on, then every block appended later.
    pub fn live(start: u64) -> Self {
        Self {
            start,
            live: true,
            ..Self::default()
        }
    }

    /// Only blocks appended after the stream opened.
    pub fn tail() -> Self {
        Self {
            live: true,
            tail: true,
            ..Self::default()
        }
    }
}

/// Appends every write, split into blocks of at most `max_block_size`.
#[derive(Debug, Clone)]
pub struct WriteStream {
    core: Hypercore,
    max_block_size: Option<usize>,
}

impl WriteStream {
    /// Split writes into blocks of at most `size` bytes.
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = Some(size);
        self
    }

    /// Append `data`. Returns the number of blocks written.
    pub async fn write(&self, data: &[u8]) -> Result<u64, ReplicationError> {
        if data.is_empty() {
            return Ok(0);
        }
        let blocks: Vec<&[u8]> = match self.max_block_size {
            Some(0) => {
                return Err(CoreError::BadArgument("block size must be positive".to_string()).into())
            }
            Some(size) => data.chunks(size).collect(),
            None => vec![data],
        };
        self.core.append(&blocks).await?;
        Ok(blocks.len() as u64)
    }

    /// Write every item of `source` until it ends or fails.
    pub async fn write_all<S>(&self, mut source: S) -> Result<u64, ReplicationError>
    where
        S: Stream<Item = Result<Vec<u8>, ReplicationError>> + Unpin,
    {
        let mut written = 0;
        while let Some(data) = source.next().await {
            written += self.write(&data?).await?;
        }
        Ok(written)
    }
}

impl Hypercore {
    /// Stream blocks in index order.
    ///
    /// The stream ends at its end, or at the first error, or when a block is
    /// missing and `wait` is off.
    pub fn read_stream(
        &self,
        options: ReadStreamOptions,
    ) -> ReceiverStream<Result<Vec<u8>, ReplicationError>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD);
        tokio::spawn(feed(self.clone(), options, tx));
        ReceiverStream::new(rx)
    }

    /// Writer appending to this session, one block per write.
    pub fn write_stream(&self) -> WriteStream {
        WriteStream {
            core: self.clone(),
            max_block_size: None,
        }
    }
}

async fn feed(
    core: Hypercore,
    options: ReadStreamOptions,
    tx: mpsc::Sender<Result<Vec<u8>, ReplicationError>>,
) {
    let opened_at = match core.info().await {
        Ok(info) => info.length,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };
    let end = match options.end {
        Some(end) => Some(end),
        None if options.live => None,
        None if options.snapshot => Some(opened_at),
        None => None,
    };
    let follows_length = options.end.is_none() && !options.live && !options.snapshot;
    let get = GetOptions {
        wait: options.wait,
        if_available: options.if_available,
    };

    let mut index = if options.tail { opened_at } else { options.start };
    loop {
        if end.is_some_and(|end| index >= end) {
            break;
        }
        if follows_length {
            match core.info().await {
                Ok(info) if index >= info.length => break,
                Ok(_) => {}
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }

        let item = tokio::select! {
            item = core.get(index, get) => item,
            _ = tx.closed() => break,
        };
        let item = match item {
            Ok(Some(block)) => Ok(block),
            Ok(None) => break,
            Err(err) => Err(err),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
        index += 1;
    }
    trace!(index, "read stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::duplex;
    use crate::config::ReplicationConfig;
    use omega_core::CoreConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn writer() -> Hypercore {
        Hypercore::memory(CoreConfig::for_testing(), ReplicationConfig::for_testing()).unwrap()
    }

    async fn collect(stream: ReceiverStream<Result<Vec<u8>, ReplicationError>>) -> Vec<String> {
        let blocks: Vec<_> = timeout(WAIT, stream.collect::<Vec<_>>()).await.unwrap();
        blocks
            .into_iter()
            .map(|block| String::from_utf8(block.unwrap()).unwrap())
            .collect()
    }

    // =============================================================================
    // READ STREAMS
    // =============================================================================

    #[tokio::test]
    async fn test_read_stream_bounds() {
        let core = writer();
        core.append(&["hello", "multiple", "worlds"]).await.unwrap();

        let middle = core.read_stream(ReadStreamOptions::range(1, 2));
        assert_eq!(collect(middle).await, ["multiple"]);

        let rest = core.read_stream(ReadStreamOptions {
            start: 1,
            ..Default::default()
        });
        assert_eq!(collect(rest).await, ["multiple", "worlds"]);

        let head = core.read_stream(ReadStreamOptions {
            end: Some(2),
            ..Default::default()
        });
        assert_eq!(collect(head).await, ["hello", "multiple"]);

        let past = core.read_stream(ReadStreamOptions {
            start: 5,
            ..Default::default()
        });
        assert!(collect(past).await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_stops_at_opening_length() {
        let core = writer();
        core.append(&["a", "b"]).await.unwrap();

        let mut stream = core.read_stream(ReadStreamOptions::default());
        let first = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(first, b"a");
        core.append(&["c"]).await.unwrap();

        let rest: Vec<_> = timeout(WAIT, stream.collect::<Vec<_>>()).await.unwrap();
        assert_eq!(rest, vec![Ok(b"b".to_vec())]);
    }

    #[tokio::test]
    async fn test_live_stream_follows_appends() {
        let core = writer();
        core.append(&["a", "b"]).await.unwrap();
        let stream = core.read_stream(ReadStreamOptions::live(0));

        core.append(&["c"]).await.unwrap();
        core.append(&["d", "e"]).await.unwrap();

        let seen: Vec<_> = timeout(WAIT, stream.take(5).collect::<Vec<_>>())
            .await
            .unwrap();
        let seen: Vec<Vec<u8>> = seen.into_iter().map(Result::unwrap).collect();
        assert_eq!(seen, [b"a", b"b", b"c", b"d", b"e"]);
    }

    #[tokio::test]
    async fn test_tail_skips_existing_blocks() {
        let core = writer();
        core.append(&["a", "b"]).await.unwrap();
        let mut stream = core.read_stream(ReadStreamOptions::tail());
        // Let the stream see the current length before appending.
        tokio::time::sleep(Duration::from_millis(20)).await;

        core.append(&["c", "d"]).await.unwrap();
        let first = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(first, Ok(b"c".to_vec()));
        let second = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(second, Ok(b"d".to_vec()));
    }

    #[tokio::test]
    async fn test_missing_block_without_wait_ends_stream() {
        let writer = writer();
        writer.append(&["a", "b"]).await.unwrap();
        let auth = omega_core::Ed25519Authorization::from_public_key(writer.key()).unwrap();
        let reader = Hypercore::open(
            omega_core::CoreStorage::memory(),
            std::sync::Arc::new(auth),
            CoreConfig::for_testing(),
            ReplicationConfig::for_testing(),
        )
        .unwrap();

        let stream = reader.read_stream(ReadStreamOptions {
            end: Some(2),
            wait: false,
            ..Default::default()
        });
        assert!(collect(stream).await.is_empty());
    }

    // =============================================================================
    // WRITE STREAMS
    // =============================================================================

    #[tokio::test]
    async fn test_write_stream_splits_large_writes() {
        let core = writer();
        let written = core
            .write_stream()
            .max_block_size(100 * 1024)
            .write(&vec![0u8; 1024 * 1024])
            .await
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(core.info().await.unwrap().length, 11);

        for index in 0..10 {
            let block = core.get(index, GetOptions::local()).await.unwrap().unwrap();
            assert_eq!(block.len(), 100 * 1024);
        }
        let last = core.get(10, GetOptions::local()).await.unwrap().unwrap();
        assert_eq!(last.len(), 1024 * 1024 - 10 * 100 * 1024);
    }

    #[tokio::test]
    async fn test_zero_block_size_is_rejected() {
        let core = writer();
        let result = core.write_stream().max_block_size(0).write(b"x").await;
        assert!(matches!(
            result,
            Err(ReplicationError::Core(CoreError::BadArgument(_)))
        ));
        assert_eq!(core.write_stream().write(b"").await, Ok(0));
    }

    #[tokio::test]
    async fn test_read_stream_pipes_into_write_stream() {
        let source = writer();
        source.append(&["hello", "world"]).await.unwrap();
        let copy = writer();

        let written = copy
            .write_stream()
            .write_all(source.read_stream(ReadStreamOptions::default()))
            .await
            .unwrap();
        assert_eq!(written, 2);
        let blocks = collect(copy.read_stream(ReadStreamOptions::default())).await;
        assert_eq!(blocks, ["hello", "world"]);
    }

    #[tokio::test]
    async fn test_reader_streams_from_a_peer() {
        let writer = writer();
        writer.append(&["a", "b", "c"]).await.unwrap();
        let auth = omega_core::Ed25519Authorization::from_public_key(writer.key()).unwrap();
        let reader = Hypercore::open(
            omega_core::CoreStorage::memory(),
            std::sync::Arc::new(auth),
            CoreConfig::for_testing(),
            ReplicationConfig::for_testing(),
        )
        .unwrap();
        let (left, right) = duplex();
        writer.replicate(left).await.unwrap();
        reader.replicate(right).await.unwrap();

        let stream = reader.read_stream(ReadStreamOptions::range(0, 3));
        assert_eq!(collect(stream).await, ["a", "b", "c"]);
    }
}
