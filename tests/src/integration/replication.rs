//! # Replication Flows
//!
//! A writer and one or more readers exchanging blocks over duplex
//! connections:
//!
//! 1. **Download**: bounded ranges, chunked appends, remote seeks
//! 2. **Sharing**: concurrent wants for one block cost one request
//! 3. **Relaying**: a full reader serves other readers
//! 4. **Refusal**: peers for another core never count as sources

#[cfg(test)]
mod tests {
    use omega_core::CoreConfig;
    use omega_replication::{CoreEvent, DownloadRange, GetOptions, ReplicationError};
    use tokio::time::timeout;

    use crate::fixtures::{
        connect, drain, reader_of, reader_with, wait_for, writer, writer_with, WAIT,
    };

    const BLOCKS: [&str; 5] = ["a", "b", "c", "d", "e"];

    // =============================================================================
    // DOWNLOADS
    // =============================================================================

    #[tokio::test]
    async fn test_full_download() {
        let writer = writer();
        writer.append(&BLOCKS).await.unwrap();
        let reader = reader_of(&writer);
        connect(&writer, &reader).await;

        let mut download = reader.download(DownloadRange::new(0, 5)).await.unwrap();
        timeout(WAIT, download.done()).await.unwrap().unwrap();

        for (index, expected) in BLOCKS.iter().enumerate() {
            let value = reader.get(index as u64, GetOptions::local()).await.unwrap();
            assert_eq!(value, Some(expected.as_bytes().to_vec()));
        }
        let info = reader.info().await.unwrap();
        assert_eq!(info.length, 5);
        assert_eq!(info.contiguous_length, 5);
        assert!(!info.writable);
    }

    #[tokio::test]
    async fn test_chunked_append_replicates() {
        let data: Vec<u8> = (0..1u32 << 20).map(|i| (i % 251) as u8).collect();
        let writer = writer_with(CoreConfig::for_testing().with_max_chunk_size(100 * 1024));
        let outcome = writer.append_chunked(data.clone()).await.unwrap();
        assert_eq!(outcome.length, 11);
        assert_eq!(outcome.byte_length, 1 << 20);

        let reader = reader_of(&writer);
        let mut events = reader.subscribe();
        connect(&writer, &reader).await;
        wait_for(&mut events, CoreEvent::Append { length: 11 }).await;

        // Block 9 spans bytes 921600..1024000.
        let sought = timeout(WAIT, reader.seek(1_000_000)).await.unwrap();
        assert_eq!(sought, Ok((9, 78_400)));

        let mut download = reader.download(DownloadRange::new(0, 11)).await.unwrap();
        timeout(WAIT, download.done()).await.unwrap().unwrap();

        let mut joined = Vec::with_capacity(data.len());
        for index in 0..11 {
            let block = reader.get(index, GetOptions::local()).await.unwrap().unwrap();
            if index == 10 {
                assert_eq!(block.len(), 24 * 1024);
            } else {
                assert_eq!(block.len(), 100 * 1024);
            }
            joined.extend_from_slice(&block);
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_encrypted_replication() {
        let key = [7u8; 32];
        let writer = writer_with(CoreConfig::for_testing().with_encryption_key(key));
        writer.append(&["secret", "payload"]).await.unwrap();
        let reader = reader_with(&writer, CoreConfig::for_testing().with_encryption_key(key));
        connect(&writer, &reader).await;

        let value = timeout(WAIT, reader.get(1, GetOptions::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(b"payload".to_vec()));
    }

    // =============================================================================
    // SHARED REQUESTS
    // =============================================================================

    #[tokio::test]
    async fn test_concurrent_gets_share_one_request() {
        let writer = writer();
        writer.append(&BLOCKS).await.unwrap();
        let mut uploads = writer.subscribe();
        let reader = reader_of(&writer);
        connect(&writer, &reader).await;

        let gets: Vec<_> = (0..3)
            .map(|_| {
                let reader = reader.clone();
                tokio::spawn(async move { reader.get(3, GetOptions::default()).await })
            })
            .collect();
        for get in gets {
            let value = timeout(WAIT, get).await.unwrap().unwrap().unwrap();
            assert_eq!(value, Some(b"d".to_vec()));
        }

        // Anything duplicated for block 3 was sent before this request.
        reader.get(0, GetOptions::default()).await.unwrap();
        let mut served_three = 0;
        timeout(WAIT, async {
            loop {
                match uploads.recv().await {
                    Ok(CoreEvent::Upload { index: 0 }) => break,
                    Ok(CoreEvent::Upload { index: 3 }) => served_three += 1,
                    Ok(_) => {}
                    Err(err) => panic!("event stream failed: {err}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(served_three, 1);
    }

    // =============================================================================
    // RELAYING AND PEER CHURN
    // =============================================================================

    #[tokio::test]
    async fn test_full_reader_serves_late_reader() {
        let writer = writer();
        writer.append(&["a", "b", "c"]).await.unwrap();
        let seeder = reader_of(&writer);
        connect(&writer, &seeder).await;
        let mut download = seeder.download(DownloadRange::new(0, 3)).await.unwrap();
        timeout(WAIT, download.done()).await.unwrap().unwrap();

        // Waits with no peers at all, then the seeder shows up.
        let reader = reader_of(&writer);
        let pending = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.get(2, GetOptions::default()).await })
        };
        tokio::task::yield_now().await;
        connect(&seeder, &reader).await;

        let value = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
        assert_eq!(value, Some(b"c".to_vec()));
        assert_eq!(reader.info().await.unwrap().length, 3);
    }

    #[tokio::test]
    async fn test_departed_writer_leaves_nothing_available() {
        let writer = writer();
        writer.append(&["a", "b", "c"]).await.unwrap();
        let reader = reader_of(&writer);
        let mut events = reader.subscribe();
        connect(&writer, &reader).await;
        wait_for(&mut events, CoreEvent::Append { length: 3 }).await;

        writer.close().await.unwrap();
        let left = timeout(WAIT, async {
            loop {
                if let Ok(CoreEvent::PeerRemove { .. }) = events.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(left.is_ok());

        let result = timeout(WAIT, reader.get(1, GetOptions::if_available()))
            .await
            .unwrap();
        assert_eq!(result, Err(ReplicationError::BlockNotAvailable(1)));
        assert!(drain(&mut events)
            .iter()
            .all(|e| !matches!(e, CoreEvent::Download { .. })));
    }

    #[tokio::test]
    async fn test_peer_for_another_core_is_refused() {
        let writer = writer();
        writer.append(&BLOCKS).await.unwrap();
        let impostor = crate::fixtures::writer();
        impostor.append(&BLOCKS).await.unwrap();

        let reader = reader_of(&writer);
        connect(&impostor, &reader).await;

        let result = timeout(WAIT, reader.get(0, GetOptions::if_available()))
            .await
            .unwrap();
        assert_eq!(result, Err(ReplicationError::BlockNotAvailable(0)));
        assert_eq!(reader.info().await.unwrap().length, 0);
    }

    #[tokio::test]
    async fn test_range_cancel_over_connection() {
        let writer = writer();
        writer.append(&BLOCKS).await.unwrap();
        let reader = reader_of(&writer);
        connect(&writer, &reader).await;

        let mut open_ended = reader.download(DownloadRange::from(0)).await.unwrap();
        open_ended.destroy().await;
        assert_eq!(
            timeout(WAIT, open_ended.done()).await.unwrap(),
            Err(ReplicationError::RequestCancelled)
        );

        let mut bounded = reader
            .download(DownloadRange::new(1, 4).linear())
            .await
            .unwrap();
        timeout(WAIT, bounded.done()).await.unwrap().unwrap();
        for index in 1..4 {
            assert!(reader.has(index).await.unwrap());
        }
    }
}
