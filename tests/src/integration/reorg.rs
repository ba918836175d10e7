//! # Fork Flows
//!
//! The writer truncates while a reader is connected. The reader adopts
//! the newer fork, keeps the shared prefix and refetches the rest.

#[cfg(test)]
mod tests {
    use omega_replication::{CoreEvent, DownloadRange, GetOptions};
    use tokio::time::timeout;

    use crate::fixtures::{connect, reader_of, wait_for, writer, WAIT};

    #[tokio::test]
    async fn test_reader_follows_writer_truncation() {
        let writer = writer();
        writer.append(&["a", "b", "c", "d", "e"]).await.unwrap();
        writer.truncate(5).await.unwrap();
        assert_eq!(writer.info().await.unwrap().fork, 1);

        let reader = reader_of(&writer);
        let mut events = reader.subscribe();
        connect(&writer, &reader).await;
        wait_for(&mut events, CoreEvent::Reorg { fork: 1, ancestors: 0 }).await;

        let mut download = reader.download(DownloadRange::new(0, 5)).await.unwrap();
        timeout(WAIT, download.done()).await.unwrap().unwrap();
        let info = reader.info().await.unwrap();
        assert_eq!((info.fork, info.length), (1, 5));

        let mut writer_events = writer.subscribe();
        writer.truncate(3).await.unwrap();
        writer.append(&["x", "y"]).await.unwrap();
        wait_for(
            &mut writer_events,
            CoreEvent::Truncate { length: 3, fork: 2 },
        )
        .await;

        wait_for(&mut events, CoreEvent::Reorg { fork: 2, ancestors: 3 }).await;
        assert!(reader.has(2).await.unwrap());
        assert!(!reader.has(3).await.unwrap());
        assert!(!reader.has(4).await.unwrap());

        let value = timeout(WAIT, reader.get(4, GetOptions::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(b"y".to_vec()));
        assert_eq!(
            reader.get(1, GetOptions::local()).await.unwrap(),
            Some(b"b".to_vec())
        );

        let info = reader.info().await.unwrap();
        assert_eq!((info.fork, info.length), (2, 5));
    }

    #[tokio::test]
    async fn test_truncation_to_zero_drops_everything() {
        let writer = writer();
        writer.append(&["a", "b"]).await.unwrap();
        let reader = reader_of(&writer);
        let mut events = reader.subscribe();
        connect(&writer, &reader).await;

        let mut download = reader.download(DownloadRange::new(0, 2)).await.unwrap();
        timeout(WAIT, download.done()).await.unwrap().unwrap();

        writer.truncate(0).await.unwrap();
        writer.append(&["fresh"]).await.unwrap();
        wait_for(&mut events, CoreEvent::Reorg { fork: 1, ancestors: 0 }).await;

        assert!(!reader.has(0).await.unwrap());
        assert!(!reader.has(1).await.unwrap());
        let value = timeout(WAIT, reader.get(0, GetOptions::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(b"fresh".to_vec()));
    }
}
