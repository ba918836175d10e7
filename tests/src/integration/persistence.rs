//! # Persistence Flows
//!
//! Sessions over file-backed cores, closed and reopened from their header.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use omega_core::{Core, CoreConfig, CoreError, CoreStorage, Ed25519Authorization};
    use omega_replication::{DownloadRange, GetOptions, Hypercore, ReplicationConfig};
    use tokio::time::timeout;

    use crate::fixtures::{connect, init_tracing, reader_of, WAIT};

    fn file_session(dir: &std::path::Path) -> Hypercore {
        init_tracing();
        let storage = CoreStorage::open_dir(dir).unwrap();
        let core = Core::open(
            storage,
            Arc::new(Ed25519Authorization::generate()),
            CoreConfig::default(),
        )
        .unwrap();
        Hypercore::new(core, ReplicationConfig::for_testing())
    }

    fn reopen(dir: &std::path::Path) -> Result<Core, CoreError> {
        Core::open_existing(CoreStorage::open_dir(dir)?, CoreConfig::default())
    }

    #[tokio::test]
    async fn test_writer_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let session = file_session(dir.path());
        let key = session.key();
        session.append(&["a", "b", "c"]).await.unwrap();
        session.truncate(2).await.unwrap();
        session.append(&["z"]).await.unwrap();
        session.close().await.unwrap();

        let core = reopen(dir.path()).unwrap();
        assert_eq!(core.key(), key);
        assert!(core.writable());
        assert_eq!((core.length(), core.fork()), (3, 1));
        assert_eq!(core.get(2).unwrap(), Some(b"z".to_vec()));

        // Still signs, and still serves.
        let session = Hypercore::new(core, ReplicationConfig::for_testing());
        session.append(&["d"]).await.unwrap();
        let reader = reader_of(&session);
        connect(&session, &reader).await;
        let value = timeout(WAIT, reader.get(3, GetOptions::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(b"d".to_vec()));
    }

    #[tokio::test]
    async fn test_reader_state_survives_reopen() {
        let writer = crate::fixtures::writer();
        writer.append(&["a", "b", "c"]).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let auth = Ed25519Authorization::from_public_key(writer.key()).unwrap();
        let reader = Hypercore::open(
            CoreStorage::open_dir(dir.path()).unwrap(),
            Arc::new(auth),
            CoreConfig::default(),
            ReplicationConfig::for_testing(),
        )
        .unwrap();
        connect(&writer, &reader).await;
        let mut download = reader.download(DownloadRange::new(1, 3)).await.unwrap();
        timeout(WAIT, download.done()).await.unwrap().unwrap();
        reader.close().await.unwrap();

        let core = reopen(dir.path()).unwrap();
        assert!(!core.writable());
        assert_eq!(core.length(), 3);
        assert!(!core.has(0));
        assert_eq!(core.get(1).unwrap(), Some(b"b".to_vec()));
        assert_eq!(core.get(2).unwrap(), Some(b"c".to_vec()));
    }

    #[test]
    fn test_empty_directory_has_no_core() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(reopen(dir.path()).unwrap_err(), CoreError::StorageEmpty);
    }
}
