//! # Adversarial Flows
//!
//! A hand-driven peer speaking raw frames at a reader session: forged forks
//! signed with the wrong key, and a peer that takes requests and never
//! answers them.

use omega_core::Hash;
use omega_replication::{encode_frame, DuplexConnection, FrameDecoder, Message, Transport};

/// Raw protocol endpoint for one core, outside any session.
pub struct RoguePeer {
    connection: DuplexConnection,
    decoder: FrameDecoder,
    discovery_key: Hash,
}

impl RoguePeer {
    /// Open a channel for the core with `public_key`, with a capability
    /// that passes the remote's check.
    pub async fn open(connection: DuplexConnection, public_key: [u8; 32]) -> Self {
        let discovery_key = omega_crypto::discovery_key(&public_key);
        let capability = omega_crypto::capability(
            connection.is_initiator(),
            &connection.handshake_hash(),
            &public_key,
        );
        let mut rogue = Self {
            connection,
            decoder: FrameDecoder::new(),
            discovery_key,
        };
        rogue
            .send(Message::Open {
                channel: 0,
                discovery_key,
                capability,
            })
            .await;
        rogue
    }

    /// Announce a length and fork.
    pub async fn announce(&mut self, length: u64, fork: u64) {
        let discovery_key = self.discovery_key;
        self.send(Message::Info {
            discovery_key,
            length,
            fork,
        })
        .await;
    }

    /// Put one message on the wire.
    pub async fn send(&mut self, message: Message) {
        let frame = encode_frame(&message).expect("encodable message");
        let _ = self.connection.send(frame).await;
    }

    /// Next message from the remote, `None` once it hung up.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.decoder.next().expect("well-formed frames") {
                return Some(message);
            }
            let bytes = self.connection.recv().await?;
            self.decoder.push(&bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use omega_core::{Core, CoreConfig, ProofRequest};
    use omega_replication::{duplex, CoreEvent, GetOptions, Message};
    use tokio::time::timeout;

    use super::RoguePeer;
    use crate::fixtures::{connect, drain, reader_of, writer, WAIT};

    const BLOCKS: [&str; 5] = ["a", "b", "c", "d", "e"];

    // =============================================================================
    // FORGED FORKS
    // =============================================================================

    #[tokio::test]
    async fn test_forged_forks_get_the_peer_closed() {
        let writer = writer();
        writer.append(&BLOCKS).await.unwrap();
        let reader = reader_of(&writer);
        let mut events = reader.subscribe();

        // Same blocks under another key.
        let mut impostor = Core::memory(CoreConfig::for_testing()).unwrap();
        impostor.append(&BLOCKS).unwrap();

        let (rogue_end, reader_end) = duplex();
        reader.replicate(reader_end).await.unwrap();
        let key = writer.key();
        let rogue = tokio::spawn(async move {
            let mut rogue = RoguePeer::open(rogue_end, key).await;
            rogue.announce(5, 1).await;

            let mut answered = 0u64;
            while let Some(message) = rogue.next().await {
                match message {
                    Message::Request { id, request, .. } => {
                        let mut proof = impostor
                            .proof(&ProofRequest::upgrade(0, 0, 5))
                            .unwrap();
                        proof.fork = request.fork;
                        rogue
                            .send(Message::Data {
                                channel: 0,
                                request: id,
                                proof,
                            })
                            .await;
                        answered += 1;
                        rogue.announce(5, request.fork + 1).await;
                    }
                    Message::Close { .. } => break,
                    _ => {}
                }
            }
            answered
        });

        let answered = timeout(WAIT, rogue).await.unwrap().unwrap();
        assert_eq!(answered, 3);

        let info = reader.info().await.unwrap();
        assert_eq!((info.fork, info.length), (0, 0));
        let seen = drain(&mut events);
        assert!(seen.iter().any(|e| matches!(e, CoreEvent::PeerRemove { .. })));
        assert!(!seen.iter().any(|e| matches!(e, CoreEvent::Reorg { .. })));

        // The honest writer is still welcome.
        connect(&writer, &reader).await;
        let value = timeout(WAIT, reader.get(4, GetOptions::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(b"e".to_vec()));
    }

    // =============================================================================
    // SILENT PEERS
    // =============================================================================

    #[tokio::test]
    async fn test_requests_move_off_a_departed_peer() {
        let writer = writer();
        writer.append(&BLOCKS).await.unwrap();
        let reader = reader_of(&writer);
        let mut events = reader.subscribe();

        let (rogue_end, reader_end) = duplex();
        reader.replicate(reader_end).await.unwrap();
        let mut rogue = RoguePeer::open(rogue_end, writer.key()).await;
        rogue.announce(5, 0).await;
        rogue
            .send(Message::Have {
                channel: 0,
                start: 0,
                length: 5,
            })
            .await;

        let pending = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.get(3, GetOptions::default()).await })
        };

        // Swallow the first request so it is stuck on the rogue.
        let swallowed = timeout(WAIT, async {
            loop {
                match rogue.next().await {
                    Some(Message::Request { .. }) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .unwrap();
        assert!(swallowed);

        connect(&writer, &reader).await;
        drop(rogue);

        let value = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
        assert_eq!(value, Some(b"d".to_vec()));
        let left = timeout(WAIT, async {
            loop {
                if let Ok(CoreEvent::PeerRemove { .. }) = events.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(left.is_ok());
    }
}
