//! # Core Service
//!
//! Ties the Merkle tree, the block payload store, the local bitfield and the
//! info header into one append-only log.
//!
//! ## Write path
//!
//! ```text
//! append(blocks) -> encrypt -> batch.append -> sign -> payloads -> bitfield -> commit -> flush
//! ```
//!
//! Signing happens before anything is written, so a refused signature leaves
//! the core exactly as it was.
//!
//! ## Replication path
//!
//! The responder answers with [`Core::proof`]; the requester checks the
//! answer with [`Core::verify`], which commits, stores the payload and marks
//! the block present.

use std::path::Path;
use std::sync::Arc;

use omega_crypto::{discovery_key, BlockEncryption, Ed25519KeyPair};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::adapters::auth::Ed25519Authorization;
use crate::adapters::file::FileStorage;
use crate::adapters::memory::MemoryStorage;
use crate::config::CoreConfig;
use crate::domain::{
    Bitfield, CoreError, Hash, Header, MerkleTree, Proof, ProofRequest, ReorgBatch, Seeker,
};
use crate::ports::outbound::{Authorization, RandomAccess};

/// The four storage regions of a core.
pub struct CoreStorage {
    /// Tree node records.
    pub tree: Box<dyn RandomAccess>,
    /// Block payloads.
    pub data: Box<dyn RandomAccess>,
    /// Bitfield pages.
    pub bitfield: Box<dyn RandomAccess>,
    /// Info header.
    pub info: Box<dyn RandomAccess>,
}

impl CoreStorage {
    /// Fresh in-memory regions.
    pub fn memory() -> Self {
        Self {
            tree: Box::new(MemoryStorage::new()),
            data: Box::new(MemoryStorage::new()),
            bitfield: Box::new(MemoryStorage::new()),
            info: Box::new(MemoryStorage::new()),
        }
    }

    /// One locked file per region under `dir`.
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> Result<Self, CoreError> {
        let dir = dir.as_ref();
        Ok(Self {
            tree: Box::new(FileStorage::open(dir.join("tree"))?),
            data: Box::new(FileStorage::open(dir.join("data"))?),
            bitfield: Box::new(FileStorage::open(dir.join("bitfield"))?),
            info: Box::new(FileStorage::open(dir.join("info"))?),
        })
    }
}

/// Snapshot of a core's public state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreInfo {
    /// Public key.
    pub key: [u8; 32],
    /// Discovery key derived from the public key.
    pub discovery_key: Hash,
    /// Length in blocks.
    pub length: u64,
    /// Length in bytes of stored blocks (padding included).
    pub byte_length: u64,
    /// Blocks present locally without gaps from index zero.
    pub contiguous_length: u64,
    /// Fork id.
    pub fork: u64,
    /// Bytes of padding per stored block.
    pub padding: usize,
    /// Whether appends can be signed locally.
    pub writable: bool,
}

/// Storage counters of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoreStats {
    /// Length in blocks.
    pub length: u64,
    /// Bytes of application data, padding excluded.
    pub byte_length: u64,
    /// Blocks stored locally.
    pub stored_blocks: u64,
    /// Blocks present locally without gaps from index zero.
    pub contiguous_length: u64,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Length after the append.
    pub length: u64,
    /// Byte length after the append.
    pub byte_length: u64,
}

/// What a verified proof changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Block stored by this proof, if it was new.
    pub downloaded: Option<u64>,
    /// Whether length or roots moved.
    pub upgraded: bool,
    /// Length after the proof.
    pub length: u64,
    /// Fork after the proof.
    pub fork: u64,
}

/// What an applied reorg changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgOutcome {
    /// Blocks kept from the old history.
    pub ancestors: u64,
    /// Length before the switch.
    pub previous_length: u64,
    /// Length after the switch.
    pub length: u64,
    /// Fork after the switch.
    pub fork: u64,
}

/// An append-only log.
pub struct Core {
    auth: Arc<dyn Authorization>,
    config: CoreConfig,
    header: Header,
    tree: MerkleTree,
    data: Box<dyn RandomAccess>,
    bitfield: Bitfield,
    info: Box<dyn RandomAccess>,
    encryption: Option<BlockEncryption>,
    discovery_key: Hash,
    contiguous_length: u64,
}

impl Core {
    /// Open or create the core guarded by `auth`.
    ///
    /// Fails with [`CoreError::StorageConflict`] if the storage holds a
    /// different core.
    #[instrument(skip_all)]
    pub fn open(
        mut storage: CoreStorage,
        auth: Arc<dyn Authorization>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let existing = if config.overwrite {
            None
        } else {
            Header::read_from(storage.info.as_ref())?
        };

        let fresh = existing.is_none();
        let header = match existing {
            Some(header) => {
                if header.public_key != auth.public_key() {
                    return Err(CoreError::StorageConflict);
                }
                header
            }
            None => {
                storage.tree.truncate(0)?;
                storage.data.truncate(0)?;
                storage.bitfield.truncate(0)?;
                Header::new(auth.public_key(), auth.secret_seed())
            }
        };

        let tree = MerkleTree::open(
            storage.tree,
            header.length,
            header.fork,
            header.signature.clone(),
        )?;
        let bitfield = Bitfield::open(storage.bitfield)?;
        let encryption = config.encryption_key.map(BlockEncryption::new);
        let discovery_key = discovery_key(&header.public_key);

        let mut core = Self {
            auth,
            config,
            header,
            tree,
            data: storage.data,
            bitfield,
            info: storage.info,
            encryption,
            discovery_key,
            contiguous_length: 0,
        };
        core.advance_contiguous();

        if fresh {
            core.header.write_to(core.info.as_mut())?;
        }

        info!(
            length = core.tree.length(),
            fork = core.tree.fork(),
            writable = core.writable(),
            "opened core"
        );
        Ok(core)
    }

    /// Reopen a core from its header alone.
    ///
    /// Writable when the header carries a secret seed. Fails with
    /// [`CoreError::StorageEmpty`] if nothing is stored.
    pub fn open_existing(storage: CoreStorage, config: CoreConfig) -> Result<Self, CoreError> {
        let header = Header::read_from(storage.info.as_ref())?.ok_or(CoreError::StorageEmpty)?;
        let auth: Arc<dyn Authorization> = match header.secret_key {
            Some(seed) => Arc::new(Ed25519Authorization::writer(Ed25519KeyPair::from_seed(seed))),
            None => Arc::new(Ed25519Authorization::from_public_key(header.public_key)?),
        };
        Self::open(
            storage,
            auth,
            CoreConfig {
                overwrite: false,
                ..config
            },
        )
    }

    /// In-memory core with a fresh signing key.
    pub fn memory(config: CoreConfig) -> Result<Self, CoreError> {
        Self::open(
            CoreStorage::memory(),
            Arc::new(Ed25519Authorization::generate()),
            config,
        )
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Public key.
    pub fn key(&self) -> [u8; 32] {
        self.header.public_key
    }

    /// Discovery key.
    pub fn discovery_key(&self) -> Hash {
        self.discovery_key
    }

    /// Length in blocks.
    pub fn length(&self) -> u64 {
        self.tree.length()
    }

    /// Length in bytes.
    pub fn byte_length(&self) -> u64 {
        self.tree.byte_length()
    }

    /// Fork id.
    pub fn fork(&self) -> u64 {
        self.tree.fork()
    }

    /// Whether appends can be signed.
    pub fn writable(&self) -> bool {
        self.auth.can_sign()
    }

    /// Bytes of padding per stored block.
    pub fn padding(&self) -> usize {
        self.encryption.as_ref().map_or(0, |e| e.padding())
    }

    /// The authorization policy.
    pub fn auth(&self) -> &Arc<dyn Authorization> {
        &self.auth
    }

    /// Configuration the core was opened with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The Merkle tree.
    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// The local bitfield.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Blocks present locally without gaps from index zero.
    pub fn contiguous_length(&self) -> u64 {
        self.contiguous_length
    }

    /// Snapshot of the public state.
    pub fn info(&self) -> CoreInfo {
        CoreInfo {
            key: self.key(),
            discovery_key: self.discovery_key,
            length: self.length(),
            byte_length: self.byte_length(),
            contiguous_length: self.contiguous_length,
            fork: self.fork(),
            padding: self.padding(),
            writable: self.writable(),
        }
    }

    /// Storage counters. The byte length leaves out per-block padding.
    pub fn stats(&self) -> CoreStats {
        let length = self.length();
        let padding = (self.padding() as u64).saturating_mul(length);
        CoreStats {
            length,
            byte_length: self.byte_length().saturating_sub(padding),
            stored_blocks: self.bitfield.count(0, length),
            contiguous_length: self.contiguous_length,
        }
    }

    /// Move the gapless prefix forward over blocks that are now present.
    fn advance_contiguous(&mut self) {
        let length = self.tree.length();
        let from = self.contiguous_length.min(length);
        self.contiguous_length = self.bitfield.first_missing(from, length).unwrap_or(length);
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Append blocks, signing the new root.
    pub fn append<B: AsRef<[u8]>>(&mut self, blocks: &[B]) -> Result<AppendOutcome, CoreError> {
        let auth = Arc::clone(&self.auth);
        self.append_as(auth.as_ref(), blocks)
    }

    /// Append blocks, signing the new root with `signer` instead of the
    /// core's own policy. The signature must still pass the core's policy.
    #[instrument(skip_all, fields(count = blocks.len()))]
    pub fn append_as<B: AsRef<[u8]>>(
        &mut self,
        signer: &dyn Authorization,
        blocks: &[B],
    ) -> Result<AppendOutcome, CoreError> {
        self.check_signer(signer)?;
        if blocks.is_empty() {
            return Ok(self.append_outcome());
        }

        let start = self.tree.length();
        let fork = self.tree.fork();
        let mut batch = self.tree.batch();
        let mut payloads = Vec::with_capacity(blocks.len());

        for (i, block) in blocks.iter().enumerate() {
            let index = start + i as u64;
            let stored = match &self.encryption {
                Some(encryption) => encryption.encrypt(index, block.as_ref(), fork),
                None => block.as_ref().to_vec(),
            };
            batch.append(&stored)?;
            payloads.push(stored);
        }

        let signable = batch.signable(self.auth.as_ref());
        batch.set_signature(self.sign_accepted(signer, &signable)?);

        let mut offset = self.tree.byte_length();
        for payload in &payloads {
            self.data.write(offset, payload)?;
            offset += payload.len() as u64;
        }

        let end = batch.length();
        self.tree.commit(batch)?;
        self.bitfield.set_range(start, end, true);
        self.advance_contiguous();
        self.flush()?;

        debug!(start, length = end, "appended blocks");
        Ok(self.append_outcome())
    }

    /// Split `data` into blocks of at most `max_chunk_size` bytes and append them.
    pub fn append_chunked(&mut self, data: &[u8]) -> Result<AppendOutcome, CoreError> {
        let auth = Arc::clone(&self.auth);
        self.append_chunked_as(auth.as_ref(), data)
    }

    /// [`append_chunked`](Self::append_chunked) signed by `signer`.
    pub fn append_chunked_as(
        &mut self,
        signer: &dyn Authorization,
        data: &[u8],
    ) -> Result<AppendOutcome, CoreError> {
        let size = self.config.max_chunk_size;
        if size == 0 {
            return Err(CoreError::BadArgument("chunk size must be positive".to_string()));
        }
        let chunks: Vec<&[u8]> = data.chunks(size).collect();
        self.append_as(signer, &chunks)
    }

    /// Shrink to `length` blocks, starting a new fork.
    pub fn truncate(&mut self, length: u64) -> Result<(), CoreError> {
        let auth = Arc::clone(&self.auth);
        self.truncate_as(auth.as_ref(), length)
    }

    /// [`truncate`](Self::truncate) signed by `signer`.
    #[instrument(skip(self, signer))]
    pub fn truncate_as(&mut self, signer: &dyn Authorization, length: u64) -> Result<(), CoreError> {
        self.check_signer(signer)?;

        let previous = self.tree.length();
        let byte_end = self.tree.byte_offset(length)?;
        let mut batch = self.tree.truncate(length, self.tree.fork() + 1)?;
        let signable = batch.signable(self.auth.as_ref());
        batch.set_signature(self.sign_accepted(signer, &signable)?);

        self.tree.commit(batch)?;
        self.bitfield.set_range(length, previous, false);
        self.contiguous_length = self.contiguous_length.min(length);
        self.data.truncate(byte_end)?;
        self.flush()?;

        info!(length, fork = self.tree.fork(), "truncated core");
        Ok(())
    }

    /// Drop the local copies of blocks `[start, end)`.
    ///
    /// The tree keeps every node, so cleared blocks can be fetched and
    /// verified again. Returns how many blocks were released.
    #[instrument(skip(self))]
    pub fn clear(&mut self, start: u64, end: u64) -> Result<u64, CoreError> {
        let end = end.min(self.tree.length());
        let mut cleared = 0;
        let mut index = start;
        while let Some(found) = self.bitfield.first_present(index, end) {
            let offset = self.tree.byte_offset(found)?;
            let size = self.tree.require_node(2 * found)?.size;
            self.data.del(offset, size)?;
            self.bitfield.set(found, false);
            cleared += 1;
            index = found + 1;
        }
        if cleared == 0 {
            return Ok(0);
        }

        self.contiguous_length = self.contiguous_length.min(start);
        self.bitfield.flush()?;
        self.data.sync()?;
        debug!(start, end, cleared, "cleared blocks");
        Ok(cleared)
    }

    fn check_signer(&self, signer: &dyn Authorization) -> Result<(), CoreError> {
        if !signer.can_sign() {
            return Err(CoreError::SessionNotWritable);
        }
        if signer.public_key() != self.key() {
            return Err(CoreError::Unauthorized);
        }
        Ok(())
    }

    /// Sign with `signer` and make sure the core's own policy accepts the
    /// result, so nothing is committed that readers would refuse.
    fn sign_accepted(&self, signer: &dyn Authorization, signable: &[u8]) -> Result<Vec<u8>, CoreError> {
        let signature = signer.sign(signable)?;
        if !self.auth.accept(signable, &signature) {
            return Err(CoreError::Unauthorized);
        }
        Ok(signature)
    }

    fn append_outcome(&self) -> AppendOutcome {
        AppendOutcome {
            length: self.tree.length(),
            byte_length: self.tree.byte_length(),
        }
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Whether block `index` is stored locally.
    pub fn has(&self, index: u64) -> bool {
        self.bitfield.get(index)
    }

    /// Decoded block `index`, or `None` if it is not stored.
    pub fn get(&self, index: u64) -> Result<Option<Vec<u8>>, CoreError> {
        if !self.has(index) {
            return Ok(None);
        }
        let raw = self.get_raw(index)?;
        self.decode_block(index, &raw).map(Some)
    }

    /// Stored bytes of block `index` (still encrypted, if encryption is on).
    pub fn get_raw(&self, index: u64) -> Result<Vec<u8>, CoreError> {
        if !self.has(index) {
            return Err(CoreError::BlockMissing(index));
        }
        let offset = self.tree.byte_offset(index)?;
        let size = self.tree.require_node(2 * index)?.size;
        self.data
            .read(offset, size)?
            .ok_or(CoreError::BlockMissing(index))
    }

    /// Turn stored bytes into the application's block.
    pub fn decode_block(&self, index: u64, raw: &[u8]) -> Result<Vec<u8>, CoreError> {
        match &self.encryption {
            Some(encryption) => Ok(encryption.decrypt(index, raw)?),
            None => Ok(raw.to_vec()),
        }
    }

    /// Start seeking to byte `bytes` of the stored stream.
    pub fn seek(&self, bytes: u64) -> Seeker {
        self.tree.seek(bytes)
    }

    /// Advance a seeker with the nodes stored so far.
    pub fn update_seeker(&self, seeker: &mut Seeker) -> Result<Option<(u64, u64)>, CoreError> {
        seeker.update(&self.tree)
    }

    /// Proof nodes a request for flat index `index` should ask for.
    pub fn missing_nodes(&self, index: u64) -> Result<u64, CoreError> {
        self.tree.missing_nodes(index)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Answer a remote request.
    ///
    /// Fails with [`CoreError::BlockMissing`] if a block is asked for that is
    /// not stored here.
    pub fn proof(&self, request: &ProofRequest) -> Result<Proof, CoreError> {
        if let Some(block) = request.block {
            if !self.has(block.index) {
                return Err(CoreError::BlockMissing(block.index));
            }
        }

        let mut proof = self.tree.proof(request)?;
        if let Some(block) = proof.block.as_mut() {
            block.value = self.get_raw(block.index)?;
        }
        Ok(proof)
    }

    /// Verify and store a remote proof.
    pub fn verify(&mut self, proof: &Proof) -> Result<VerifyOutcome, CoreError> {
        let batch = self.tree.verify(proof, self.auth.as_ref())?;
        let upgraded = batch.upgraded();
        self.tree.commit(batch)?;

        let mut downloaded = None;
        if let Some(block) = &proof.block {
            if !self.bitfield.get(block.index) {
                let offset = self.tree.byte_offset(block.index)?;
                self.data.write(offset, &block.value)?;
                self.bitfield.set(block.index, true);
                downloaded = Some(block.index);
            }
        }
        if downloaded == Some(self.contiguous_length) {
            self.advance_contiguous();
        }

        if upgraded {
            self.flush()?;
        } else {
            self.tree.flush()?;
            self.bitfield.flush()?;
        }

        Ok(VerifyOutcome {
            downloaded,
            upgraded,
            length: self.tree.length(),
            fork: self.tree.fork(),
        })
    }

    /// Begin adopting a higher fork proven by `proof`.
    pub fn reorg(&self, proof: &Proof) -> Result<ReorgBatch, CoreError> {
        self.tree.reorg(proof, self.auth.as_ref())
    }

    /// Feed one ancestor-search answer into `reorg`.
    pub fn update_reorg(&self, reorg: &mut ReorgBatch, proof: &Proof) -> Result<(), CoreError> {
        reorg.update(&self.tree, proof)
    }

    /// Switch to the history of a finished reorg.
    ///
    /// Blocks past the common prefix are dropped from the bitfield.
    #[instrument(skip_all, fields(fork = reorg.fork(), ancestors = reorg.ancestors()))]
    ///
    /// Fails with [`CoreError::ForkConflict`] unless the reorg's fork is newer
    /// than the current one.
    pub fn apply_reorg(&mut self, reorg: ReorgBatch) -> Result<ReorgOutcome, CoreError> {
        if reorg.fork() <= self.tree.fork() {
            return Err(CoreError::ForkConflict {
                local: self.tree.fork(),
                remote: reorg.fork(),
            });
        }
        let ancestors = reorg.ancestors();
        let previous_length = self.tree.length();

        self.tree.commit(reorg.into_batch()?)?;
        self.bitfield.set_range(ancestors, previous_length, false);
        self.contiguous_length = self.contiguous_length.min(ancestors);
        self.advance_contiguous();
        self.flush()?;

        info!(
            ancestors,
            length = self.tree.length(),
            fork = self.tree.fork(),
            "applied reorg"
        );
        Ok(ReorgOutcome {
            ancestors,
            previous_length,
            length: self.tree.length(),
            fork: self.tree.fork(),
        })
    }

    /// Persist the tree, the bitfield and the header.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        self.tree.flush()?;
        self.bitfield.flush()?;
        self.data.sync()?;

        self.header.fork = self.tree.fork();
        self.header.length = self.tree.length();
        self.header.signature = self.tree.signature().map(|s| s.to_vec());
        self.header.write_to(self.info.as_mut())
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("length", &self.length())
            .field("fork", &self.fork())
            .field("writable", &self.writable())
            .finish()
    }
}
