//! The block validation engine.
//!
//! A single strand (a task draining an unbounded queue) owns the fork tree,
//! the orphan pool, the pending-block map, the active-chain pointer and the
//! notifier. Worker stages run elsewhere: context-free checks on the
//! blocking pool before admission, and the chunked input checks fanned out
//! one blocking task per chunk. Every state transition of a given block is
//! totally ordered by the strand; workers communicate only by posting
//! messages back to it.

use std::{
    collections::HashMap,
    convert::TryFrom,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use quagga_chain::{
    block::{self, Block, BlockIterator, Field, Height},
    parameters::ChainParams,
    transaction,
    transparent::Script,
};
use quagga_state::{
    BlockData, BlockStore, TxOutputs, UndoBlock, UndoItem, UtxoError, UtxoStore,
};

use crate::{
    block::check::{self, ParsedBlock},
    block::context,
    error::{BlockError, TransactionError},
    flags::ValidationFlags,
    fork_tree::{ForkTree, NodeId, Status},
    mempool::Mempool,
    notifier::{Event, Notifier},
    script::{self, ScriptVerifier, StructuralVerifier},
    subsidy,
};

#[cfg(test)]
mod tests;

/// How deep a header fork may go before the node refuses to reorganize
/// without manual intervention.
const MAX_AUTO_REORG_DEPTH: i32 = 6;

/// Blocks within this many blocks of the header tip get full script
/// validation, and are announced to peers once connected.
const FRESHNESS_WINDOW: i32 = 1008;

/// Validation toggles, mostly for tests and trusted re-indexing.
#[derive(Clone, Copy, Debug)]
pub struct EngineSettings {
    /// Verify proof of work on incoming headers.
    pub check_pow: bool,
    /// Verify the merkle root commits to the transaction list.
    pub check_merkle_root: bool,
    /// Run the structural transaction checks.
    pub check_transaction_validity: bool,
    /// Check a block without mutating the UTXO set, detecting double
    /// spends through a per-block spend set instead.
    pub check_validity_only: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            check_pow: true,
            check_merkle_root: true,
            check_transaction_validity: true,
            check_validity_only: false,
        }
    }
}

/// A point-in-time summary of engine state.
#[derive(Clone, Copy, Debug)]
pub struct EngineStatus {
    /// Height of the best header tip, -1 when empty.
    pub header_height: i32,
    /// Height of the active (fully validated) tip, -1 when empty.
    pub active_height: i32,
    /// Headers on the best chain whose bodies have not been connected yet.
    pub awaiting_bodies: i32,
    /// Blocks parked with a body, waiting for their parent.
    pub parked: usize,
    /// Blocks whose parent header is unknown.
    pub orphans: usize,
}

/// Everything the engine talks to.
pub struct EngineHandles {
    pub utxo: Arc<dyn UtxoStore>,
    pub blocks: Arc<dyn BlockStore>,
    pub mempool: Arc<Mempool>,
    pub notifier: Notifier,
    pub verifier: Arc<dyn ScriptVerifier>,
    /// Feeds validation punishments back into the transport's ban scorer.
    pub punisher: Option<Arc<dyn Fn(i32, u32) + Send + Sync>>,
}

impl EngineHandles {
    /// Handles with a structural script verifier and no peer punishment.
    pub fn new(
        utxo: Arc<dyn UtxoStore>,
        blocks: Arc<dyn BlockStore>,
        mempool: Arc<Mempool>,
        notifier: Notifier,
    ) -> EngineHandles {
        EngineHandles {
            utxo,
            blocks,
            mempool,
            notifier,
            verifier: Arc::new(StructuralVerifier::default()),
            punisher: None,
        }
    }
}

type Reply = oneshot::Sender<Result<block::Hash, BlockError>>;

struct ChunkOutcome {
    fees: i64,
    sigops: u64,
    undo: UndoBlock,
    error: Option<BlockError>,
}

enum EngineMessage {
    Submit {
        bytes: Bytes,
        origin: Option<i32>,
        reply: Reply,
    },
    HeaderChecked {
        parsed: ParsedBlock,
        origin: Option<i32>,
        reply: Reply,
    },
    HeaderCheckFailed {
        error: BlockError,
        reply: Reply,
    },
    ChunkDone {
        hash: block::Hash,
        chunk: usize,
        outcome: ChunkOutcome,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    ReloadParams(ChainParams),
    Shutdown,
}

#[derive(Clone, Debug)]
struct TxMeta {
    hash: transaction::Hash,
    offset: u32,
}

struct RunState {
    flags: ValidationFlags,
    chunks_left: usize,
    undo_chunks: Vec<Option<UndoBlock>>,
    fees: i64,
    sigops: u64,
    error: Option<BlockError>,
}

/// A full block between header admission and finalization.
struct PendingBlock {
    bytes: Bytes,
    block: Arc<Block>,
    node: NodeId,
    origin: Option<i32>,
    replies: Vec<Reply>,
    run: Option<RunState>,
}

/// A block whose parent header is not known yet.
struct OrphanBlock {
    parsed: ParsedBlock,
    node: NodeId,
    origin: Option<i32>,
    replies: Vec<Reply>,
}

/// The public handle: cheap to clone, safe to use from any task.
#[derive(Clone)]
pub struct ValidationEngine {
    sender: mpsc::UnboundedSender<EngineMessage>,
    shutting_down: Arc<AtomicBool>,
}

impl ValidationEngine {
    /// Spawn the engine strand and return a handle to it.
    pub fn spawn(
        params: ChainParams,
        settings: EngineSettings,
        handles: EngineHandles,
    ) -> ValidationEngine {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let inner = Inner {
            params,
            settings,
            handles,
            tree: ForkTree::new(),
            active_tip: None,
            tip_flags: ValidationFlags::default(),
            orphans: Vec::new(),
            pending: HashMap::new(),
            validating: None,
            sender: sender.clone(),
            shutting_down: shutting_down.clone(),
        };
        tokio::spawn(inner.run(receiver));
        ValidationEngine {
            sender,
            shutting_down,
        }
    }

    /// Submit a serialized block (possibly header-only) for validation.
    ///
    /// Resolves when validation terminates: acceptance of a header,
    /// finalization of a full block, rejection at any stage, or shutdown.
    /// An orphan's future resolves once its parent chain arrives.
    pub async fn submit_block(
        &self,
        bytes: Bytes,
        origin: Option<i32>,
    ) -> Result<block::Hash, BlockError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BlockError::Shutdown);
        }
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(EngineMessage::Submit {
                bytes,
                origin,
                reply,
            })
            .map_err(|_| BlockError::Shutdown)?;
        receiver.await.map_err(|_| BlockError::Shutdown)?
    }

    /// A snapshot of the engine's chains and queues.
    pub async fn status(&self) -> Result<EngineStatus, BlockError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(EngineMessage::Status { reply })
            .map_err(|_| BlockError::Shutdown)?;
        receiver.await.map_err(|_| BlockError::Shutdown)
    }

    /// Publish a fresh `ChainParams` to the engine strand, as happens on
    /// reload-config.
    pub fn reload_params(&self, params: ChainParams) {
        let _ = self.sender.send(EngineMessage::ReloadParams(params));
    }

    /// Begin an orderly shutdown: in-flight work finishes with an error,
    /// new submissions are rejected.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.sender.send(EngineMessage::Shutdown);
    }
}

struct Inner {
    params: ChainParams,
    settings: EngineSettings,
    handles: EngineHandles,
    tree: ForkTree,
    active_tip: Option<NodeId>,
    /// Activation flags at the active tip, copied into each new block's
    /// validation run.
    tip_flags: ValidationFlags,
    orphans: Vec<OrphanBlock>,
    pending: HashMap<block::Hash, PendingBlock>,
    /// The block currently mutating the UTXO set, if any. Block-level
    /// transitions are serial; parallelism lives inside the chunk checks.
    validating: Option<block::Hash>,
    sender: mpsc::UnboundedSender<EngineMessage>,
    shutting_down: Arc<AtomicBool>,
}

impl Inner {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<EngineMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                EngineMessage::Submit {
                    bytes,
                    origin,
                    reply,
                } => self.handle_submit(bytes, origin, reply),
                EngineMessage::HeaderChecked {
                    parsed,
                    origin,
                    reply,
                } => self.handle_header_checked(parsed, origin, reply),
                EngineMessage::HeaderCheckFailed { error, reply } => {
                    let _ = reply.send(Err(error));
                }
                EngineMessage::ChunkDone {
                    hash,
                    chunk,
                    outcome,
                } => self.handle_chunk_done(hash, chunk, outcome),
                EngineMessage::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                EngineMessage::ReloadParams(params) => {
                    info!(network = %params.network, "chain parameters reloaded");
                    self.params = params;
                }
                EngineMessage::Shutdown => break,
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
        }
        self.cleanup();
    }

    /// Fail out every waiter so their owners release resources.
    fn cleanup(&mut self) {
        for (_, pending) in self.pending.drain() {
            for reply in pending.replies {
                let _ = reply.send(Err(BlockError::Shutdown));
            }
        }
        for orphan in self.orphans.drain(..) {
            for reply in orphan.replies {
                let _ = reply.send(Err(BlockError::Shutdown));
            }
        }
    }

    fn status(&self) -> EngineStatus {
        let header_height = self
            .tree
            .best_header()
            .map(|id| self.tree.get(id).height)
            .unwrap_or(-1);
        let active_height = self
            .active_tip
            .map(|id| self.tree.get(id).height)
            .unwrap_or(-1);
        EngineStatus {
            header_height,
            active_height,
            awaiting_bodies: header_height - active_height,
            parked: self.pending.len(),
            orphans: self.orphans.len(),
        }
    }

    /// Stage 1: dispatch the context-free checks to the worker pool.
    fn handle_submit(&mut self, bytes: Bytes, origin: Option<i32>, reply: Reply) {
        if self.shutting_down.load(Ordering::SeqCst) {
            let _ = reply.send(Err(BlockError::Shutdown));
            return;
        }
        let settings = self.settings;
        let params = self.params.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                check::checks1_no_context(bytes, &settings, &params, Utc::now())
            })
            .await;
            let message = match result {
                Ok(Ok(parsed)) => EngineMessage::HeaderChecked {
                    parsed,
                    origin,
                    reply,
                },
                Ok(Err(error)) => EngineMessage::HeaderCheckFailed { error, reply },
                Err(_) => EngineMessage::HeaderCheckFailed {
                    error: BlockError::Shutdown,
                    reply,
                },
            };
            let _ = sender.send(message);
        });
    }

    /// Stage 2, on the strand: duplicate detection, index linkage, orphan
    /// adoption, header-chain update, and body admission.
    fn handle_header_checked(
        &mut self,
        parsed: ParsedBlock,
        origin: Option<i32>,
        reply: Reply,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            let _ = reply.send(Err(BlockError::Shutdown));
            return;
        }
        let hash = parsed.hash;
        debug!(%hash, header_only = parsed.is_header_only(), "header checked");

        // Duplicate detection: merge into a pending validation.
        if let Some(pending) = self.pending.get_mut(&hash) {
            pending.replies.push(reply);
            return;
        }

        // Known-block checks against past work.
        if let Some(existing) = self.tree.by_hash(&hash) {
            if self.tree.get(existing).status.contains(Status::INVALID) {
                let _ = reply.send(Err(BlockError::BadParent));
                return;
            }
            if self.tree.get(existing).status.contains(Status::FULLY_VALIDATED) {
                let _ = reply.send(Ok(hash));
                return;
            }
        }

        let previous_best = self.tree.best_header();
        let is_genesis = hash == self.params.genesis_hash();
        let node = self.tree.insert(parsed.header, is_genesis);

        // A context-free failure still gets recorded so descendants are
        // rejected cheaply, unless the failure is transient or a wrong
        // transaction list may be to blame.
        if let Some(failure) = parsed.error {
            warn!(%hash, code = failure.code(), "block rejected");
            if failure.marks_subtree_invalid() {
                self.tree.mark_invalid(node);
                self.fail_invalid_pending();
            }
            self.punish(origin, failure.punishment());
            let _ = reply.send(Err(failure));
            return;
        }
        if self.tree.get(node).status.contains(Status::INVALID) {
            let failure = BlockError::BadParent;
            self.punish(origin, failure.punishment());
            let _ = reply.send(Err(failure));
            return;
        }

        // Orphan: wait for the parent chain.
        if self.tree.get(node).height < 0 {
            if self.settings.check_validity_only {
                let _ = reply.send(Err(BlockError::BadParent));
                return;
            }
            debug!(%hash, "parking orphan block");
            self.orphans.push(OrphanBlock {
                parsed,
                node,
                origin,
                replies: vec![reply],
            });
            metrics::gauge!("consensus.orphans", self.orphans.len() as _);
            return;
        }

        // Adopt any orphans that now connect through this block, and admit
        // every newly connected body.
        self.tree.connect_descendants(node);
        if self.tree.get(node).parent.is_some() || is_genesis {
            self.tree.add_status(node, Status::CHAIN_HEADERS_VALID);
        }
        self.admit_body(parsed, node, origin, vec![reply]);
        self.adopt_orphans(node);

        // Header-chain update and reorg probing.
        let best = self.tree.best_header();
        if best != previous_best {
            if let Some(best) = best {
                info!(
                    height = self.tree.get(best).height,
                    hash = %self.tree.get(best).hash,
                    "new best header"
                );
            }
            self.maybe_reorg();
        }
        self.try_schedule();
    }

    /// Recursively re-link orphans onto the newly connected subtree.
    fn adopt_orphans(&mut self, node: NodeId) {
        let mut connected = vec![node];
        while let Some(parent) = connected.pop() {
            let parent_hash = self.tree.get(parent).hash;
            let mut index = 0;
            while index < self.orphans.len() {
                if self.orphans[index].parsed.header.previous_block_hash == parent_hash {
                    let orphan = self.orphans.remove(index);
                    // Orphans whose parent was also an orphan were linked at
                    // insertion and already connected through it.
                    if self.tree.get(orphan.node).parent.is_none() {
                        self.tree.adopt(orphan.node, parent);
                    } else if self.tree.get(orphan.node).height < 0 {
                        self.tree.connect(orphan.node);
                    }
                    self.tree.connect_descendants(orphan.node);
                    self.tree
                        .add_status(orphan.node, Status::CHAIN_HEADERS_VALID);
                    debug!(
                        hash = %orphan.parsed.hash,
                        height = self.tree.get(orphan.node).height,
                        "adopted orphan"
                    );
                    self.admit_body(orphan.parsed, orphan.node, orphan.origin, orphan.replies);
                    connected.push(orphan.node);
                } else {
                    index += 1;
                }
            }
        }
        metrics::gauge!("consensus.orphans", self.orphans.len() as _);
    }

    /// Park a full body for validation, or complete a header-only
    /// submission.
    fn admit_body(
        &mut self,
        parsed: ParsedBlock,
        node: NodeId,
        origin: Option<i32>,
        replies: Vec<Reply>,
    ) {
        match parsed.block {
            Some(block) => {
                self.tree.get_mut(node).tx_count = block.transactions.len() as u32;
                self.pending.insert(
                    parsed.hash,
                    PendingBlock {
                        bytes: parsed.bytes,
                        block,
                        node,
                        origin,
                        replies,
                        run: None,
                    },
                );
            }
            None => {
                // Header-only blocks are complete once admitted.
                for reply in replies {
                    let _ = reply.send(Ok(parsed.hash));
                }
            }
        }
    }

    /// If the best header tip left the active chain, replay onto it.
    ///
    /// Deferred while a block is mid-validation; `try_schedule` retries
    /// once the strand is quiet again.
    fn maybe_reorg(&mut self) {
        if self.validating.is_some() {
            return;
        }
        let (best, active) = match (self.tree.best_header(), self.active_tip) {
            (Some(best), Some(active)) => (best, active),
            _ => return,
        };
        if self.tree.contains(best, active) {
            return;
        }
        let fork = match self.tree.fork_point(best, active) {
            Some(fork) => fork,
            None => return,
        };
        let depth = self.tree.get(active).height - self.tree.get(fork).height;
        if depth > MAX_AUTO_REORG_DEPTH {
            warn!(
                depth,
                "header reorg deeper than {} blocks requires manual intervention",
                MAX_AUTO_REORG_DEPTH
            );
            return;
        }
        info!(
            depth,
            old_tip = %self.tree.get(active).hash,
            new_target = %self.tree.get(best).hash,
            "header reorg detected"
        );
        if let Err(failure) = self.prepare_chain() {
            self.fatal(failure);
        }
    }

    /// Walk the active chain back until it is a prefix of the header chain,
    /// then hand the disconnected transactions back to the mempool.
    fn prepare_chain(&mut self) -> Result<(), BlockError> {
        let mut reverted: Vec<Arc<Block>> = Vec::new();

        loop {
            let (best, active) = match (self.tree.best_header(), self.active_tip) {
                (Some(best), Some(active)) => (best, active),
                _ => break,
            };
            if self.tree.contains(best, active) {
                break;
            }
            reverted.push(self.disconnect_tip()?);
        }

        // Re-admit disconnected transactions, oldest block first, only
        // after the UTXO view has settled; they would otherwise conflict
        // with themselves.
        for block in reverted.iter().rev() {
            for tx in block.transactions.iter().skip(1) {
                self.handles
                    .notifier
                    .publish(Event::TxSyncedOutOfBlock(tx.clone()));
                self.handles.mempool.re_admit(tx.clone());
            }
        }
        if !reverted.is_empty() {
            self.handles.notifier.publish(Event::MempoolUpdated);
        }
        Ok(())
    }

    /// Disconnect the active tip: apply its undo data to the UTXO set and
    /// step the active pointer back.
    fn disconnect_tip(&mut self) -> Result<Arc<Block>, BlockError> {
        let tip = self.active_tip.ok_or(BlockError::UtxoInconsistent)?;
        let height = self.tree.get(tip).height;
        if height <= 0 {
            return Err(BlockError::UtxoInconsistent);
        }
        let height = height as u32;
        info!(height, hash = %self.tree.get(tip).hash, "removing chain tip (rollback)");

        let bytes = self
            .handles
            .blocks
            .block_at_height(height)
            .map_err(|_| BlockError::BlockDataMissing)?;
        let block = Arc::new(
            Block::deserialize_from_buf(&mut bytes::BytesMut::from(&bytes[..]))
                .map_err(|_| BlockError::BlockDataMissing)?,
        );
        let undo = self
            .handles
            .blocks
            .undo_at_height(height)
            .map_err(|_| BlockError::BlockDataMissing)?;

        for item in &undo.created {
            // Outputs already consumed inside the block itself are gone.
            let _ = self
                .handles
                .utxo
                .remove(item.tx, item.index, None)
                .map_err(|_| BlockError::UtxoInconsistent)?;
        }
        for item in &undo.spent {
            // An output both created and spent by this block vanishes with
            // it; everything else is restored from block storage.
            if item.height == height {
                continue;
            }
            self.handles
                .utxo
                .insert(item.tx, item.index, item.height, item.offset)
                .map_err(|_| BlockError::UtxoInconsistent)?;
        }

        let parent = self
            .tree
            .get(tip)
            .parent
            .ok_or(BlockError::UtxoInconsistent)?;
        self.handles
            .utxo
            .block_finished(self.tree.get(parent).height as u32, self.tree.get(parent).hash)
            .map_err(|_| BlockError::UtxoInconsistent)?;
        self.handles.blocks.unstore_height(height);
        self.active_tip = Some(parent);
        metrics::counter!("consensus.blocks.disconnected", 1);
        Ok(block)
    }

    /// Start validating the next eligible parked block, if any.
    fn try_schedule(&mut self) {
        if self.validating.is_some() || self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.maybe_reorg();
        let best = match self.tree.best_header() {
            Some(best) => best,
            None => return,
        };
        let candidate = self.pending.iter().find_map(|(hash, pending)| {
            let node = pending.node;
            if !self.tree.contains(best, node) {
                return None;
            }
            let eligible = match self.tree.get(node).parent {
                None => self.tree.get(node).height == 0 && self.active_tip.is_none(),
                Some(parent) => self.active_tip == Some(parent),
            };
            if eligible {
                Some(*hash)
            } else {
                None
            }
        });
        if let Some(hash) = candidate {
            self.start_validation(hash);
        }
    }

    /// Stage 3, on the strand: contextual checks, UTXO pre-insert with the
    /// CTOR check, then fan out the chunked input checks.
    fn start_validation(&mut self, hash: block::Hash) {
        let (node, block, size) = {
            let pending = self.pending.get(&hash).expect("candidate is pending");
            (pending.node, pending.block.clone(), pending.bytes.len())
        };
        let height = self.tree.get(node).height;
        debug!(%hash, height, "starting body validation");

        let mut flags = self.tip_flags;
        let best_height = self
            .tree
            .best_header()
            .map(|id| self.tree.get(id).height)
            .unwrap_or(height);
        flags.enable_validation = best_height - height < FRESHNESS_WINDOW;

        if let Err(failure) =
            context::checks2_have_parent_headers(&self.tree, node, &block, size, &flags, &self.params)
        {
            let pending = self.pending.remove(&hash).expect("candidate is pending");
            self.fail_block(pending, failure);
            self.try_schedule();
            return;
        }
        flags.update_for_block(&self.tree, node, &self.params);
        self.tree.add_status(node, Status::PARENT_VALID | Status::BODY_CHECKED);

        // Genesis connects without touching the UTXO set; its coinbase is
        // unspendable.
        if self.tree.get(node).parent.is_none() {
            self.validating = Some(hash);
            let pending = self.pending.remove(&hash).expect("candidate is pending");
            self.finalize_connected(pending, flags, UndoBlock::default(), 0, 0);
            return;
        }

        // Single pass over the raw block: collect per-transaction metadata
        // and outputs, enforcing canonical transaction order as we go.
        let (tx_meta, block_data) = match Self::scan_block(&self.pending[&hash].bytes, height as u32, &flags)
        {
            Ok(result) => result,
            Err(failure) => {
                let pending = self.pending.remove(&hash).expect("candidate is pending");
                self.fail_block(pending, failure);
                self.try_schedule();
                return;
            }
        };

        // Insert every output this block creates before the parallel input
        // checks; contention stays out of the hot path.
        if !self.settings.check_validity_only {
            if let Err(failure) = self.handles.utxo.insert_all(&block_data) {
                let pending = self.pending.remove(&hash).expect("candidate is pending");
                self.fail_block(pending, map_utxo_error(failure));
                self.try_schedule();
                return;
            }
        }

        let tx_count = block.transactions.len();
        let chunks = std::cmp::max(1, std::cmp::min(num_cpus::get(), tx_count));
        let per_chunk = (tx_count + chunks - 1) / chunks;
        let tx_meta = Arc::new(tx_meta);
        let spent_map: Arc<Mutex<HashMap<transaction::Hash, Vec<u32>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        for chunk in 0..chunks {
            let start = chunk * per_chunk;
            let end = std::cmp::min(start + per_chunk, tx_count);
            let block = block.clone();
            let tx_meta = tx_meta.clone();
            let utxo = self.handles.utxo.clone();
            let verifier = self.handles.verifier.clone();
            let spent_map = spent_map.clone();
            let sender = self.sender.clone();
            let check_validity_only = self.settings.check_validity_only;
            let height = height as u32;
            tokio::task::spawn_blocking(move || {
                let outcome = check_chunk(
                    &block,
                    &tx_meta,
                    start..end,
                    height,
                    flags,
                    utxo,
                    verifier,
                    check_validity_only,
                    spent_map,
                );
                let _ = sender.send(EngineMessage::ChunkDone {
                    hash,
                    chunk,
                    outcome,
                });
            });
        }

        let pending = self.pending.get_mut(&hash).expect("candidate is pending");
        pending.run = Some(RunState {
            flags,
            chunks_left: chunks,
            undo_chunks: vec![None; chunks],
            fees: 0,
            sigops: 0,
            error: None,
        });
        self.validating = Some(hash);
    }

    /// Walk the serialized block once, yielding per-transaction metadata
    /// and the bulk-insert data, and checking CTOR where active.
    fn scan_block(
        bytes: &Bytes,
        height: u32,
        flags: &ValidationFlags,
    ) -> Result<(Vec<TxMeta>, BlockData), BlockError> {
        let mut iter =
            BlockIterator::new(bytes.clone()).map_err(|_| BlockError::BlockDataMissing)?;
        let mut tx_meta = Vec::new();
        let mut outputs = Vec::new();
        let mut current: Vec<(i64, Bytes)> = Vec::new();
        let mut pending_value = None;
        let mut previous_txid: Option<transaction::Hash> = None;
        loop {
            match iter.next_field().map_err(|_| BlockError::BlockDataMissing)? {
                Field::OutputValue(value) => pending_value = Some(value),
                Field::OutputScript(script) => {
                    let value = pending_value.take().ok_or(BlockError::BlockDataMissing)?;
                    current.push((value, script));
                }
                Field::TxEnd => {
                    let tx_ref = iter.prev_tx().expect("prev_tx is set at TxEnd");
                    let txid = tx_ref.hash();
                    let tx_index = tx_meta.len();
                    // Transactions appear in strictly increasing txid order
                    // after the coinbase, once CTOR is active.
                    if flags.hf201811_active && tx_index > 1 {
                        if let Some(previous) = previous_txid {
                            if txid <= previous {
                                return Err(BlockError::NotCtorOrdered);
                            }
                        }
                    }
                    if tx_index >= 1 {
                        previous_txid = Some(txid);
                    }
                    let offset = tx_ref.offset_in_block() as u32;
                    let mut tx_outputs = Vec::with_capacity(current.len());
                    for (value, script) in current.drain(..) {
                        let value = quagga_chain::amount::Amount::try_from(value)
                            .map_err(|_| TransactionError::InvalidValue)?;
                        tx_outputs.push((value, Script(script.to_vec())));
                    }
                    outputs.push(TxOutputs {
                        tx: txid,
                        offset_in_block: offset,
                        outputs: tx_outputs,
                    });
                    tx_meta.push(TxMeta { hash: txid, offset });
                }
                Field::End => break,
                _ => {}
            }
        }
        Ok((tx_meta, BlockData { height, outputs }))
    }

    /// Stage 4: aggregate one chunk's results; the last chunk triggers
    /// finalization.
    fn handle_chunk_done(&mut self, hash: block::Hash, chunk: usize, outcome: ChunkOutcome) {
        let pending = match self.pending.get_mut(&hash) {
            Some(pending) => pending,
            None => return,
        };
        let run = match pending.run.as_mut() {
            Some(run) => run,
            None => return,
        };
        run.undo_chunks[chunk] = Some(outcome.undo);
        run.fees += outcome.fees;
        run.sigops += outcome.sigops;
        if let Some(error) = outcome.error {
            run.error.get_or_insert(error);
        }
        run.chunks_left -= 1;
        if run.chunks_left > 0 {
            return;
        }

        // Last chunk landed: finalize on the strand.
        let mut pending = self.pending.remove(&hash).expect("pending checked above");
        let run = pending.run.take().expect("run checked above");
        self.validating = None;

        if self.shutting_down.load(Ordering::SeqCst) {
            self.handles.utxo.rollback();
            for reply in pending.replies {
                let _ = reply.send(Err(BlockError::Shutdown));
            }
            return;
        }
        if let Some(failure) = run.error {
            self.fail_block(pending, failure);
            self.try_schedule();
            return;
        }

        // Block-level limits that need the summed chunk results.
        let size = pending.bytes.len();
        if run.sigops > self.params.sigop_accept_limit(size) {
            self.fail_block(pending, BlockError::TooManySigOps);
            self.try_schedule();
            return;
        }
        if run.flags.enable_validation {
            let height = Height(self.tree.get(pending.node).height as u32);
            let subsidy = subsidy::block_subsidy(height, self.params.network)
                .map(|amount| amount.value())
                .unwrap_or(0);
            let coinbase_out: i64 = pending.block.transactions[0]
                .outputs
                .iter()
                .map(|output| output.value.value())
                .sum();
            if coinbase_out > subsidy + run.fees {
                self.fail_block(pending, BlockError::BadCoinbaseAmount);
                self.try_schedule();
                return;
            }
        }

        let mut undo = UndoBlock::default();
        let flags = run.flags;
        for chunk_undo in run.undo_chunks {
            undo.append(chunk_undo.unwrap_or_default());
        }
        let sigops = run.sigops;
        let fees = run.fees;
        self.finalize_connected(pending, flags, undo, fees, sigops);
    }

    /// Commit a validated block: persist, advance the UTXO best block, set
    /// the active tip, notify, and wake any waiting child.
    fn finalize_connected(
        &mut self,
        pending: PendingBlock,
        flags: ValidationFlags,
        undo: UndoBlock,
        fees: i64,
        _sigops: u64,
    ) {
        let node = pending.node;
        let hash = self.tree.get(node).hash;
        let height = self.tree.get(node).height as u32;

        if !self.settings.check_validity_only {
            if let Err(failure) = self
                .handles
                .blocks
                .store_block(height, pending.bytes.clone())
            {
                self.fail_block(pending, map_utxo_error(failure));
                return;
            }
            if !undo.is_empty() {
                if let Err(failure) = self.handles.blocks.store_undo(height, &undo) {
                    self.fail_block(pending, map_utxo_error(failure));
                    return;
                }
            }
            if let Err(failure) = self.handles.utxo.block_finished(height, hash) {
                self.fail_block(pending, map_utxo_error(failure));
                return;
            }
        }

        self.tree.add_status(node, Status::FULLY_VALIDATED);
        self.active_tip = Some(node);
        self.validating = None;
        self.tip_flags = flags;

        self.handles.mempool.remove_confirmed(
            pending.block.transactions.iter().map(|tx| tx.hash()),
        );
        self.handles.mempool.clear_recent_rejects();

        let best_height = self
            .tree
            .best_header()
            .map(|id| self.tree.get(id).height)
            .unwrap_or(height as i32);
        let is_initial_sync = self.orphans.len() > 3;

        self.handles
            .notifier
            .publish(Event::AllTransactionsInBlock(pending.block.clone()));
        self.handles.notifier.publish(Event::BlockTipChanged {
            hash,
            height,
            is_initial_sync,
        });
        self.handles.notifier.publish(Event::MempoolUpdated);
        if best_height - (height as i32) < FRESHNESS_WINDOW {
            self.handles.notifier.publish(Event::RelayBlock(hash));
        }

        metrics::counter!("consensus.blocks.connected", 1);
        metrics::gauge!("consensus.active.height", height as _);
        if flags.enable_validation || height % 500 == 0 {
            info!(%hash, height, fees, "new best block");
        }

        for reply in pending.replies {
            let _ = reply.send(Ok(hash));
        }
        self.try_schedule();
    }

    /// A block failed: roll the staged UTXO changes back, record the
    /// failure in the tree, punish the source, and wake the waiters.
    fn fail_block(&mut self, pending: PendingBlock, failure: BlockError) {
        warn!(
            hash = %self.tree.get(pending.node).hash,
            code = failure.code(),
            "block failed validation"
        );
        self.validating = None;
        self.handles.utxo.rollback();

        if failure.is_fatal() {
            for reply in pending.replies {
                let _ = reply.send(Err(failure.clone()));
            }
            self.fatal(failure);
            return;
        }

        if failure.marks_subtree_invalid() {
            self.tree.mark_invalid(pending.node);
            self.fail_invalid_pending();
        }
        self.punish(pending.origin, failure.punishment());
        for reply in pending.replies {
            let _ = reply.send(Err(failure.clone()));
        }
        self.try_schedule();
    }

    /// Reject every parked block whose tree node became invalid.
    fn fail_invalid_pending(&mut self) {
        let doomed: Vec<block::Hash> = self
            .pending
            .iter()
            .filter(|(hash, pending)| {
                Some(**hash) != self.validating
                    && self
                        .tree
                        .get(pending.node)
                        .status
                        .contains(Status::INVALID)
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in doomed {
            if let Some(pending) = self.pending.remove(&hash) {
                self.punish(pending.origin, BlockError::BadParent.punishment());
                for reply in pending.replies {
                    let _ = reply.send(Err(BlockError::BadParent));
                }
            }
        }
    }

    fn punish(&self, origin: Option<i32>, punishment: u32) {
        if punishment == 0 {
            return;
        }
        if let (Some(origin), Some(punisher)) = (origin, self.handles.punisher.as_ref()) {
            punisher(origin, punishment);
        }
    }

    /// An internal consistency failure: begin an orderly shutdown.
    fn fatal(&mut self, failure: BlockError) {
        error!(code = failure.code(), "*** fatal consensus failure");
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.sender.send(EngineMessage::Shutdown);
    }
}

fn map_utxo_error(error: UtxoError) -> BlockError {
    match error {
        UtxoError::BlockDataMissing(_) | UtxoError::UndoDataMissing(_) => {
            BlockError::BlockDataMissing
        }
        _ => BlockError::UtxoInconsistent,
    }
}

/// One chunk of the parallel input checks.
///
/// Resolves every input against the UTXO store, removes the spent outputs
/// (or records them in the shared spend set in validity-only mode), runs
/// the script verifier and relative lock times when validation is enabled,
/// and builds this chunk's slice of the undo journal.
#[allow(clippy::too_many_arguments)]
fn check_chunk(
    block: &Block,
    tx_meta: &[TxMeta],
    range: std::ops::Range<usize>,
    height: u32,
    flags: ValidationFlags,
    utxo: Arc<dyn UtxoStore>,
    verifier: Arc<dyn ScriptVerifier>,
    check_validity_only: bool,
    spent_map: Arc<Mutex<HashMap<transaction::Hash, Vec<u32>>>>,
) -> ChunkOutcome {
    let mut undo = UndoBlock::default();
    let mut fees = 0i64;
    let mut sigops = 0u64;

    let error = (|| -> Result<(), BlockError> {
        for tx_index in range.clone() {
            let tx = &block.transactions[tx_index];
            let meta = &tx_meta[tx_index];

            if tx_index > 0 {
                let mut prev_heights = Vec::with_capacity(tx.inputs.len());
                let mut input_sum = 0i64;
                for input in &tx.inputs {
                    let (outpoint, unlock_script) = match input {
                        quagga_chain::transparent::Input::PrevOut {
                            outpoint,
                            unlock_script,
                            ..
                        } => (*outpoint, unlock_script),
                        quagga_chain::transparent::Input::Coinbase { .. } => {
                            return Err(TransactionError::CoinbaseInputFound.into());
                        }
                    };

                    let entry = utxo
                        .find(outpoint.hash, outpoint.index)
                        .map_err(map_utxo_error)?
                        .ok_or(TransactionError::MissingInputs)?;
                    prev_heights.push(entry.height);

                    if flags.enable_validation {
                        input_sum += entry.value.value();
                        verifier
                            .verify_input(unlock_script, &entry.lock_script, flags.script_flags())
                            .map_err(BlockError::Transaction)?;
                    }

                    if check_validity_only {
                        // The UTXO set is left untouched, so double spends
                        // inside the block are found through the spend set.
                        let mut spent = spent_map.lock().expect("spend set lock poisoned");
                        let indexes = spent.entry(outpoint.hash).or_default();
                        if indexes.contains(&outpoint.index) {
                            return Err(TransactionError::MissingInputs.into());
                        }
                        indexes.push(outpoint.index);
                    } else {
                        let removed = utxo
                            .remove(outpoint.hash, outpoint.index, None)
                            .map_err(map_utxo_error)?
                            .ok_or(TransactionError::MissingInputs)?;
                        undo.spent.push(UndoItem {
                            tx: outpoint.hash,
                            index: outpoint.index,
                            height: removed.height,
                            offset: removed.offset_in_block,
                        });
                    }
                }

                if flags.enable_validation {
                    script::sequence_locks(tx, &prev_heights, height)
                        .map_err(BlockError::Transaction)?;
                    let output_sum: i64 =
                        tx.outputs.iter().map(|output| output.value.value()).sum();
                    if output_sum > input_sum {
                        return Err(TransactionError::OutputsExceedInputs.into());
                    }
                    fees += input_sum - output_sum;
                    sigops += script::count_sigops(tx);
                }
            }

            if !check_validity_only {
                for output_index in 0..tx.outputs.len() {
                    undo.created.push(UndoItem {
                        tx: meta.hash,
                        index: output_index as u32,
                        height,
                        offset: meta.offset,
                    });
                }
            }
        }
        Ok(())
    })()
    .err();

    ChunkOutcome {
        fees,
        sigops,
        undo,
        error,
    }
}
