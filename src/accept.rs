//! Block acceptance: admit a block into the chain state, persisting its
//! augmented form and the locations of the outputs it creates.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bitcoin::{Block, BlockHash, OutPoint};
use crossbeam_channel::Receiver;
use log::*;

use crate::{
    chain::{BlockIndex, BlockNode, BlockStatus},
    db::{self, Database},
    index::{self, AugmentedBlock},
    notify::{Notification, Notifier},
    store,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct BehaviorFlags(u32);

impl BehaviorFlags {
    pub const NONE: Self = Self(0);
    /// Block is known to be valid, so expensive checks may be skipped.
    pub const FAST_ADD: Self = Self(1 << 0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BehaviorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Validation of a block against its position in the chain.
pub trait ContextValidator {
    fn check_block_context(
        &self,
        block: &Block,
        prev_node: &BlockNode,
        flags: BehaviorFlags,
    ) -> Result<(), BoxError>;
}

/// Decides whether a stored block becomes part of the main chain.
pub trait ChainSelector {
    /// Returns whether `node` is now on the main chain, and how long it took.
    fn connect_best_chain(
        &mut self,
        node: &BlockNode,
        block: &AugmentedBlock,
        flags: BehaviorFlags,
    ) -> Result<(bool, Duration), BoxError>;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("block {hash}: previous block {prev_hash} is unknown")]
    PreviousBlockUnknown {
        hash: BlockHash,
        prev_hash: BlockHash,
    },

    #[error("block {hash}: previous block {prev_hash} is invalid")]
    InvalidAncestorBlock {
        hash: BlockHash,
        prev_hash: BlockHash,
    },

    #[error("block {hash} is already indexed")]
    DuplicateBlock { hash: BlockHash },

    #[error("block {hash} at height={height}: tx={tx_index} input={input_index} spends missing {outpoint}")]
    MissingPreviousOutpoint {
        hash: BlockHash,
        height: u32,
        tx_index: usize,
        input_index: usize,
        outpoint: OutPoint,
    },

    #[error("block {hash} at height={height}: storage failed: {source}")]
    StorageFailure {
        hash: BlockHash,
        height: u32,
        source: db::Error,
    },

    #[error("block {hash} at height={height}: context validation failed: {source}")]
    ContextValidationFailure {
        hash: BlockHash,
        height: u32,
        source: BoxError,
    },

    #[error("block {hash} at height={height}: block index flush failed: {source}")]
    IndexPersistenceFailure {
        hash: BlockHash,
        height: u32,
        source: db::Error,
    },

    #[error("block {hash} at height={height}: chain selection failed: {source}")]
    ChainSelectionFailure {
        hash: BlockHash,
        height: u32,
        source: BoxError,
    },

    #[error("genesis block {hash} is not indexed")]
    GenesisMismatch { hash: BlockHash },
}

impl Error {
    fn from_index(hash: BlockHash, height: u32, err: index::Error) -> Self {
        match err {
            index::Error::MissingPreviousOutpoint {
                height,
                tx_index,
                input_index,
                outpoint,
            } => Error::MissingPreviousOutpoint {
                hash,
                height,
                tx_index,
                input_index,
                outpoint,
            },
            index::Error::Storage(source) => Error::StorageFailure {
                hash,
                height,
                source,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Accepted {
    pub hash: BlockHash,
    pub height: u32,
    pub is_main_chain: bool,
    pub selection_time: Duration,
}

/// Owns the chain state: the database, the block index and the chain selector.
///
/// `accept` takes `&mut self`, so a single block is processed at a time.
pub struct Acceptor<D, V, S> {
    db: D,
    index: BlockIndex,
    validator: V,
    selector: S,
    notifier: Notifier,
}

impl<D: Database, V: ContextValidator, S: ChainSelector> Acceptor<D, V, S> {
    /// Open the chain state, storing and connecting `genesis` if `index` is empty.
    pub fn new(
        db: D,
        index: BlockIndex,
        validator: V,
        selector: S,
        genesis: &Block,
    ) -> Result<Self, Error> {
        let mut acceptor = Self {
            db,
            index,
            validator,
            selector,
            notifier: Notifier::default(),
        };
        let hash = genesis.block_hash();
        if !acceptor.index.is_empty() {
            if acceptor.index.lookup_node(&hash).is_none() {
                return Err(Error::GenesisMismatch { hash });
            }
            return Ok(acceptor);
        }
        info!("storing genesis block {}", hash);
        let augmented = acceptor.augment(genesis, 0)?;
        let node = BlockNode::new(
            genesis.header,
            0,
            BlockStatus::DATA_STORED | BlockStatus::VALID,
        );
        acceptor.persist(genesis, &augmented, node.clone())?;
        acceptor
            .selector
            .connect_best_chain(&node, &augmented, BehaviorFlags::NONE)
            .map_err(|source| Error::ChainSelectionFailure {
                hash,
                height: 0,
                source,
            })?;
        Ok(acceptor)
    }

    pub fn accept(&mut self, block: Block, flags: BehaviorFlags) -> Result<Accepted, Error> {
        let hash = block.block_hash();
        let prev_hash = block.header.prev_blockhash;
        if self.index.lookup_node(&hash).is_some() {
            return Err(Error::DuplicateBlock { hash });
        }
        let prev_node = match self.index.lookup_node(&prev_hash) {
            None => return Err(Error::PreviousBlockUnknown { hash, prev_hash }),
            Some(node) if node.status().known_invalid() => {
                return Err(Error::InvalidAncestorBlock { hash, prev_hash })
            }
            Some(node) => node.clone(),
        };
        let height = prev_node.height() + 1;

        let augmented = self.augment(&block, height)?;

        self.validator
            .check_block_context(&block, &prev_node, flags)
            .map_err(|source| Error::ContextValidationFailure {
                hash,
                height,
                source,
            })?;

        let node = BlockNode::new(block.header, height, BlockStatus::DATA_STORED);
        self.persist(&block, &augmented, node.clone())?;

        let (is_main_chain, selection_time) = self
            .selector
            .connect_best_chain(&node, &augmented, flags)
            .map_err(|source| Error::ChainSelectionFailure {
                hash,
                height,
                source,
            })?;
        if is_main_chain {
            self.index.set_status(&hash, BlockStatus::VALID);
            if let Err(e) = self.index.flush(&self.db) {
                // retried by the next flush
                warn!("failed to mark block {} as valid: {}", hash, e);
            }
        }

        self.notifier.send(Notification::BlockAccepted {
            hash,
            height,
            block: Arc::new(augmented),
        });
        Ok(Accepted {
            hash,
            height,
            is_main_chain,
            selection_time,
        })
    }

    fn augment(&self, block: &Block, height: u32) -> Result<AugmentedBlock, Error> {
        self.db
            .view(|tx| index::Builder::new(tx, height).build(block))
            .map_err(|e| Error::from_index(block.block_hash(), height, e))
    }

    /// Store `block` with its augmented form, then index it as `node`.
    fn persist(
        &mut self,
        block: &Block,
        augmented: &AugmentedBlock,
        node: BlockNode,
    ) -> Result<(), Error> {
        let t = Instant::now();
        let hash = node.hash();
        let height = node.height();
        self.db
            .update(|tx| store::store_block(tx, height, block, augmented))
            .map_err(|source| Error::StorageFailure {
                hash,
                height,
                source,
            })?;

        self.index.add_node(node);
        self.index
            .flush(&self.db)
            .map_err(|source| Error::IndexPersistenceFailure {
                hash,
                height,
                source,
            })?;
        debug!(
            "stored block {} at height={}: {} txs [{:?}]",
            hash,
            height,
            block.txdata.len(),
            t.elapsed()
        );
        Ok(())
    }
}

impl<D, V, S> Acceptor<D, V, S> {
    /// Register a subscriber, receiving up to `capacity` pending notifications.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<Notification> {
        self.notifier.subscribe(capacity)
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use bitcoin::{hashes::Hash as _, Txid};

    use super::*;
    use crate::{
        chain::Chain,
        db::{Column, MemoryDb},
        index::{InputLocation, TxoLocation},
        test_utils::{make_block, make_coinbase, make_genesis, make_tx},
    };

    #[derive(Default)]
    struct Validator {
        reject: Cell<bool>,
    }

    impl ContextValidator for &Validator {
        fn check_block_context(
            &self,
            block: &Block,
            prev_node: &BlockNode,
            _flags: BehaviorFlags,
        ) -> Result<(), BoxError> {
            assert_eq!(block.header.prev_blockhash, prev_node.hash());
            if self.reject.get() {
                return Err("bad block context".into());
            }
            Ok(())
        }
    }

    struct FailingSelector;

    impl ChainSelector for FailingSelector {
        fn connect_best_chain(
            &mut self,
            node: &BlockNode,
            _block: &AugmentedBlock,
            _flags: BehaviorFlags,
        ) -> Result<(bool, Duration), BoxError> {
            if node.height() == 0 {
                return Ok((true, Duration::ZERO));
            }
            Err("selection failed".into())
        }
    }

    fn acceptor(validator: &Validator) -> Result<Acceptor<MemoryDb, &Validator, Chain>, Error> {
        Acceptor::new(
            MemoryDb::new(),
            BlockIndex::default(),
            validator,
            Chain::default(),
            &make_genesis(),
        )
    }

    fn genesis_hash<V, S>(acceptor: &Acceptor<MemoryDb, V, S>) -> BlockHash {
        acceptor
            .index()
            .nodes()
            .find(|node| node.height() == 0)
            .map(BlockNode::hash)
            .expect("missing genesis")
    }

    #[test]
    fn test_genesis() -> Result<(), BoxError> {
        let validator = Validator::default();
        let genesis = make_genesis();
        let db = MemoryDb::new();
        let acceptor = Acceptor::new(
            db,
            BlockIndex::default(),
            &validator,
            Chain::default(),
            &genesis,
        )?;
        let hash = genesis.block_hash();
        // augmented without store lookups, the single read checks the
        // coinbase output before writing its location
        assert_eq!(acceptor.db().reads(), 1);
        assert_eq!(acceptor.selector().tip_hash(), Some(hash));
        assert_eq!(
            acceptor.index().node_status(&hash),
            Some(BlockStatus::DATA_STORED | BlockStatus::VALID)
        );
        let augmented = acceptor
            .db()
            .view(|tx| store::fetch_augmented_block(tx, &hash))?
            .expect("missing genesis");
        assert_eq!(augmented.txdata[0].input[0].location, InputLocation::Coinbase);

        // re-opening requires the same genesis
        let index = BlockIndex::load(acceptor.db())?;
        assert_eq!(index.len(), 1);
        let other = make_genesis();
        let res = Acceptor::new(MemoryDb::new(), index, &validator, Chain::default(), &other);
        assert!(matches!(res, Err(Error::GenesisMismatch { hash }) if hash == other.block_hash()));
        Ok(())
    }

    #[test]
    fn test_accept_block() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let rx = acceptor.subscribe(10);
        let genesis = acceptor
            .db()
            .view(|tx| store::fetch_block(tx, &genesis_hash(&acceptor)))?
            .expect("missing genesis");

        let coinbase = make_coinbase(2);
        let spend = make_tx(&[OutPoint::new(genesis.txdata[0].compute_txid(), 0)], 3);
        let spend_again = make_tx(&[OutPoint::new(spend.compute_txid(), 2)], 1);
        let block = make_block(genesis.block_hash(), vec![coinbase, spend, spend_again]);
        let hash = block.block_hash();

        let accepted = acceptor.accept(block.clone(), BehaviorFlags::NONE)?;
        assert_eq!(accepted.hash, hash);
        assert_eq!(accepted.height, 1);
        assert!(accepted.is_main_chain);
        assert_eq!(acceptor.selector().tip_hash(), Some(hash));
        assert_eq!(
            acceptor.index().node_status(&hash),
            Some(BlockStatus::DATA_STORED | BlockStatus::VALID)
        );

        let Notification::BlockAccepted {
            hash: notified,
            height,
            block: augmented,
        } = rx.try_recv().expect("missing notification");
        assert_eq!((notified, height), (hash, 1));
        let locations: Vec<_> = augmented.inputs().map(|txin| txin.location).collect();
        assert_eq!(
            locations,
            vec![
                InputLocation::Coinbase,
                InputLocation::Txo(TxoLocation::new(0, 0)),
                InputLocation::Txo(TxoLocation::new(1, 2 + 2)),
            ]
        );

        let stored = acceptor
            .db()
            .view(|tx| store::fetch_augmented_block(tx, &hash))?;
        assert_eq!(stored.as_ref(), Some(augmented.as_ref()));

        assert!(matches!(
            acceptor.accept(block, BehaviorFlags::NONE),
            Err(Error::DuplicateBlock { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_previous_block_unknown() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let updates = acceptor.db().committed_updates();
        let prev_hash = BlockHash::from_byte_array([1; 32]);
        let block = make_block(prev_hash, vec![make_coinbase(1)]);
        match acceptor.accept(block, BehaviorFlags::NONE) {
            Err(Error::PreviousBlockUnknown { prev_hash: h, .. }) => assert_eq!(h, prev_hash),
            res => panic!("unexpected result: {:?}", res),
        }
        assert_eq!(acceptor.db().committed_updates(), updates);
        Ok(())
    }

    #[test]
    fn test_invalid_ancestor() -> Result<(), BoxError> {
        let validator = Validator::default();
        let genesis = make_genesis();
        let invalid = make_block(genesis.block_hash(), vec![make_coinbase(1)]);
        let mut index = BlockIndex::default();
        index.add_node(BlockNode::new(
            genesis.header,
            0,
            BlockStatus::DATA_STORED | BlockStatus::VALID,
        ));
        index.add_node(BlockNode::new(
            invalid.header,
            1,
            BlockStatus::DATA_STORED | BlockStatus::VALIDATE_FAILED,
        ));
        let mut acceptor = Acceptor::new(
            MemoryDb::new(),
            index,
            &validator,
            Chain::default(),
            &genesis,
        )?;

        let block = make_block(invalid.block_hash(), vec![make_coinbase(1)]);
        assert!(matches!(
            acceptor.accept(block, BehaviorFlags::NONE),
            Err(Error::InvalidAncestorBlock { prev_hash, .. }) if prev_hash == invalid.block_hash()
        ));
        assert_eq!(acceptor.db().committed_updates(), 0);
        assert_eq!(acceptor.db().reads(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_previous_outpoint() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let updates = acceptor.db().committed_updates();
        let missing = OutPoint::new(Txid::from_byte_array([2; 32]), 1);
        let block = make_block(
            genesis_hash(&acceptor),
            vec![make_coinbase(1), make_tx(&[missing], 1)],
        );
        match acceptor.accept(block, BehaviorFlags::NONE) {
            Err(Error::MissingPreviousOutpoint {
                height: 1,
                tx_index: 1,
                input_index: 0,
                outpoint,
                ..
            }) => assert_eq!(outpoint, missing),
            res => panic!("unexpected result: {:?}", res),
        }
        assert_eq!(acceptor.db().committed_updates(), updates);
        Ok(())
    }

    #[test]
    fn test_context_validation_failure() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let updates = acceptor.db().committed_updates();
        let block = make_block(genesis_hash(&acceptor), vec![make_coinbase(1)]);
        let hash = block.block_hash();

        validator.reject.set(true);
        assert!(matches!(
            acceptor.accept(block.clone(), BehaviorFlags::NONE),
            Err(Error::ContextValidationFailure { height: 1, .. })
        ));
        assert_eq!(acceptor.db().committed_updates(), updates);
        assert!(acceptor.index().lookup_node(&hash).is_none());

        validator.reject.set(false);
        assert!(acceptor.accept(block, BehaviorFlags::NONE)?.is_main_chain);
        Ok(())
    }

    #[test]
    fn test_chain_selection_failure() -> Result<(), BoxError> {
        let validator = Validator::default();
        let genesis = make_genesis();
        let mut acceptor = Acceptor::new(
            MemoryDb::new(),
            BlockIndex::default(),
            &validator,
            FailingSelector,
            &genesis,
        )?;
        let rx = acceptor.subscribe(10);
        let block = make_block(genesis.block_hash(), vec![make_coinbase(1)]);
        let hash = block.block_hash();

        assert!(matches!(
            acceptor.accept(block.clone(), BehaviorFlags::NONE),
            Err(Error::ChainSelectionFailure { height: 1, .. })
        ));
        // stored and indexed as a side-branch block
        assert_eq!(
            acceptor.index().node_status(&hash),
            Some(BlockStatus::DATA_STORED)
        );
        let stored = acceptor.db().view(|tx| store::fetch_block(tx, &hash))?;
        assert_eq!(stored, Some(block));
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn test_storage_read_failure() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let rx = acceptor.subscribe(10);
        let genesis = acceptor
            .db()
            .view(|tx| store::fetch_block(tx, &genesis_hash(&acceptor)))?
            .expect("missing genesis");
        let updates = acceptor.db().committed_updates();
        let spend = make_tx(&[OutPoint::new(genesis.txdata[0].compute_txid(), 0)], 1);
        let block = make_block(genesis.block_hash(), vec![make_coinbase(1), spend]);
        let hash = block.block_hash();

        acceptor.db().fail_reads(Some(Column::TxoLocations));
        match acceptor.accept(block.clone(), BehaviorFlags::NONE) {
            Err(Error::StorageFailure {
                hash: h,
                height: 1,
                source: db::Error::Unavailable(Column::TxoLocations),
            }) => assert_eq!(h, hash),
            res => panic!("unexpected result: {:?}", res),
        }
        assert_eq!(acceptor.db().committed_updates(), updates);
        assert!(acceptor.index().lookup_node(&hash).is_none());
        assert!(rx.try_recv().is_err());

        acceptor.db().fail_reads(None);
        assert!(acceptor.accept(block, BehaviorFlags::NONE)?.is_main_chain);
        assert!(rx.try_recv().is_ok());
        Ok(())
    }

    #[test]
    fn test_storage_write_failure() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let rx = acceptor.subscribe(10);
        let updates = acceptor.db().committed_updates();
        let block = make_block(genesis_hash(&acceptor), vec![make_coinbase(2)]);
        let hash = block.block_hash();

        acceptor.db().reject_writes(Some(Column::Blocks));
        assert!(matches!(
            acceptor.accept(block, BehaviorFlags::NONE),
            Err(Error::StorageFailure {
                height: 1,
                source: db::Error::Rejected(Column::Blocks),
                ..
            })
        ));
        // nothing was stored, indexed or announced
        assert_eq!(acceptor.db().committed_updates(), updates);
        assert!(acceptor.index().lookup_node(&hash).is_none());
        assert_eq!(acceptor.db().view(|tx| store::fetch_block(tx, &hash))?, None);
        assert_eq!(acceptor.selector().tip_height(), Some(0));
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn test_index_persistence_failure() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let block = make_block(genesis_hash(&acceptor), vec![make_coinbase(1)]);
        let hash = block.block_hash();

        acceptor.db().reject_writes(Some(Column::BlockIndex));
        assert!(matches!(
            acceptor.accept(block, BehaviorFlags::NONE),
            Err(Error::IndexPersistenceFailure {
                source: db::Error::Rejected(Column::BlockIndex),
                ..
            })
        ));
        // the block itself was committed before the index flush
        let stored = acceptor.db().view(|tx| store::fetch_block(tx, &hash))?;
        assert!(stored.is_some());
        assert_eq!(acceptor.selector().tip_height(), Some(0));
        Ok(())
    }

    #[test]
    fn test_side_branch() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let genesis = genesis_hash(&acceptor);
        let block1 = make_block(genesis, vec![make_coinbase(1)]);
        let side1 = make_block(genesis, vec![make_coinbase(1)]);

        assert!(acceptor.accept(block1, BehaviorFlags::NONE)?.is_main_chain);
        let accepted = acceptor.accept(side1, BehaviorFlags::FAST_ADD)?;
        assert!(!accepted.is_main_chain);
        assert_eq!(accepted.height, 1);
        assert_eq!(
            acceptor.index().node_status(&accepted.hash),
            Some(BlockStatus::DATA_STORED)
        );
        Ok(())
    }

    #[test]
    fn test_side_branch_repeats_transaction() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let genesis = acceptor
            .db()
            .view(|tx| store::fetch_block(tx, &genesis_hash(&acceptor)))?
            .expect("missing genesis");
        let tx = make_tx(&[OutPoint::new(genesis.txdata[0].compute_txid(), 0)], 1);

        // `tx` takes flat index 1 on the main chain, and 5 on the side branch
        let block1 = make_block(genesis.block_hash(), vec![make_coinbase(1), tx.clone()]);
        let side1 = make_block(genesis.block_hash(), vec![make_coinbase(5), tx.clone()]);
        let block1 = acceptor.accept(block1, BehaviorFlags::NONE)?;
        assert!(block1.is_main_chain);
        assert!(!acceptor.accept(side1, BehaviorFlags::NONE)?.is_main_chain);

        let spend = make_tx(&[OutPoint::new(tx.compute_txid(), 0)], 1);
        let block2 = make_block(block1.hash, vec![make_coinbase(1), spend]);
        let accepted = acceptor.accept(block2, BehaviorFlags::NONE)?;
        assert!(accepted.is_main_chain);
        let augmented = acceptor
            .db()
            .view(|tx| store::fetch_augmented_block(tx, &accepted.hash))?
            .expect("missing block");
        assert_eq!(
            augmented.txdata[1].input[0].location,
            InputLocation::Txo(TxoLocation::new(1, 1))
        );
        Ok(())
    }

    #[test]
    fn test_full_subscriber_queue() -> Result<(), BoxError> {
        let validator = Validator::default();
        let mut acceptor = acceptor(&validator)?;
        let rx = acceptor.subscribe(1);
        let mut prev = genesis_hash(&acceptor);
        for _ in 0..3 {
            let block = make_block(prev, vec![make_coinbase(1)]);
            prev = acceptor.accept(block, BehaviorFlags::NONE)?.hash;
        }
        assert_eq!(acceptor.selector().tip_height(), Some(3));
        assert_eq!(rx.try_iter().count(), 1);
        Ok(())
    }

    #[test]
    fn test_behavior_flags() {
        let flags = BehaviorFlags::NONE | BehaviorFlags::FAST_ADD;
        assert!(flags.contains(BehaviorFlags::FAST_ADD));
        assert!(!BehaviorFlags::NONE.contains(BehaviorFlags::FAST_ADD));
        assert!(BehaviorFlags::FAST_ADD.contains(BehaviorFlags::NONE));
    }
}
