use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use bitcoin::{
    block::Header,
    consensus::{deserialize, encode, serialize},
    hashes::Hash as _,
    BlockHash,
};
use log::*;

use crate::{
    accept::{BehaviorFlags, BoxError, ChainSelector},
    db::{self, Column, Database},
    index::AugmentedBlock,
};

/// Validity flags of an indexed block.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct BlockStatus(u8);

impl BlockStatus {
    /// Block data (and its augmented form) is persisted.
    pub const DATA_STORED: Self = Self(1 << 0);
    /// Block was connected to the main chain.
    pub const VALID: Self = Self(1 << 1);
    pub const VALIDATE_FAILED: Self = Self(1 << 2);
    /// Some ancestor failed validation.
    pub const INVALID_ANCESTOR: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn known_invalid(self) -> bool {
        self.0 & (Self::VALIDATE_FAILED.0 | Self::INVALID_ANCESTOR.0) != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for BlockStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

const BLOCK_HASH_LEN: usize = BlockHash::LEN;
const NODE_VALUE_LEN: usize = 4 + 1 + Header::SIZE;

type SerializedNodeRow = ([u8; BLOCK_HASH_LEN], [u8; NODE_VALUE_LEN]);

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BlockNode {
    hash: BlockHash,
    height: u32,
    header: Header,
    status: BlockStatus,
}

impl BlockNode {
    pub fn new(header: Header, height: u32, status: BlockStatus) -> Self {
        Self {
            hash: header.block_hash(),
            height,
            header,
            status,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn serialize(&self) -> SerializedNodeRow {
        let mut value = [0u8; NODE_VALUE_LEN];
        value[..4].copy_from_slice(&self.height.to_be_bytes());
        value[4] = self.status.bits();
        value[5..].copy_from_slice(&serialize(&self.header));
        (self.hash.to_byte_array(), value)
    }

    pub fn deserialize((key, value): SerializedNodeRow) -> Result<Self, encode::Error> {
        let header: Header = deserialize(&value[5..])?;
        let hash = BlockHash::from_byte_array(key);
        if header.block_hash() != hash {
            return Err(encode::Error::ParseFailed("block index key mismatch"));
        }
        Ok(Self {
            hash,
            height: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
            header,
            status: BlockStatus(value[4]),
        })
    }
}

/// All known blocks (main chain and side branches), by hash.
///
/// Changes are kept in memory until `flush` persists them.
#[derive(Default)]
pub struct BlockIndex {
    nodes: HashMap<BlockHash, BlockNode>,
    dirty: HashSet<BlockHash>,
}

impl BlockIndex {
    pub fn load(db: &impl Database) -> Result<Self, db::Error> {
        let t = Instant::now();
        let mut nodes = HashMap::new();
        for (key, value) in db.scan(Column::BlockIndex)? {
            let row = (
                key.as_slice()
                    .try_into()
                    .map_err(|_| db::Error::invalid_row(Column::BlockIndex, &key))?,
                value
                    .as_slice()
                    .try_into()
                    .map_err(|_| db::Error::invalid_row(Column::BlockIndex, &key))?,
            );
            let node = BlockNode::deserialize(row)?;
            nodes.insert(node.hash, node);
        }
        info!("loaded {} block index nodes [{:?}]", nodes.len(), t.elapsed());
        Ok(Self {
            nodes,
            dirty: HashSet::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn lookup_node(&self, hash: &BlockHash) -> Option<&BlockNode> {
        self.nodes.get(hash)
    }

    pub fn node_status(&self, hash: &BlockHash) -> Option<BlockStatus> {
        self.nodes.get(hash).map(BlockNode::status)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BlockNode> {
        self.nodes.values()
    }

    pub fn add_node(&mut self, node: BlockNode) {
        self.dirty.insert(node.hash);
        self.nodes.insert(node.hash, node);
    }

    /// Returns `false` if `hash` is not indexed.
    pub fn set_status(&mut self, hash: &BlockHash, status: BlockStatus) -> bool {
        match self.nodes.get_mut(hash) {
            Some(node) => {
                node.status.insert(status);
                self.dirty.insert(*hash);
                true
            }
            None => false,
        }
    }

    /// Persist the modified nodes in a single update.
    ///
    /// On failure the nodes stay dirty, so the next flush retries them.
    pub fn flush(&mut self, db: &impl Database) -> Result<usize, db::Error> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let mut rows: Vec<_> = self
            .dirty
            .iter()
            .filter_map(|hash| self.nodes.get(hash))
            .map(BlockNode::serialize)
            .collect();
        rows.sort_unstable();
        db.update(|tx| {
            for (key, value) in &rows {
                tx.put(Column::BlockIndex, key, value);
            }
            Ok::<_, db::Error>(())
        })?;
        self.dirty.clear();
        debug!("flushed {} block index nodes", rows.len());
        Ok(rows.len())
    }
}

/// Main chain block hashes, by height.
///
/// Extends its tip with blocks building on it, and leaves every other block
/// on a side branch.
#[derive(Default)]
pub struct Chain {
    hashes: Vec<BlockHash>,
}

impl Chain {
    /// Rebuild the main chain, ending at the highest valid indexed block.
    pub fn from_index(index: &BlockIndex) -> Self {
        let tip = index
            .nodes()
            .filter(|node| node.status().contains(BlockStatus::VALID))
            .max_by_key(|node| (node.height(), std::cmp::Reverse(node.hash())));
        let Some(tip) = tip else {
            return Self::default();
        };
        let mut hashes = vec![tip.hash()];
        let mut node = tip;
        while let Some(prev) = index.lookup_node(&node.header().prev_blockhash) {
            hashes.push(prev.hash());
            node = prev;
        }
        assert_eq!(
            hashes.len(),
            tip.height() as usize + 1,
            "block index is missing ancestors of {}",
            tip.hash()
        );
        hashes.reverse();
        Self { hashes }
    }

    pub fn tip_hash(&self) -> Option<BlockHash> {
        self.hashes.last().copied()
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.hashes.len().checked_sub(1).map(|h| h as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl ChainSelector for Chain {
    fn connect_best_chain(
        &mut self,
        node: &BlockNode,
        _block: &AugmentedBlock,
        _flags: BehaviorFlags,
    ) -> Result<(bool, Duration), BoxError> {
        let t = Instant::now();
        let extends_tip = match self.tip_hash() {
            Some(tip) => node.header().prev_blockhash == tip,
            None => node.height() == 0,
        };
        if !extends_tip {
            debug!(
                "block {} at height={} is on a side branch",
                node.hash(),
                node.height()
            );
            return Ok((false, t.elapsed()));
        }
        if self.hashes.len() != node.height() as usize {
            return Err(format!(
                "block {} height={} doesn't follow tip height={:?}",
                node.hash(),
                node.height(),
                self.tip_height()
            )
            .into());
        }
        self.hashes.push(node.hash());
        Ok((true, t.elapsed()))
    }
}
