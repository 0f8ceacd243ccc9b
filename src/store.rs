//! Persisted blocks and output locations.
//!
//! Locations are never written on their own: they are derived from an
//! augmented block when the block itself is stored.

use bitcoin::{
    consensus::{deserialize, serialize},
    hashes::Hash as _,
    Block, BlockHash, OutPoint,
};
use log::*;

use crate::{
    db::{Column, Error, ReadTx, WriteTx},
    index::{AugmentedBlock, TxoLocation, TxoRow},
};

/// Location of the output `outpoint`, if it was created by a stored block.
pub fn lookup_txo(tx: &dyn ReadTx, outpoint: &OutPoint) -> Result<Option<TxoLocation>, Error> {
    let key = TxoRow::key(outpoint);
    let Some(value) = tx.get(Column::TxoLocations, &key)? else {
        return Ok(None);
    };
    let value = value
        .try_into()
        .map_err(|_| Error::invalid_row(Column::TxoLocations, &key))?;
    Ok(Some(TxoRow::deserialize((key, value)).location()))
}

/// Location rows of the outputs created by `block` at `height`.
///
/// Every output consumes a flat index, but provably unspendable ones are not
/// persisted since no input can ever reference them.
pub fn txo_rows(block: &AugmentedBlock, height: u32) -> Vec<TxoRow> {
    block
        .outputs()
        .filter(|output| !output.txout.script_pubkey.is_op_return())
        .map(|output| {
            TxoRow::new(&output.outpoint, TxoLocation::new(height, output.flat_index))
        })
        .collect()
}

/// Store the raw block, its augmented form and the locations of its outputs.
///
/// An outpoint keeps the first location written for it: a block from another
/// branch that repeats a transaction must not move its outputs.
pub fn store_block(
    tx: &mut dyn WriteTx,
    height: u32,
    block: &Block,
    augmented: &AugmentedBlock,
) -> Result<(), Error> {
    let hash = block.block_hash();
    debug_assert_eq!(hash, augmented.block_hash());
    let key = hash.as_byte_array();
    tx.put(Column::Blocks, key, &serialize(block));
    tx.put(Column::AugmentedBlocks, key, &serialize(augmented));

    let mut rows = txo_rows(augmented, height);
    // rows of the same outpoint are sorted by location, so the first one is kept
    rows.sort_unstable();
    rows.dedup_by_key(|row| row.outpoint());
    let mut written = 0;
    for row in &rows {
        let (key, value) = row.serialize();
        if tx.get(Column::TxoLocations, &key)?.is_some() {
            continue;
        }
        tx.put(Column::TxoLocations, &key, &value);
        written += 1;
    }
    trace!(
        "block={} height={}: {} of {} txo locations written",
        hash,
        height,
        written,
        rows.len()
    );
    Ok(())
}

pub fn fetch_block(tx: &dyn ReadTx, hash: &BlockHash) -> Result<Option<Block>, Error> {
    tx.get(Column::Blocks, hash.as_byte_array())?
        .map(|bytes| deserialize(&bytes))
        .transpose()
        .map_err(Error::from)
}

pub fn fetch_augmented_block_bytes(
    tx: &dyn ReadTx,
    hash: &BlockHash,
) -> Result<Option<Vec<u8>>, Error> {
    tx.get(Column::AugmentedBlocks, hash.as_byte_array())
}

pub fn fetch_augmented_block(
    tx: &dyn ReadTx,
    hash: &BlockHash,
) -> Result<Option<AugmentedBlock>, Error> {
    fetch_augmented_block_bytes(tx, hash)?
        .map(|bytes| deserialize(&bytes))
        .transpose()
        .map_err(Error::from)
}
