mod block;
mod location;
mod txmap;

use bitcoin::{Block, OutPoint, TxIn};
use log::*;

use crate::{db, store};

pub use block::{AugmentedBlock, AugmentedTransaction, AugmentedTxIn, FlatOutput};
pub use location::{InputLocation, TxoLocation, TxoRow};
pub use txmap::TxMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("height={height} tx={tx_index} input={input_index}: previous output {outpoint} not found")]
    MissingPreviousOutpoint {
        height: u32,
        tx_index: usize,
        input_index: usize,
        outpoint: OutPoint,
    },

    #[error("location lookup failed: {0}")]
    Storage(#[from] db::Error),
}

/// Resolves the spent output locations of a block's inputs.
///
/// Reads previously stored locations through `tx`, and resolves spends of
/// outputs created earlier in the same block locally. Never writes, so the
/// result depends only on the block, its height and the store snapshot.
pub struct Builder<'a> {
    tx: &'a dyn db::ReadTx,
    height: u32,
}

impl<'a> Builder<'a> {
    pub fn new(tx: &'a dyn db::ReadTx, height: u32) -> Self {
        Self { tx, height }
    }

    pub fn build(&self, block: &Block) -> Result<AugmentedBlock, Error> {
        let txmap = TxMap::new(&block.txdata);
        let mut txdata = Vec::with_capacity(block.txdata.len());
        for (tx_index, tx) in block.txdata.iter().enumerate() {
            let input = tx
                .input
                .iter()
                .enumerate()
                .map(|(input_index, txin)| {
                    let location = self.resolve(&txmap, tx_index, input_index, txin)?;
                    Ok(AugmentedTxIn::new(txin, location))
                })
                .collect::<Result<Vec<_>, Error>>()?;
            txdata.push(AugmentedTransaction {
                version: tx.version,
                lock_time: tx.lock_time,
                input,
                output: tx.output.clone(),
            });
        }
        Ok(AugmentedBlock {
            header: block.header,
            txdata,
        })
    }

    fn resolve(
        &self,
        txmap: &TxMap,
        tx_index: usize,
        input_index: usize,
        txin: &TxIn,
    ) -> Result<InputLocation, Error> {
        if tx_index == 0 {
            return Ok(InputLocation::Coinbase);
        }
        let outpoint = &txin.previous_output;
        // the genesis block has no earlier outputs to look up
        if self.height != 0 {
            if let Some(location) = store::lookup_txo(self.tx, outpoint)? {
                // a location at this height or above was stored by another branch
                if location.height < self.height {
                    return Ok(InputLocation::Txo(location));
                }
                debug!(
                    "height={}: ignoring {} stored at {}",
                    self.height, outpoint, location
                );
            }
        }
        match txmap.flat_index(outpoint, tx_index) {
            Some(flat_index) => {
                trace!(
                    "height={} tx={} input={}: spends {} created in this block",
                    self.height,
                    tx_index,
                    input_index,
                    outpoint
                );
                Ok(InputLocation::Txo(TxoLocation::new(self.height, flat_index)))
            }
            None => Err(Error::MissingPreviousOutpoint {
                height: self.height,
                tx_index,
                input_index,
                outpoint: *outpoint,
            }),
        }
    }
}
