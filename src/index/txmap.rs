use std::collections::HashMap;

use bitcoin::{OutPoint, Transaction, Txid};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct TxEntry {
    position: usize,    // tx position within its block
    first_output: u32,  // flat index of the tx's first output
    output_count: u32,
}

/// Transactions of a single block, indexed by txid.
///
/// Built once per block, so that resolving a spend of an output created
/// earlier in the same block doesn't rescan the preceding transactions.
pub struct TxMap {
    entries: HashMap<Txid, TxEntry>,
}

impl TxMap {
    pub fn new(txdata: &[Transaction]) -> Self {
        let mut entries = HashMap::with_capacity(txdata.len());
        let mut first_output = 0u32;
        for (position, tx) in txdata.iter().enumerate() {
            let output_count = tx.output.len() as u32;
            // a duplicated txid resolves to its first occurrence
            entries.entry(tx.compute_txid()).or_insert(TxEntry {
                position,
                first_output,
                output_count,
            });
            first_output += output_count;
        }
        Self { entries }
    }

    /// Flat index of `outpoint`, if it was created by a transaction preceding
    /// the one at `spender` position.
    pub fn flat_index(&self, outpoint: &OutPoint, spender: usize) -> Option<u32> {
        let entry = self.entries.get(&outpoint.txid)?;
        if entry.position >= spender || outpoint.vout >= entry.output_count {
            return None;
        }
        Some(entry.first_output + outpoint.vout)
    }

    pub fn position(&self, txid: &Txid) -> Option<usize> {
        self.entries.get(txid).map(|entry| entry.position)
    }
}
