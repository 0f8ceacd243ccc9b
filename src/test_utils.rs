use std::sync::atomic::{AtomicU32, Ordering};

use bitcoin::{
    absolute,
    block::{self, Header},
    hashes::Hash as _,
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};

static NONCE: AtomicU32 = AtomicU32::new(0);

/// A transaction spending `inputs`, with `outputs` P2WPKH-like outputs.
/// Every call returns a transaction with a distinct txid.
pub fn make_tx(inputs: &[OutPoint], outputs: usize) -> Transaction {
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .iter()
            .map(|&previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::from_bytes(nonce.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: (0..outputs)
            .map(|i| TxOut {
                value: Amount::from_sat(1000 * (i as u64 + 1)),
                script_pubkey: ScriptBuf::from_bytes(
                    [&[0x00, 0x14][..], &[i as u8; 20][..]].concat(),
                ),
            })
            .collect(),
    }
}

pub fn make_coinbase(outputs: usize) -> Transaction {
    make_tx(&[OutPoint::null()], outputs)
}

pub fn make_block(prev_blockhash: BlockHash, txdata: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: Header {
            version: block::Version::TWO,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_231_006_505 + NONCE.fetch_add(1, Ordering::Relaxed),
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        },
        txdata,
    };
    if let Some(merkle_root) = block.compute_merkle_root() {
        block.header.merkle_root = merkle_root;
    }
    block
}

/// A genesis-like block: a single coinbase on top of the all-zeros hash.
pub fn make_genesis() -> Block {
    make_block(BlockHash::all_zeros(), vec![make_coinbase(1)])
}
