use bitcoin::{
    absolute,
    consensus::{encode, Decodable, Encodable},
    transaction, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use super::location::InputLocation;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AugmentedTxIn {
    pub previous_output: OutPoint,
    pub script_sig: ScriptBuf,
    pub sequence: Sequence,
    pub witness: Witness,
    pub location: InputLocation,
}

impl AugmentedTxIn {
    pub fn new(txin: &TxIn, location: InputLocation) -> Self {
        Self {
            previous_output: txin.previous_output,
            script_sig: txin.script_sig.clone(),
            sequence: txin.sequence,
            witness: txin.witness.clone(),
            location,
        }
    }

    pub fn to_txin(&self) -> TxIn {
        TxIn {
            previous_output: self.previous_output,
            script_sig: self.script_sig.clone(),
            sequence: self.sequence,
            witness: self.witness.clone(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AugmentedTransaction {
    pub version: transaction::Version,
    pub lock_time: absolute::LockTime,
    pub input: Vec<AugmentedTxIn>,
    pub output: Vec<TxOut>,
}

impl AugmentedTransaction {
    /// The plain transaction, without the resolved locations.
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            version: self.version,
            lock_time: self.lock_time,
            input: self.input.iter().map(AugmentedTxIn::to_txin).collect(),
            output: self.output.clone(),
        }
    }

    pub fn compute_txid(&self) -> Txid {
        self.to_transaction().compute_txid()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AugmentedBlock {
    pub header: bitcoin::block::Header,
    pub txdata: Vec<AugmentedTransaction>,
}

impl AugmentedBlock {
    pub fn block_hash(&self) -> bitcoin::BlockHash {
        self.header.block_hash()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &AugmentedTxIn> {
        self.txdata.iter().flat_map(|tx| tx.input.iter())
    }

    /// All outputs, numbered by their flat index.
    pub fn outputs(&self) -> impl Iterator<Item = FlatOutput<'_>> {
        self.txdata
            .iter()
            .enumerate()
            .flat_map(|(tx_index, tx)| {
                let txid = tx.compute_txid();
                tx.output.iter().enumerate().map(move |(vout, txout)| {
                    (tx_index, OutPoint::new(txid, vout as u32), txout)
                })
            })
            .zip(0u32..)
            .map(|((tx_index, outpoint, txout), flat_index)| FlatOutput {
                tx_index,
                outpoint,
                flat_index,
                txout,
            })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FlatOutput<'a> {
    pub tx_index: usize,
    pub outpoint: OutPoint,
    pub flat_index: u32,
    pub txout: &'a TxOut,
}

// Caps the up-front allocation when decoding untrusted lengths.
const MAX_PREALLOC: usize = 1024;

fn encode_len<W: bitcoin::io::Write + ?Sized>(
    len: usize,
    w: &mut W,
) -> Result<usize, bitcoin::io::Error> {
    bitcoin::VarInt(len as u64).consensus_encode(w)
}

fn decode_vec<T: Decodable, R: bitcoin::io::Read + ?Sized>(
    r: &mut R,
) -> Result<Vec<T>, encode::Error> {
    let len = bitcoin::VarInt::consensus_decode_from_finite_reader(r)?.0;
    let len = usize::try_from(len).map_err(|_| encode::Error::ParseFailed("length overflow"))?;
    let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
    for _ in 0..len {
        items.push(T::consensus_decode_from_finite_reader(r)?);
    }
    Ok(items)
}

impl Encodable for AugmentedTxIn {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.previous_output.consensus_encode(w)?;
        len += self.script_sig.consensus_encode(w)?;
        len += self.sequence.consensus_encode(w)?;
        len += self.witness.consensus_encode(w)?;
        len += self.location.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AugmentedTxIn {
    fn consensus_decode_from_finite_reader<R: bitcoin::io::Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            previous_output: Decodable::consensus_decode_from_finite_reader(r)?,
            script_sig: Decodable::consensus_decode_from_finite_reader(r)?,
            sequence: Decodable::consensus_decode_from_finite_reader(r)?,
            witness: Decodable::consensus_decode_from_finite_reader(r)?,
            location: Decodable::consensus_decode_from_finite_reader(r)?,
        })
    }
}

impl Encodable for AugmentedTransaction {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += encode_len(self.input.len(), w)?;
        for txin in &self.input {
            len += txin.consensus_encode(w)?;
        }
        len += self.output.consensus_encode(w)?;
        len += self.lock_time.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AugmentedTransaction {
    fn consensus_decode_from_finite_reader<R: bitcoin::io::Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            version: Decodable::consensus_decode_from_finite_reader(r)?,
            input: decode_vec(r)?,
            output: Decodable::consensus_decode_from_finite_reader(r)?,
            lock_time: Decodable::consensus_decode_from_finite_reader(r)?,
        })
    }
}

impl Encodable for AugmentedBlock {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.header.consensus_encode(w)?;
        len += encode_len(self.txdata.len(), w)?;
        for tx in &self.txdata {
            len += tx.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for AugmentedBlock {
    fn consensus_decode_from_finite_reader<R: bitcoin::io::Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            header: Decodable::consensus_decode_from_finite_reader(r)?,
            txdata: decode_vec(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        consensus::{deserialize, serialize},
        hashes::Hash as _,
    };

    use super::*;
    use crate::{
        index::location::TxoLocation,
        test_utils::{make_block, make_tx},
    };

    fn augmented_block() -> (bitcoin::Block, AugmentedBlock) {
        let coinbase = make_tx(&[OutPoint::null()], 1);
        let funding = OutPoint::new(coinbase.compute_txid(), 0);
        let mut spend = make_tx(&[funding], 2);
        spend.input[0].witness = Witness::from_slice(&[vec![0x30, 0x44], vec![0x02]]);
        let block = make_block(bitcoin::BlockHash::from_byte_array([7; 32]), vec![coinbase, spend]);

        let locations = [
            vec![InputLocation::Coinbase],
            vec![InputLocation::Txo(TxoLocation::new(12, 0))],
        ];
        let txdata = block
            .txdata
            .iter()
            .zip(locations)
            .map(|(tx, locations)| AugmentedTransaction {
                version: tx.version,
                lock_time: tx.lock_time,
                input: tx
                    .input
                    .iter()
                    .zip(locations)
                    .map(|(txin, location)| AugmentedTxIn::new(txin, location))
                    .collect(),
                output: tx.output.clone(),
            })
            .collect();
        let augmented = AugmentedBlock {
            header: block.header,
            txdata,
        };
        (block, augmented)
    }

    #[test]
    fn test_augmented_block_encoding() {
        let (block, augmented) = augmented_block();
        assert_eq!(augmented.block_hash(), block.block_hash());
        for (tx, augmented_tx) in block.txdata.iter().zip(&augmented.txdata) {
            assert_eq!(&augmented_tx.to_transaction(), tx);
            assert_eq!(augmented_tx.compute_txid(), tx.compute_txid());
        }

        let bytes = serialize(&augmented);
        // each input carries its location right after the witness
        let raw = serialize(&block.txdata[1].input[0].witness);
        let offset = bytes
            .windows(raw.len())
            .position(|w| w == raw.as_slice())
            .expect("missing witness");
        assert_eq!(
            bytes[offset + raw.len()..offset + raw.len() + 9],
            serialize(&InputLocation::Txo(TxoLocation::new(12, 0)))
        );

        let decoded: AugmentedBlock = deserialize(&bytes).unwrap();
        assert_eq!(decoded, augmented);

        // trailing garbage is rejected
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(deserialize::<AugmentedBlock>(&extra).is_err());
        // so is a truncated buffer
        assert!(deserialize::<AugmentedBlock>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_flat_outputs() {
        let (block, augmented) = augmented_block();
        let outputs: Vec<_> = augmented.outputs().collect();
        assert_eq!(outputs.len(), 3);

        let spend_txid = block.txdata[1].compute_txid();
        assert_eq!(outputs[0].tx_index, 0);
        assert_eq!(outputs[0].outpoint.txid, block.txdata[0].compute_txid());
        assert_eq!(
            outputs[2],
            FlatOutput {
                tx_index: 1,
                outpoint: OutPoint::new(spend_txid, 1),
                flat_index: 2,
                txout: &block.txdata[1].output[1],
            }
        );
        let flat: Vec<u32> = outputs.iter().map(|output| output.flat_index).collect();
        assert_eq!(flat, vec![0, 1, 2]);
    }
}
