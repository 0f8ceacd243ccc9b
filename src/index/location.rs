use bitcoin::{
    consensus::{encode, Decodable, Encodable},
    hashes::Hash as _,
    OutPoint, Txid,
};

/// Where an output was created: the height of its block, and its position
/// among all the outputs of that block (transaction-major order).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, serde::Serialize)]
pub struct TxoLocation {
    pub height: u32,
    pub flat_index: u32,
}

impl TxoLocation {
    pub const LEN: usize = 8;

    pub fn new(height: u32, flat_index: u32) -> Self {
        Self { height, flat_index }
    }

    pub fn serialize(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..4].copy_from_slice(&self.height.to_be_bytes());
        bytes[4..].copy_from_slice(&self.flat_index.to_be_bytes());
        bytes
    }

    pub fn deserialize(bytes: [u8; Self::LEN]) -> Self {
        let (height, flat_index) = bytes.split_at(4);
        Self {
            height: u32::from_be_bytes(height.try_into().unwrap()),
            flat_index: u32::from_be_bytes(flat_index.try_into().unwrap()),
        }
    }
}

impl std::fmt::Display for TxoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.height, self.flat_index)
    }
}

/// Resolved origin of the output spent by a transaction input.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLocation {
    /// Input of the block's first transaction (spends no output).
    Coinbase,
    Txo(TxoLocation),
}

impl InputLocation {
    const COINBASE_TAG: u8 = 0;
    const TXO_TAG: u8 = 1;

    pub fn txo(&self) -> Option<TxoLocation> {
        match self {
            InputLocation::Coinbase => None,
            InputLocation::Txo(location) => Some(*location),
        }
    }
}

impl std::fmt::Display for InputLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InputLocation::Coinbase => f.write_str("coinbase"),
            InputLocation::Txo(location) => location.fmt(f),
        }
    }
}

impl Encodable for InputLocation {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        w: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        match self {
            InputLocation::Coinbase => Self::COINBASE_TAG.consensus_encode(w),
            InputLocation::Txo(location) => {
                let mut len = Self::TXO_TAG.consensus_encode(w)?;
                len += location.height.consensus_encode(w)?;
                len += location.flat_index.consensus_encode(w)?;
                Ok(len)
            }
        }
    }
}

impl Decodable for InputLocation {
    fn consensus_decode_from_finite_reader<R: bitcoin::io::Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        match u8::consensus_decode_from_finite_reader(r)? {
            Self::COINBASE_TAG => Ok(InputLocation::Coinbase),
            Self::TXO_TAG => {
                let height = u32::consensus_decode_from_finite_reader(r)?;
                let flat_index = u32::consensus_decode_from_finite_reader(r)?;
                Ok(InputLocation::Txo(TxoLocation { height, flat_index }))
            }
            _ => Err(encode::Error::ParseFailed("unknown input location tag")),
        }
    }
}

const TXID_LEN: usize = Txid::LEN;

/// Persisted location of a single output, keyed by its outpoint.
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct TxoRow {
    key: [u8; TxoRow::KEY_LEN],
    location: TxoLocation,
}

impl TxoRow {
    pub const KEY_LEN: usize = TXID_LEN + 4;

    pub fn new(outpoint: &OutPoint, location: TxoLocation) -> Self {
        Self {
            key: Self::key(outpoint),
            location,
        }
    }

    /// Big-endian `vout`, so an iteration over the keys follows output order.
    pub fn key(outpoint: &OutPoint) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..TXID_LEN].copy_from_slice(outpoint.txid.as_byte_array());
        key[TXID_LEN..].copy_from_slice(&outpoint.vout.to_be_bytes());
        key
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array(self.key[..TXID_LEN].try_into().unwrap()),
            vout: u32::from_be_bytes(self.key[TXID_LEN..].try_into().unwrap()),
        }
    }

    pub fn location(&self) -> TxoLocation {
        self.location
    }

    pub fn serialize(&self) -> ([u8; Self::KEY_LEN], [u8; TxoLocation::LEN]) {
        (self.key, self.location.serialize())
    }

    pub fn deserialize((key, value): ([u8; Self::KEY_LEN], [u8; TxoLocation::LEN])) -> Self {
        Self {
            key,
            location: TxoLocation::deserialize(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::{deserialize, serialize};
    use hex_lit::hex;

    use super::*;

    #[test]
    fn test_serde_location() {
        let location = TxoLocation::new(0x00023f35, 7);
        assert_eq!(location.serialize(), hex!("00023f3500000007"));
        assert_eq!(TxoLocation::deserialize(location.serialize()), location);
    }

    #[test]
    fn test_encode_input_location() {
        assert_eq!(serialize(&InputLocation::Coinbase), hex!("00"));

        let located = InputLocation::Txo(TxoLocation::new(147253, 6));
        let bytes = serialize(&located);
        assert_eq!(bytes, hex!("01353f020006000000"));
        assert_eq!(deserialize::<InputLocation>(&bytes).unwrap(), located);

        // a genesis-height output is distinct from a coinbase input
        let genesis = InputLocation::Txo(TxoLocation::new(0, 0));
        assert_ne!(serialize(&genesis), serialize(&InputLocation::Coinbase));

        assert!(deserialize::<InputLocation>(&hex!("02")).is_err());
        assert!(deserialize::<InputLocation>(&hex!("0100")).is_err());
    }

    #[test]
    fn test_serde_txo_row() {
        let txid: Txid = "80c2c4fbb13d015a8650846b31515ebdc8e423294d2ed74cf50277c472de5056"
            .parse()
            .unwrap();
        let outpoint = OutPoint::new(txid, 1);
        let row = TxoRow::new(&outpoint, TxoLocation::new(147253, 7));
        let (key, value) = row.serialize();
        assert_eq!(&key[..32], txid.as_byte_array());
        assert_eq!(&key[32..], hex!("00000001"));
        assert_eq!(value, hex!("00023f3500000007"));

        let row = TxoRow::deserialize((key, value));
        assert_eq!(row.outpoint(), outpoint);
        assert_eq!(row.location(), TxoLocation::new(147253, 7));
    }
}
