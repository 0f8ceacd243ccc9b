use std::{io::ErrorKind, time::Duration};

use bitcoin::{consensus::deserialize, Block, BlockHash};
use log::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] ureq::Error),

    #[error("reading response failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("decoding failed: {0}")]
    Decoding(#[from] bitcoin::consensus::encode::Error),

    #[error("block {expected} was requested, {actual} was returned")]
    UnexpectedBlock {
        expected: BlockHash,
        actual: BlockHash,
    },
}

/// bitcoind REST API client (requires `-rest=1`).
pub struct Client {
    agent: ureq::Agent,
    url: String,
    retries: usize,
}

impl Client {
    pub fn new<T: Into<String>>(agent: ureq::Agent, url: T) -> Self {
        Self {
            agent,
            url: url.into(),
            retries: 100,
        }
    }

    /// Returns `None` if the resource is not found.
    fn get_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut iter = 0;
        let err = loop {
            iter += 1;
            let req = self.agent.get(url);
            debug!("=> {:?}", req);
            let res = req.call();
            debug!("<= {:?}", res);
            let err = match res {
                Ok(resp) => return Ok(Some(resp.into_body().read_to_vec()?)),
                Err(ureq::Error::StatusCode(404)) => return Ok(None),
                Err(err) => err,
            };
            if iter > self.retries {
                break err;
            }
            match &err {
                ureq::Error::StatusCode(503) => (),
                ureq::Error::Io(e) if e.kind() == ErrorKind::ConnectionRefused => (),
                _ => break err, // non-retriable error
            }
            warn!("unavailable {}: {:?}", url, err);
            std::thread::sleep(Duration::from_secs(1));
        };
        error!("GET {} failed: {:?}", url, err);
        Err(Error::Http(err))
    }

    /// Returns `None` if `height` is above the node's tip.
    pub fn get_blockhash_by_height(&self, height: u32) -> Result<Option<BlockHash>, Error> {
        let url = format!("{}/rest/blockhashbyheight/{}.bin", self.url, height);
        match self.get_bytes(&url)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Returns `None` if the node doesn't have the block.
    pub fn get_block(&self, hash: BlockHash) -> Result<Option<Block>, Error> {
        let url = format!("{}/rest/block/{}.bin", self.url, hash);
        let Some(data) = self.get_bytes(&url)? else {
            return Ok(None);
        };
        let block: Block = deserialize(&data)?;
        let actual = block.block_hash();
        if actual != hash {
            return Err(Error::UnexpectedBlock {
                expected: hash,
                actual,
            });
        }
        Ok(Some(block))
    }
}
