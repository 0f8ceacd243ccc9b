pub mod accept;
pub mod chain;
pub mod client;
pub mod config;
pub mod db;
pub mod index;
pub mod notify;
pub mod progress;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use accept::{Accepted, Acceptor, BehaviorFlags, ChainSelector, ContextValidator};
pub use bitcoin;
pub use chain::{BlockIndex, BlockNode, BlockStatus, Chain};
pub use index::{AugmentedBlock, InputLocation, TxoLocation};
