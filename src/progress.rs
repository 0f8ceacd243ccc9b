use std::time::{Duration, Instant};

use bitcoin::block::Header;
use chrono::{TimeZone, Utc};
use log::*;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Periodic "processed N blocks" logging, for long-running block processing.
///
/// Messages go to `target`, so the caller decides how they are routed.
pub struct BlockProgressLogger {
    action: String,
    target: String,
    interval: Duration,
    last_log: Instant,
    blocks: u64,
    transactions: u64,
    selection_time: Duration,
}

impl BlockProgressLogger {
    pub fn new(action: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            interval: DEFAULT_INTERVAL,
            last_log: Instant::now(),
            blocks: 0,
            transactions: 0,
            selection_time: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn add_selection_time(&mut self, elapsed: Duration) {
        self.selection_time += elapsed;
    }

    /// Count a processed block, logging (and resetting the counters) if the
    /// interval has passed since the last message.
    pub fn log_block(&mut self, height: u32, header: &Header, tx_count: usize) -> bool {
        self.blocks += 1;
        self.transactions += tx_count as u64;

        let elapsed = self.last_log.elapsed();
        if elapsed < self.interval {
            return false;
        }
        info!(target: self.target.as_str(), "{}", self.message(height, header, elapsed));
        self.blocks = 0;
        self.transactions = 0;
        self.selection_time = Duration::ZERO;
        self.last_log = Instant::now();
        true
    }

    fn message(&self, height: u32, header: &Header, elapsed: Duration) -> String {
        // 10ms resolution
        let elapsed = Duration::from_millis((elapsed.as_millis() / 10 * 10) as u64);
        let time = match Utc.timestamp_opt(header.time.into(), 0).single() {
            Some(time) => time.to_string(),
            None => header.time.to_string(),
        };
        let mut msg = format!(
            "{} {} {} in the last {:?} ({} {}, height {}, {})",
            self.action,
            self.blocks,
            plural(self.blocks, "block", "blocks"),
            elapsed,
            self.transactions,
            plural(self.transactions, "transaction", "transactions"),
            height,
            time,
        );
        if !self.selection_time.is_zero() {
            msg += &format!(", chain selection took {:?}", self.selection_time);
        }
        msg
    }
}

fn plural(n: u64, singular: &'static str, plural: &'static str) -> &'static str {
    if n == 1 {
        singular
    } else {
        plural
    }
}
