use std::sync::Arc;

use bitcoin::BlockHash;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::*;

use crate::index::AugmentedBlock;

#[derive(Debug, Clone)]
pub enum Notification {
    BlockAccepted {
        hash: BlockHash,
        height: u32,
        block: Arc<AugmentedBlock>,
    },
}

/// Fan-out of notifications into bounded per-subscriber queues.
///
/// Sending never blocks: a full queue drops the notification for its
/// subscriber, and a disconnected subscriber is forgotten.
#[derive(Default)]
pub struct Notifier {
    subscribers: Vec<Sender<Notification>>,
}

impl Notifier {
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<Notification> {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        self.subscribers.push(tx);
        rx
    }

    /// Returns the number of subscribers that received `notification`.
    pub fn send(&mut self, notification: Notification) -> usize {
        let mut delivered = 0;
        self.subscribers
            .retain(|tx| match tx.try_send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("subscriber queue is full, dropping notification");
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("subscriber disconnected");
                    false
                }
            });
        delivered
    }
}
