//! Tier queues.
//!
//! Each tier owns a deque of pending items plus a token channel. Every
//! enqueue sends one token; a worker that receives a token pops the most
//! relevant pending item (front for FIFO, back for LIFO). Draining the token
//! channel is how not-yet-started work gets cancelled.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use flume::{Receiver, Sender};
use parking_lot::Mutex;

use super::request::QueueItem;
use crate::models::ImageQuality;

/// One of the four load categories, each with its own queue and pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Metadata,
    Thumbnail,
    HighQuality,
    Original,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOrder {
    Fifo,
    Lifo,
}

impl Tier {
    pub const COUNT: usize = 4;
    pub const ALL: [Tier; Tier::COUNT] = [
        Self::Metadata,
        Self::Thumbnail,
        Self::HighQuality,
        Self::Original,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Metadata => 0,
            Self::Thumbnail => 1,
            Self::HighQuality => 2,
            Self::Original => 3,
        }
    }

    /// Metadata scans serve the newest request first: while scrolling, the
    /// item the user is looking at is the one requested last.
    pub fn order(self) -> DequeueOrder {
        match self {
            Self::Metadata => DequeueOrder::Lifo,
            Self::Thumbnail | Self::HighQuality | Self::Original => DequeueOrder::Fifo,
        }
    }

    pub fn quality(self) -> Option<ImageQuality> {
        match self {
            Self::Metadata => None,
            Self::Thumbnail => Some(ImageQuality::Thumbnail),
            Self::HighQuality => Some(ImageQuality::HighQuality),
            Self::Original => Some(ImageQuality::Original),
        }
    }

    pub fn thread_name(self, worker_id: usize) -> String {
        match self {
            Self::Metadata => format!("load-meta-{}", worker_id),
            Self::Thumbnail => format!("load-thumb-{}", worker_id),
            Self::HighQuality => format!("load-hq-{}", worker_id),
            Self::Original => format!("load-orig-{}", worker_id),
        }
    }
}

impl From<ImageQuality> for Tier {
    fn from(quality: ImageQuality) -> Self {
        match quality {
            ImageQuality::Thumbnail => Self::Thumbnail,
            ImageQuality::HighQuality => Self::HighQuality,
            ImageQuality::Original => Self::Original,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => write!(f, "metadata"),
            Self::Thumbnail => write!(f, "thumbnail"),
            Self::HighQuality => write!(f, "high-quality"),
            Self::Original => write!(f, "original"),
        }
    }
}

/// Pending items of one tier.
pub(crate) struct TierQueue {
    tier: Tier,
    items: Mutex<VecDeque<QueueItem>>,
    token_tx: Sender<()>,
    token_rx: Receiver<()>,
}

impl TierQueue {
    pub(crate) fn new(tier: Tier) -> Arc<Self> {
        let (token_tx, token_rx) = flume::unbounded();
        Arc::new(Self {
            tier,
            items: Mutex::new(VecDeque::new()),
            token_tx,
            token_rx,
        })
    }

    /// Receiver handed to each worker of the pool.
    pub(crate) fn tokens(&self) -> Receiver<()> {
        self.token_rx.clone()
    }

    pub(crate) fn push(&self, item: QueueItem) {
        let mut items = self.items.lock();
        items.push_back(item);
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.token_tx.send(());
    }

    pub(crate) fn pop(&self) -> Option<QueueItem> {
        let mut items = self.items.lock();
        match self.tier.order() {
            DequeueOrder::Fifo => items.pop_front(),
            DequeueOrder::Lifo => items.pop_back(),
        }
    }

    /// Remove every pending item and cancel every task that has not started.
    pub(crate) fn drain(&self) -> Vec<QueueItem> {
        // Tokens are drained under the item lock so every remaining token
        // still has an item behind it.
        let mut items = self.items.lock();
        self.token_rx.drain().for_each(drop);
        items.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}
