//! # Events
//!
//! Inbound [`HostEvent`]s are what the host feeds the service: priority
//! changes, display transitions, memory pressure and process exits.
//! Outbound [`MemplusEvent`]s are broadcast to observers through the
//! [`EventHub`] once a walk or pass completes.
//!
//! Subscribers receive events on an `mpsc` channel. Publishing never
//! blocks; a subscriber whose receiver was dropped is pruned on the next
//! publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use memplus_hal::Pid;
use spin::RwLock;

use crate::memex::MemexPassReport;
use crate::sweep::SweepReport;
use crate::tracker::PriorityChange;
use crate::walker::WalkStats;

// =============================================================================
// Inbound
// =============================================================================

/// Events emitted by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A process changed priority tier
    PriorityChanged(PriorityChange),
    /// The display panel turned on or off
    DisplayChanged {
        /// Panel state after the change
        panel_on: bool,
    },
    /// Available memory dropped
    MemoryPressure {
        /// Available memory in MiB
        available_mb: u64,
    },
    /// A process exited
    ProcessExited {
        /// Process ID
        pid: Pid,
    },
}

// =============================================================================
// Outbound
// =============================================================================

/// Who asked for a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkOrigin {
    /// Dequeued from a work queue
    Queued,
    /// Synchronous request surface
    Forced,
}

/// Events emitted by memplus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemplusEvent {
    /// A reclaim walk finished
    ReclaimCompleted {
        /// Process ID
        pid: Pid,
        /// Who asked
        origin: WalkOrigin,
        /// Walk counters
        stats: WalkStats,
    },
    /// A swap-in walk finished
    SwapinCompleted {
        /// Process ID
        pid: Pid,
        /// Who asked
        origin: WalkOrigin,
        /// Pages faulted in or read ahead
        pages: u64,
    },
    /// A sweep pass finished
    SweepCompleted(SweepReport),
    /// A MemEx pass finished
    MemexPassCompleted(MemexPassReport),
}

/// Subscription filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    /// Reclaim completions
    Reclaim,
    /// Swap-in completions
    Swapin,
    /// Sweep passes
    Sweep,
    /// MemEx passes
    Memex,
    /// Everything
    All,
}

impl EventTopic {
    /// Check if this topic matches a given event
    pub fn matches(&self, event: &MemplusEvent) -> bool {
        match (self, event) {
            (EventTopic::All, _) => true,
            (EventTopic::Reclaim, MemplusEvent::ReclaimCompleted { .. }) => true,
            (EventTopic::Swapin, MemplusEvent::SwapinCompleted { .. }) => true,
            (EventTopic::Sweep, MemplusEvent::SweepCompleted(_)) => true,
            (EventTopic::Memex, MemplusEvent::MemexPassCompleted(_)) => true,
            _ => false,
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Subscription ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    topics: Vec<EventTopic>,
    tx: Sender<MemplusEvent>,
}

/// Broadcast hub for [`MemplusEvent`]s
#[derive(Debug, Default)]
pub struct EventHub {
    subscriptions: RwLock<Vec<Subscription>>,
    published: AtomicU64,
}

impl EventHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given topics
    pub fn subscribe(&self, topics: &[EventTopic]) -> (SubscriptionId, Receiver<MemplusEvent>) {
        let (tx, rx) = mpsc::channel();
        let id = SubscriptionId::new();
        self.subscriptions.write().push(Subscription {
            id,
            topics: topics.to_vec(),
            tx,
        });
        log::debug!("EventHub: New subscription {:?}", id);
        (id, rx)
    }

    /// Unsubscribe
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver an event to every matching subscriber
    ///
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, event: MemplusEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subs = self.subscriptions.read();
            for sub in subs.iter() {
                if !sub.topics.iter().any(|t| t.matches(&event)) {
                    continue;
                }
                match sub.tx.send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(sub.id),
                }
            }
        }

        if !dead.is_empty() {
            self.subscriptions.write().retain(|s| !dead.contains(&s.id));
            log::debug!("EventHub: Pruned {} subscriptions", dead.len());
        }
        delivered
    }

    /// Number of events published
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}
