use std::collections::{HashMap, HashSet};

use super::Scheduler;

/// Named lifecycle channels a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Seek,
    Play,
    Pause,
    Stop,
    AfterLoop,
    ClockTick,
}

/// Payload delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Seek {
        start: f64,
        end: Option<f64>,
        /// Position after the seek. Differs from `start` only when a running
        /// transport was repositioned in place.
        timecode: f64,
    },
    Play {
        timecode: f64,
    },
    Pause {
        timecode: f64,
    },
    Stop,
    AfterLoop {
        iteration: i64,
        timecode: f64,
    },
    ClockTick {
        timecode: f64,
    },
}

impl TransportEvent {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Seek { .. } => Channel::Seek,
            Self::Play { .. } => Channel::Play,
            Self::Pause { .. } => Channel::Pause,
            Self::Stop => Channel::Stop,
            Self::AfterLoop { .. } => Channel::AfterLoop,
            Self::ClockTick { .. } => Channel::ClockTick,
        }
    }
}

/// Token returned by [`Scheduler::subscribe`], used to unsubscribe exactly one
/// listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    channel: Channel,
    id: u64,
}

pub(crate) type Listener = Box<dyn FnMut(&mut Scheduler, &TransportEvent)>;

pub(crate) struct ListenerEntry {
    id: u64,
    callback: Listener,
}

/// Per-channel listener lists.
///
/// While a channel is emitting, its listeners are moved out of the registry so
/// that callbacks can borrow the scheduler mutably. Unsubscribes that target
/// one of the moved-out listeners are parked in `cancelled` and applied on
/// restore.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    channels: HashMap<Channel, Vec<ListenerEntry>>,
    /// Ids of the listeners moved out of each emitting channel.
    emitting: HashMap<Channel, HashSet<u64>>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl ListenerRegistry {
    pub fn subscribe(&mut self, channel: Channel, callback: Listener) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.channels
            .entry(channel)
            .or_default()
            .push(ListenerEntry { id, callback });
        Subscription { channel, id }
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        if let Some(entries) = self.channels.get_mut(&subscription.channel) {
            if let Some(index) = entries.iter().position(|entry| entry.id == subscription.id) {
                entries.remove(index);
                return true;
            }
        }

        let taken = self
            .emitting
            .get(&subscription.channel)
            .is_some_and(|ids| ids.contains(&subscription.id));
        taken && self.cancelled.insert(subscription.id)
    }

    pub fn len(&self, channel: Channel) -> usize {
        self.channels.get(&channel).map_or(0, Vec::len)
    }

    pub fn is_emitting(&self, channel: Channel) -> bool {
        self.emitting.contains_key(&channel)
    }

    pub fn take(&mut self, channel: Channel) -> Vec<ListenerEntry> {
        let entries = self.channels.remove(&channel).unwrap_or_default();
        self.emitting
            .insert(channel, entries.iter().map(|entry| entry.id).collect());
        entries
    }

    pub fn is_cancelled(&self, entry: &ListenerEntry) -> bool {
        self.cancelled.contains(&entry.id)
    }

    pub fn restore(&mut self, channel: Channel, mut entries: Vec<ListenerEntry>) {
        self.emitting.remove(&channel);
        if let Some(added) = self.channels.remove(&channel) {
            entries.extend(added);
        }
        let cancelled = &mut self.cancelled;
        entries.retain(|entry| !cancelled.remove(&entry.id));
        if !entries.is_empty() {
            self.channels.insert(channel, entries);
        }
    }
}

impl ListenerEntry {
    pub fn call(&mut self, scheduler: &mut Scheduler, event: &TransportEvent) {
        (self.callback)(scheduler, event);
    }
}
