//! The packet carrier: the ordered list of (packet, post-delay) pairs that
//! flows through a modification pipeline.
//!
//! The delay attached to an entry is the time the runtime waits after
//! emitting that packet before emitting the next one.

use std::time::Duration;

use smallvec::SmallVec;

use crate::packet::Packet;

/// One carrier slot: a packet and its post-delay.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketEntry {
    pub packet: Packet,
    pub delay: Duration,
}

/// Ordered sequence of packets flowing through a pipeline. Most carriers
/// hold a single intercepted packet until a transform fans it out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketCarrier {
    entries: SmallVec<[PacketEntry; 4]>,
}

impl PacketCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carrier holding exactly one packet with no delay.
    pub fn single(packet: Packet) -> Self {
        let mut carrier = Self::new();
        carrier.append(packet, Duration::ZERO);
        carrier
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PacketEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PacketEntry> {
        self.entries.iter()
    }

    pub fn append(&mut self, packet: Packet, delay: Duration) {
        self.entries.push(PacketEntry { packet, delay });
    }

    pub fn push_entry(&mut self, entry: PacketEntry) {
        self.entries.push(entry);
    }

    pub fn insert(&mut self, index: usize, packet: Packet, delay: Duration) {
        self.entries.insert(index, PacketEntry { packet, delay });
    }

    pub fn remove(&mut self, index: usize) -> PacketEntry {
        self.entries.remove(index)
    }

    pub fn replace(&mut self, index: usize, packet: Packet) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.packet = packet;
        }
    }

    pub fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
    }

    pub fn set_delay(&mut self, index: usize, delay: Duration) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.delay = delay;
        }
    }
}

impl IntoIterator for PacketCarrier {
    type Item = PacketEntry;
    type IntoIter = smallvec::IntoIter<[PacketEntry; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a PacketCarrier {
    type Item = &'a PacketEntry;
    type IntoIter = std::slice::Iter<'a, PacketEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<PacketEntry> for PacketCarrier {
    fn from_iter<T: IntoIterator<Item = PacketEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
