use std::fmt::{Display, Formatter};
use tracing::trace;

/// Identifies a slot in a `ConnectionTable`. The generation distinguishes successive occupants of
///  the same slot, so a stale id never reaches a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub index: u16,
    pub generation: u16,
}

impl ConnectionId {
    /// The KCP conversation id for this slot. Generations start at 1, so the result is never 0,
    ///  which is reserved for the consult handshake.
    pub fn to_conv(self) -> u32 {
        ((self.generation as u32) << 16) | self.index as u32
    }

    pub fn from_conv(conv: u32) -> ConnectionId {
        ConnectionId {
            index: (conv & 0xffff) as u16,
            generation: (conv >> 16) as u16,
        }
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// A table of live connections, indexed by generational ids. Freed slots are reused, each reuse
///  bumping the slot's generation.
pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    len: usize,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        ConnectionTable {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> ConnectionTable<T> {
    pub const MAX_SLOTS: usize = u16::MAX as usize + 1;

    pub fn new() -> ConnectionTable<T> {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `None` if all slots are taken
    pub fn insert(&mut self, value: T) -> Option<ConnectionId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= Self::MAX_SLOTS {
                    return None;
                }
                self.slots.push(Slot { generation: 0, value: None });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        slot.value = Some(value);
        self.len += 1;

        let id = ConnectionId { index, generation: slot.generation };
        trace!(%id, "allocated connection slot");
        Some(id)
    }

    fn slot(&self, id: ConnectionId) -> Option<&Slot<T>> {
        self.slots.get(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.slot(id)?.value.as_ref()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let value = slot.value.take()?;
        self.free.push(id.index);
        self.len -= 1;
        trace!(%id, "released connection slot");
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &T)> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.value.as_ref().map(|v| (ConnectionId { index: index as u16, generation: slot.generation }, v)))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = ConnectionTable::new();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));

        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.get(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_id_is_rejected() {
        let mut table = ConnectionTable::new();
        let old = table.insert(1).unwrap();
        table.remove(old);
        let new = table.insert(2).unwrap();

        assert_eq!(old.index, new.index);
        assert_ne!(old.generation, new.generation);
        assert_eq!(table.get(old), None);
        assert_eq!(table.remove(old), None);
        assert_eq!(table.get(new), Some(&2));
    }

    #[test]
    fn test_iter() {
        let mut table = ConnectionTable::new();
        let a = table.insert('a').unwrap();
        let b = table.insert('b').unwrap();
        let c = table.insert('c').unwrap();
        table.remove(b);

        let entries = table.iter().collect::<Vec<_>>();
        assert_eq!(entries, vec![(a, &'a'), (c, &'c')]);
    }

    #[rstest]
    #[case(ConnectionId { index: 0, generation: 1 }, 0x0001_0000)]
    #[case(ConnectionId { index: 7, generation: 3 }, 0x0003_0007)]
    #[case(ConnectionId { index: 0xffff, generation: 0xffff }, 0xffff_ffff)]
    fn test_conv(#[case] id: ConnectionId, #[case] conv: u32) {
        assert_eq!(id.to_conv(), conv);
        assert_eq!(ConnectionId::from_conv(conv), id);
    }

    #[test]
    fn test_conv_is_never_zero() {
        let mut table = ConnectionTable::new();
        for _ in 0..3 {
            let id = table.insert(()).unwrap();
            assert_ne!(id.to_conv(), 0);
            table.remove(id);
        }
    }
}
