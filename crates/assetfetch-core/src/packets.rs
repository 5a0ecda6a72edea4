use bytes::Bytes;

use crate::error::PacketError;

/// Payload of packet 0 (the header packet) unless the whole asset is smaller.
pub const FIRST_PACKET_SIZE: usize = 600;
/// Payload of every packet between the first and the last.
pub const MAX_PACKET_SIZE: usize = 1000;

/// Number of packets an asset of `file_size` bytes is split into.
pub fn packet_count(file_size: usize) -> u32 {
    if file_size <= FIRST_PACKET_SIZE {
        return 1;
    }
    ((file_size - FIRST_PACKET_SIZE).div_ceil(MAX_PACKET_SIZE) + 1) as u32
}

/// How cached bytes line up with packet boundaries before the first packet
/// request goes out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketResume {
    /// Nothing cached; request from packet 0.
    Fresh,
    /// Cached bytes end on a packet boundary; request from `first`.
    From { first: u32 },
    /// Cached bytes do not end on a packet boundary and must be purged.
    Misaligned,
    /// Aligned, but the total size is unknown (cached by HTTP); refetch the
    /// header.
    Refetch,
}

/// Reassembly buffer for one asset. Packets may arrive in any order; only the
/// run contiguous from the first requested packet is usable.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    packets: Vec<Option<Bytes>>,
    total: u32,
    first: u32,
    // Highest index such that every packet in `first..=last` is present.
    last: Option<u32>,
}

impl PacketBuffer {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Decide where a packet request should start given `cached` bytes
    /// already buffered and the asset's `file_size` (0 when unknown).
    pub fn setup(&mut self, cached: usize, file_size: usize) -> PacketResume {
        if cached == 0 {
            return PacketResume::Fresh;
        }
        if cached < FIRST_PACKET_SIZE || (cached - FIRST_PACKET_SIZE) % MAX_PACKET_SIZE != 0 {
            self.clear();
            return PacketResume::Misaligned;
        }
        if file_size == 0 {
            self.clear();
            return PacketResume::Refetch;
        }
        let first = ((cached - FIRST_PACKET_SIZE) / MAX_PACKET_SIZE + 1) as u32;
        self.first = first;
        self.last = Some(first - 1);
        self.total = packet_count(file_size);
        PacketResume::From { first }
    }

    /// A header (or a resume) has been seen.
    pub fn started(&self) -> bool {
        self.last.is_some()
    }

    pub fn set_total(&mut self, total: u32) {
        self.total = total;
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Packet the peer should send next.
    pub fn next_packet(&self) -> u32 {
        self.last.map_or(0, |last| last + 1)
    }

    pub fn have_all(&self) -> bool {
        self.total > 0 && self.last.is_some_and(|last| last + 1 >= self.total)
    }

    /// Store packet `index`, then extend the contiguous run.
    pub fn insert(&mut self, index: u32, data: Bytes) -> Result<(), PacketError> {
        if index >= self.total {
            return Err(PacketError::OutOfRange {
                index,
                total: self.total,
            });
        }
        if index > 0 && index < self.total - 1 && data.len() != MAX_PACKET_SIZE {
            return Err(PacketError::BadSize {
                index,
                size: data.len(),
                expected: MAX_PACKET_SIZE,
            });
        }
        let slot = index as usize;
        if slot >= self.packets.len() {
            self.packets.resize(slot + 1, None);
        } else if self.packets[slot].is_some() {
            return Err(PacketError::Duplicate(index));
        }
        self.packets[slot] = Some(data);
        let mut next = self.next_packet() as usize;
        while matches!(self.packets.get(next), Some(Some(_))) {
            self.last = Some(next as u32);
            next += 1;
        }
        Ok(())
    }

    /// Packets `first..=last`, in order.
    pub fn contiguous(&self) -> impl Iterator<Item = &Bytes> + '_ {
        let end = self.last.map_or(0, |last| last as usize + 1);
        self.packets
            .iter()
            .take(end)
            .skip(self.first as usize)
            .flatten()
    }

    pub fn contiguous_len(&self) -> usize {
        self.contiguous().map(Bytes::len).sum()
    }

    /// Packets received so far, contiguous or not.
    pub fn received(&self) -> usize {
        self.packets.iter().filter(|p| p.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(index: u32, len: usize) -> Bytes {
        Bytes::from(vec![index as u8; len])
    }

    fn assembled(buf: &PacketBuffer) -> Vec<u8> {
        buf.contiguous().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn out_of_order_matches_in_order() {
        let sizes = [FIRST_PACKET_SIZE, MAX_PACKET_SIZE, 123];
        let mut in_order = PacketBuffer::default();
        in_order.set_total(3);
        for (i, len) in sizes.iter().enumerate() {
            in_order.insert(i as u32, packet(i as u32, *len)).expect("insert");
        }

        let mut shuffled = PacketBuffer::default();
        shuffled.set_total(3);
        shuffled.insert(2, packet(2, sizes[2])).expect("insert 2");
        assert_eq!(shuffled.last(), None);
        assert_eq!(shuffled.contiguous_len(), 0);
        shuffled.insert(0, packet(0, sizes[0])).expect("insert 0");
        assert_eq!(shuffled.last(), Some(0));
        assert!(!shuffled.have_all());
        shuffled.insert(1, packet(1, sizes[1])).expect("insert 1");

        assert!(shuffled.have_all());
        assert_eq!(assembled(&shuffled), assembled(&in_order));
        assert_eq!(shuffled.contiguous_len(), 600 + 1000 + 123);
    }

    #[test]
    fn rejects_bad_packets() {
        let mut buf = PacketBuffer::default();
        buf.set_total(3);
        assert_eq!(
            buf.insert(3, packet(3, 10)),
            Err(PacketError::OutOfRange { index: 3, total: 3 })
        );
        assert_eq!(
            buf.insert(1, packet(1, 999)),
            Err(PacketError::BadSize {
                index: 1,
                size: 999,
                expected: MAX_PACKET_SIZE
            })
        );
        buf.insert(0, packet(0, FIRST_PACKET_SIZE)).expect("first");
        assert_eq!(
            buf.insert(0, packet(0, FIRST_PACKET_SIZE)),
            Err(PacketError::Duplicate(0))
        );
        assert_eq!(buf.received(), 1);
    }

    #[test]
    fn resume_from_aligned_cache() {
        let mut buf = PacketBuffer::default();
        assert_eq!(buf.setup(0, 0), PacketResume::Fresh);
        assert_eq!(buf.setup(1600, 5000), PacketResume::From { first: 2 });
        assert_eq!(buf.next_packet(), 2);
        assert_eq!(buf.total(), packet_count(5000));
        buf.insert(2, packet(2, MAX_PACKET_SIZE)).expect("resume packet");
        assert_eq!(buf.contiguous_len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn misaligned_or_unsized_cache_restarts() {
        let mut buf = PacketBuffer::default();
        assert_eq!(buf.setup(1234, 5000), PacketResume::Misaligned);
        assert_eq!(buf.setup(300, 5000), PacketResume::Misaligned);
        assert_eq!(buf.setup(600, 0), PacketResume::Refetch);
        assert!(!buf.started());
        assert_eq!(buf.next_packet(), 0);
    }

    #[test]
    fn counts_packets() {
        assert_eq!(packet_count(1), 1);
        assert_eq!(packet_count(600), 1);
        assert_eq!(packet_count(601), 2);
        assert_eq!(packet_count(1600), 2);
        assert_eq!(packet_count(1601), 3);
    }

    fn size_of(index: u32, total: u32) -> usize {
        match index {
            0 => FIRST_PACKET_SIZE,
            i if i + 1 == total => 17,
            _ => MAX_PACKET_SIZE,
        }
    }

    proptest! {
        #[test]
        fn any_delivery_order_reassembles(
            order in (2u32..10).prop_flat_map(|n| Just((0..n).collect::<Vec<u32>>()).prop_shuffle())
        ) {
            let total = order.len() as u32;
            let mut buf = PacketBuffer::default();
            buf.set_total(total);
            for &index in &order {
                prop_assert!(!buf.have_all());
                buf.insert(index, packet(index, size_of(index, total))).expect("insert");
            }
            prop_assert!(buf.have_all());
            let expected: Vec<u8> = (0..total)
                .flat_map(|i| std::iter::repeat_n(i as u8, size_of(i, total)))
                .collect();
            prop_assert_eq!(assembled(&buf), expected);
        }
    }
}
