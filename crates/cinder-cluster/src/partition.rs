//! Key to node mapping.
//!
//! Keys are hashed with CRC16 (XMODEM) into a fixed number of partitions,
//! and each partition is assigned to a node by rendezvous (highest random
//! weight) hashing. When a node leaves only its own partitions move.

use sha2::{Digest, Sha256};

use crate::{ClusterHash, ClusterNode, ClusterNodeId, ClusterTopology};

/// Default number of partitions.
pub const DEFAULT_PARTITIONS: u16 = 256;

/// CRC16 lookup table for the CCITT/XMODEM polynomial (0x1021).
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

/// CRC16/XMODEM checksum.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Result of mapping a key against a topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMapping {
    pub partition: u16,
    /// Node owning the partition. `None` for an empty topology.
    pub primary: Option<ClusterNode>,
    /// Hash of the topology the mapping was computed against.
    pub topology_hash: ClusterHash,
}

/// Maps keys to the node responsible for them.
pub trait PartitionMapper: Send + Sync {
    fn map(&self, key: &[u8], topology: &ClusterTopology) -> PartitionMapping;
}

/// CRC16 partitioning with rendezvous assignment.
#[derive(Debug, Clone, Copy)]
pub struct RendezvousPartitionMapper {
    partitions: u16,
}

impl RendezvousPartitionMapper {
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    pub fn new(partitions: u16) -> Self {
        assert!(partitions > 0, "partition count must be positive");
        Self { partitions }
    }

    pub fn partitions(&self) -> u16 {
        self.partitions
    }

    /// Partition of a key.
    pub fn partition_of(&self, key: &[u8]) -> u16 {
        crc16(key) % self.partitions
    }

    /// Owner of a partition. Highest weight wins, lower id on a tie.
    pub fn owner<'a>(&self, partition: u16, topology: &'a ClusterTopology) -> Option<&'a ClusterNode> {
        topology.nodes().iter().max_by(|a, b| {
            weight(&a.id, partition)
                .cmp(&weight(&b.id, partition))
                .then_with(|| b.id.cmp(&a.id))
        })
    }
}

impl Default for RendezvousPartitionMapper {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl PartitionMapper for RendezvousPartitionMapper {
    fn map(&self, key: &[u8], topology: &ClusterTopology) -> PartitionMapping {
        let partition = self.partition_of(key);
        PartitionMapping {
            partition,
            primary: self.owner(partition, topology).cloned(),
            topology_hash: topology.hash(),
        }
    }
}

fn weight(id: &ClusterNodeId, partition: u16) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(partition.to_be_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn topology(n: u16) -> ClusterTopology {
        let nodes: Vec<ClusterNode> = (0..n)
            .map(|i| {
                ClusterNode::new(ClusterNodeId::new(), test_addr(7000 + i)).with_join_order(i as u32 + 1)
            })
            .collect();
        ClusterTopology::new(nodes[0].id, nodes)
    }

    #[test]
    fn crc16_known_value() {
        // CRC16 CCITT/XMODEM of "123456789" is 0x31C3
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn empty_topology_has_no_owner() {
        let mapper = RendezvousPartitionMapper::default();
        let empty = ClusterTopology::empty(ClusterNodeId::new());
        let mapping = mapper.map(b"key", &empty);
        assert!(mapping.primary.is_none());
        assert_eq!(mapping.topology_hash, empty.hash());
    }

    #[test]
    fn mapping_is_deterministic() {
        let mapper = RendezvousPartitionMapper::default();
        let topology = topology(5);
        let a = mapper.map(b"locks/orders", &topology);
        let b = mapper.map(b"locks/orders", &topology);
        assert_eq!(a, b);
        assert!(a.primary.is_some());
        assert!(a.partition < DEFAULT_PARTITIONS);
    }

    #[test]
    fn removing_a_node_only_moves_its_partitions() {
        let mapper = RendezvousPartitionMapper::new(64);
        let full = topology(4);
        let leaving = full.nodes()[2].id;
        let reduced = full.filter(|n| n.id != leaving);

        for p in 0..mapper.partitions() {
            let before = mapper.owner(p, &full).map(|n| n.id);
            let after = mapper.owner(p, &reduced).map(|n| n.id);
            if before != Some(leaving) {
                assert_eq!(before, after, "partition {p} moved needlessly");
            } else {
                assert_ne!(after, Some(leaving));
            }
        }
    }

    #[test]
    fn partitions_spread_over_nodes() {
        let mapper = RendezvousPartitionMapper::new(256);
        let topology = topology(4);
        let mut counts: BTreeMap<ClusterNodeId, usize> = BTreeMap::new();
        for p in 0..mapper.partitions() {
            if let Some(owner) = mapper.owner(p, &topology) {
                *counts.entry(owner.id).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 4);
    }

    #[test]
    #[should_panic(expected = "must be positive")]
    fn zero_partitions_rejected() {
        RendezvousPartitionMapper::new(0);
    }
}
