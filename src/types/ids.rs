//! Strongly-typed identifiers.
//!
//! Object identifiers are flat 64-bit values: a 16-bit node prefix followed by
//! a 48-bit per-node counter. The value `0` is reserved for "no object".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::errors::{Error, Result};

/// Number of bits available to the per-node counter.
pub const COUNTER_BITS: u32 = 48;

const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Cluster-unique identifier of a context, queue, buffer, program, kernel,
/// event, device or compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The reserved null reference.
    pub const NULL: ObjectId = ObjectId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Compose an identifier from a node prefix and a counter value.
    pub fn compose(prefix: NodePrefix, counter: u64) -> Self {
        Self((u64::from(prefix.0) << COUNTER_BITS) | (counter & COUNTER_MASK))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Prefix of the node that minted this identifier.
    pub fn prefix(self) -> NodePrefix {
        NodePrefix((self.0 >> COUNTER_BITS) as u16)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{}", self.0 >> COUNTER_BITS, self.0 & COUNTER_MASK)
    }
}

/// 16-bit prefix assigned to each node at deployment time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePrefix(pub u16);

impl fmt::Display for NodePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{:04x}", self.0)
    }
}

/// Mints identifiers in the key space of one node.
///
/// Minters with different prefixes never collide, so the client and every
/// server can mint independently.
#[derive(Debug)]
pub struct IdMinter {
    prefix: NodePrefix,
    counter: AtomicU64,
}

impl IdMinter {
    pub fn new(prefix: NodePrefix) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn prefix(&self) -> NodePrefix {
        self.prefix
    }

    /// Mint the next identifier. Fails once the 48-bit counter is spent.
    pub fn mint(&self) -> Result<ObjectId> {
        let next = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if next > COUNTER_MASK {
            return Err(Error::internal(format!(
                "identifier space of {} exhausted",
                self.prefix
            )));
        }
        Ok(ObjectId::compose(self.prefix, next))
    }
}

/// Sender-chosen identifier matching a Response to its Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr#{}", self.0)
    }
}

/// Local identity of one connection to a peer node.
///
/// Each side names the connection independently; the value never travels on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(uuid::Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", &self.0.simple().to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_compose_and_split() {
        let id = ObjectId::compose(NodePrefix(0x00ab), 42);
        assert_eq!(id.prefix(), NodePrefix(0x00ab));
        assert_eq!(id.as_u64() & COUNTER_MASK, 42);
        assert_eq!(id.to_string(), "00ab:42");
    }

    #[test]
    fn test_minter_never_yields_null() {
        let minter = IdMinter::new(NodePrefix(0));
        let first = minter.mint().unwrap();
        assert!(!first.is_null());
        assert_eq!(first.as_u64(), 1);
    }

    #[test]
    fn test_minter_exhaustion_is_an_error() {
        let minter = IdMinter::new(NodePrefix(1));
        minter.counter.store(COUNTER_MASK, Ordering::Relaxed);
        assert!(minter.mint().is_err());
    }

    #[test]
    fn test_concurrent_mints_are_distinct() {
        let minter = std::sync::Arc::new(IdMinter::new(NodePrefix(7)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let minter = minter.clone();
                std::thread::spawn(move || {
                    (0..1000).map(|_| minter.mint().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    proptest! {
        #[test]
        fn prop_ids_unique_across_nodes(
            prefixes in proptest::collection::hash_set(any::<u16>(), 1..6),
            per_node in 1usize..200,
        ) {
            let minters: Vec<_> = prefixes.into_iter().map(|p| IdMinter::new(NodePrefix(p))).collect();
            let mut seen = HashSet::new();
            for minter in &minters {
                for _ in 0..per_node {
                    let id = minter.mint().unwrap();
                    prop_assert!(!id.is_null());
                    prop_assert!(seen.insert(id));
                }
            }
        }
    }
}
