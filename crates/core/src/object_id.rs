//! 12-byte document identifiers.
//!
//! Layout: 4-byte seconds-since-epoch, 5-byte process-random, 3-byte
//! monotonic counter. The counter guarantees local ordering for ids minted
//! within the same second on the same process; the random component keeps
//! ids from distinct processes from colliding.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A 12-byte object identifier, ordered first by its embedded timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ObjectId(#[serde(with = "bytes12")] pub [u8; 12]);

mod bytes12 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 12], s: S) -> Result<S::Ok, S::Error> {
        hex(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 12], D::Error> {
        let s = String::deserialize(d)?;
        super::ObjectId::parse(&s)
            .map(|id| id.0)
            .map_err(serde::de::Error::custom)
    }

    fn hex(bytes: &[u8; 12]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn process_random() -> [u8; 5] {
    // Derived once per process from a random seed, matching the "5-byte
    // process-random" component of the identifier.
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let mut out = [0u8; 5];
    let h1 = RandomState::new().build_hasher().finish();
    let h2 = RandomState::new().build_hasher().finish() ^ (std::process::id() as u64);
    let combined = h1 ^ h2.rotate_left(17);
    out.copy_from_slice(&combined.to_be_bytes()[..5]);
    out
}

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Process-wide 5-byte random component, computed lazily on first use.
fn random_component() -> [u8; 5] {
    use std::sync::OnceLock;
    static RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
    *RANDOM.get_or_init(process_random)
}

impl ObjectId {
    /// Mint a fresh id from the current wall-clock time.
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let random = random_component();
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&random);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        ObjectId(bytes)
    }

    /// Build an id from raw bytes, e.g. one supplied by a caller.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    /// Seconds-since-epoch embedded in this id.
    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().unwrap())
    }

    /// Raw byte representation, e.g. for use as a B+tree key.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Parse a 24-character hex string into an id.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() != 24 {
            return Err(format!("object id must be 24 hex chars, got {}", s.len()));
        }
        let mut bytes = [0u8; 12];
        for i in 0..12 {
            let byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| format!("invalid hex in object id: {e}"))?;
            bytes[i] = byte;
        }
        Ok(ObjectId(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_same_process_strictly_order_by_counter_within_a_second() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert!(a < b, "monotonic counter must break ties within a second");
    }

    #[test]
    fn round_trips_through_hex_string() {
        let id = ObjectId::new();
        let s = id.to_string();
        let parsed = ObjectId::parse(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(ObjectId::parse("not-hex").is_err());
        assert!(ObjectId::parse("ab").is_err());
    }
}
