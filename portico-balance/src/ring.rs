/// Virtual nodes per target.
pub const DEFAULT_REPLICAS: usize = 150;

/// Consistent-hash ring over a fixed target set.
///
/// Immutable once built: health changes and upstream edits produce a
/// replacement ring, never an in-place mutation. Entries are
/// `(hash, target index)` sorted by hash; selection walks to the first
/// entry with hash ≥ the key hash, wrapping around.
#[derive(Debug)]
pub struct HashRing {
    entries: Vec<(u32, usize)>,
    addrs: Vec<String>,
}

impl HashRing {
    /// Build a ring with `replicas` virtual nodes per target. Each virtual
    /// node hashes `{host}:{port}#{replica}`.
    pub fn build(addrs: &[String], replicas: usize) -> Self {
        let mut entries = Vec::with_capacity(addrs.len() * replicas);
        for (idx, addr) in addrs.iter().enumerate() {
            for replica in 0..replicas {
                entries.push((fnv1a32(format!("{addr}#{replica}").as_bytes()), idx));
            }
        }
        entries.sort_unstable();
        Self {
            entries,
            addrs: addrs.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target addresses this ring was built over.
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Deterministically map a key (client IP) to a target address.
    pub fn select(&self, key: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = fnv1a32(key.as_bytes());
        let pos = self
            .entries
            .partition_point(|(h, _)| *h < hash)
            // wrap around past the last virtual node
            % self.entries.len();
        Some(self.addrs[self.entries[pos].1].as_str())
    }
}

/// FNV-1a, 32-bit. Fast and stable across runs and platforms.
#[inline]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
