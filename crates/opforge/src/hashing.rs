use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable identifier of an assembled unit.
///
/// The digest is independent of the process and the Rust toolchain, so it can
/// name artifacts on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Short prefix used in file names and log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (idx, slot) in bytes.iter_mut().enumerate() {
            let pair = value.get(idx * 2..idx * 2 + 2)?;
            *slot = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

impl Serialize for CacheKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        CacheKey::from_hex(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid cache key '{raw}'")))
    }
}

/// Length-prefixed writer over blake3.
///
/// Every field is framed with a tag and its length so that adjacent fields
/// cannot bleed into each other (`["ab", "c"]` and `["a", "bc"]` differ).
pub struct KeyHasher {
    inner: blake3::Hasher,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.inner.update(&[tag]);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.inner.update(&value.to_le_bytes());
    }

    pub fn write_strs<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let values: Vec<&str> = values.into_iter().collect();
        self.write_u64(values.len() as u64);
        for value in values {
            self.write_str(value);
        }
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(*self.inner.finalize().as_bytes())
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}
