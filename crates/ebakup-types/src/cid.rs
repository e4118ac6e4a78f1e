use std::fmt;

/// A content id: the checksum digest of an object's bytes, possibly extended
/// by disambiguation suffix octets when a different object already claimed
/// the bare digest. Opaque, ordered byte string; ordering is lexicographic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(Vec<u8>);

impl Cid {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Cid(bytes.into())
    }

    /// The empty cid, used by manifest records for content-less specials.
    pub fn empty() -> Self {
        Cid(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// True if this cid is `checksum` plus zero or more suffix octets.
    pub fn extends(&self, checksum: &[u8]) -> bool {
        self.0.starts_with(checksum)
    }
}

impl From<Vec<u8>> for Cid {
    fn from(bytes: Vec<u8>) -> Self {
        Cid(bytes)
    }
}

impl From<&[u8]> for Cid {
    fn from(bytes: &[u8]) -> Self {
        Cid(bytes.to_vec())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Cid({})", &hex[..hex.len().min(16)])
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", &hex[..hex.len().min(16)])
    }
}
