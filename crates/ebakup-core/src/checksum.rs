use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use sha3::Sha3_256;

/// The closed set of checksum algorithms a database file may declare.
///
/// Selection is a tagged dispatch, not a trait object: the format names a
/// fixed set of algorithms and unknown names are a refusal, not an
/// extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Sha3,
}

impl ChecksumAlgorithm {
    /// The name as it appears in `edb-blocksum` and `checksum` settings.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
            ChecksumAlgorithm::Sha3 => "sha3",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"md5" => Some(ChecksumAlgorithm::Md5),
            b"sha1" => Some(ChecksumAlgorithm::Sha1),
            b"sha256" => Some(ChecksumAlgorithm::Sha256),
            b"sha512" => Some(ChecksumAlgorithm::Sha512),
            b"sha3" => Some(ChecksumAlgorithm::Sha3),
            _ => None,
        }
    }

    /// Digest length in octets.
    pub fn digest_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Sha1 => 20,
            ChecksumAlgorithm::Sha256 => 32,
            ChecksumAlgorithm::Sha512 => 64,
            ChecksumAlgorithm::Sha3 => 32,
        }
    }

    pub fn hasher(&self) -> Checksummer {
        match self {
            ChecksumAlgorithm::Md5 => Checksummer::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => Checksummer::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Checksummer::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Checksummer::Sha512(Sha512::new()),
            ChecksumAlgorithm::Sha3 => Checksummer::Sha3(Sha3_256::new()),
        }
    }

    /// One-shot digest of `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Sha256
    }
}

/// Incremental hashing state for one of the supported algorithms.
pub enum Checksummer {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    Sha3(Sha3_256),
}

impl Checksummer {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksummer::Md5(h) => h.update(data),
            Checksummer::Sha1(h) => h.update(data),
            Checksummer::Sha256(h) => h.update(data),
            Checksummer::Sha512(h) => h.update(data),
            Checksummer::Sha3(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Checksummer::Md5(h) => h.finalize().to_vec(),
            Checksummer::Sha1(h) => h.finalize().to_vec(),
            Checksummer::Sha256(h) => h.finalize().to_vec(),
            Checksummer::Sha512(h) => h.finalize().to_vec(),
            Checksummer::Sha3(h) => h.finalize().to_vec(),
        }
    }
}
