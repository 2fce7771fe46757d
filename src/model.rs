use serde::{Deserialize, Serialize};
use sha1::Digest as _;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    Sha1 = 0,
    Blake3 = 1,
}

impl HashAlgorithm {
    fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Blake3 => 32,
        }
    }
}

/// A content checksum, tagged with the algorithm that produced it.
///
/// SHA-1 digests occupy the first 20 bytes of `hash`, the rest is zeroed.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Checksum {
    pub hash_algorithm: HashAlgorithm,
    pub hash: [u8; 32],
}

impl Checksum {
    pub fn compute(hash_algorithm: HashAlgorithm, contents: &[u8]) -> Self {
        let mut hash = [0; 32];
        match hash_algorithm {
            HashAlgorithm::Sha1 => {
                hash[..20].copy_from_slice(&sha1::Sha1::digest(contents));
            }
            HashAlgorithm::Blake3 => {
                hash = *blake3::hash(contents).as_bytes();
            }
        }
        Self {
            hash_algorithm,
            hash,
        }
    }

    pub fn matches(&self, contents: &[u8]) -> bool {
        Self::compute(self.hash_algorithm, contents) == *self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.hash[..self.hash_algorithm.digest_len()]
    }
}

/// The plaintext checksum identifying one backed up file.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Signature(pub Checksum);

impl Signature {
    pub fn from_contents(contents: &[u8]) -> Self {
        Self(Checksum::compute(HashAlgorithm::Blake3, contents))
    }
}

/// Identity of a container: derived from its host URI and its chunk descriptors.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub [u8; 16]);

/// Per-chunk AES-256 key.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkKey(pub [u8; 32]);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Zstd = 1,
}

/// Where a chunk lives inside its container payload, and how to turn it back
/// into plaintext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub offset: u32,
    pub encrypted_size: u32,
    /// Plaintext size after decryption and decompression.
    pub size: u32,
    pub compression: Compression,
    pub key: ChunkKey,
    /// Checksum over the plaintext.
    pub checksum: Checksum,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HostInfo {
    pub uri: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl HostInfo {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: "GET".into(),
            headers: vec![],
        }
    }
}

/// An encrypted bundle of chunks, fetched from one storage host as one payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub id: ContainerId,
    pub host: HostInfo,
    pub chunks: Vec<ChunkDescriptor>,
}

impl Container {
    pub fn new(host: HostInfo, chunks: Vec<ChunkDescriptor>) -> Self {
        let id = container_id(&host, &chunks);
        Self { id, host, chunks }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The payload length this container's descriptors require.
    pub fn payload_len(&self) -> u64 {
        self.chunks
            .iter()
            .map(|chunk| chunk.offset as u64 + chunk.encrypted_size as u64)
            .max()
            .unwrap_or(0)
    }
}

fn container_id(host: &HostInfo, chunks: &[ChunkDescriptor]) -> ContainerId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(host.uri.as_bytes());
    hasher.update(&(chunks.len() as u64).to_le_bytes());
    for chunk in chunks {
        hasher.update(&chunk.offset.to_le_bytes());
        hasher.update(&chunk.encrypted_size.to_le_bytes());
        hasher.update(&chunk.size.to_le_bytes());
        hasher.update(&[chunk.compression as u8]);
        hasher.update(&chunk.key.0);
        hasher.update(&[chunk.checksum.hash_algorithm as u8]);
        hasher.update(&chunk.checksum.hash);
    }
    let mut id = [0; 16];
    id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    ContainerId(id)
}

/// One chunk of one container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkReference {
    pub container: ContainerId,
    pub index: u32,
}

/// The ordered chunks whose concatenation is a file's plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyPlan {
    pub signature: Signature,
    pub references: Vec<ChunkReference>,
}

impl ReassemblyPlan {
    pub fn containers(&self) -> impl Iterator<Item = ContainerId> + '_ {
        self.references.iter().map(|reference| reference.container)
    }
}

mod dbg {
    use super::*;
    use core::fmt;

    impl fmt::Debug for Checksum {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.hash_algorithm {
                HashAlgorithm::Sha1 => {
                    write!(f, "SHA1:{:x}", base16ct::HexDisplay(self.as_bytes()))
                }
                HashAlgorithm::Blake3 => {
                    write!(f, "BLAKE3:{:x}", base16ct::HexDisplay(self.as_bytes()))
                }
            }
        }
    }

    impl fmt::Debug for Signature {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Signature({:?})", self.0)
        }
    }

    impl fmt::Display for Signature {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(self.0.as_bytes()))
        }
    }

    impl fmt::Debug for ContainerId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "ContainerId({:x})", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Display for ContainerId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    // never print key material
    impl fmt::Debug for ChunkKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("ChunkKey(…)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(offset: u32) -> ChunkDescriptor {
        ChunkDescriptor {
            offset,
            encrypted_size: 4,
            size: 4,
            compression: Compression::None,
            key: ChunkKey([7; 32]),
            checksum: Checksum::compute(HashAlgorithm::Sha1, b"abcd"),
        }
    }

    #[test]
    fn container_identity_covers_host_and_chunks() {
        let a = Container::new(HostInfo::get("http://a/1"), vec![descriptor(0)]);
        let b = Container::new(HostInfo::get("http://a/1"), vec![descriptor(0)]);
        let other_host = Container::new(HostInfo::get("http://b/1"), vec![descriptor(0)]);
        let other_chunks = Container::new(
            HostInfo::get("http://a/1"),
            vec![descriptor(0), descriptor(4)],
        );

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, other_host.id);
        assert_ne!(a.id, other_chunks.id);
        assert_eq!(other_chunks.payload_len(), 8);
    }

    #[test]
    fn checksums_verify_their_algorithm() {
        let sha1 = Checksum::compute(HashAlgorithm::Sha1, b"hello");
        assert_eq!(sha1.as_bytes().len(), 20);
        assert!(sha1.hash[20..].iter().all(|b| *b == 0));
        assert!(sha1.matches(b"hello"));
        assert!(!sha1.matches(b"hellO"));

        let blake3 = Checksum::compute(HashAlgorithm::Blake3, b"hello");
        assert_ne!(sha1, blake3);
        assert!(blake3.matches(b"hello"));
    }

    #[test]
    fn debug_output_is_hex() {
        let signature = Signature::from_contents(b"");
        let printed = format!("{signature:?}");
        assert!(printed.starts_with("Signature(BLAKE3:af1349b9"));
        assert_eq!(format!("{signature}").len(), 64);
        assert_eq!(format!("{:?}", ChunkKey([1; 32])), "ChunkKey(…)");
    }
}
