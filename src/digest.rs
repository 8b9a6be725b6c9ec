use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::{PatchError, Result};

/// Buffer used when streaming files through the hasher.
const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// 256-bit BLAKE3 content digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Digest(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Digest(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub fn hash_bytes(data: &[u8]) -> Digest {
    blake3::hash(data).into()
}

pub fn hash_reader(reader: impl Read) -> std::io::Result<Digest> {
    hash_reader_sized(reader).map(|(digest, _)| digest)
}

/// Hash a stream and report how many bytes went through the hasher.
pub fn hash_reader_sized(reader: impl Read) -> std::io::Result<(Digest, u64)> {
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, reader);
    let mut hasher = blake3::Hasher::new();
    let len = std::io::copy(&mut reader, &mut hasher)?;
    Ok((hasher.finalize().into(), len))
}

/// Stream-hash a file in bounded chunks; never loads the whole file.
pub fn hash_file(path: &Path) -> Result<Digest> {
    let file = std::fs::File::open(path).map_err(|e| PatchError::io(path, e))?;
    hash_reader(file).map_err(|e| PatchError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let digest = hash_bytes(b"hello world");
        let parsed: Digest = digest.to_hex().parse().unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(digest.to_hex().len(), 64);
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = vec![7u8; HASH_BUFFER_SIZE * 2 + 13];
        let (streamed, len) = hash_reader_sized(&data[..]).unwrap();
        assert_eq!(streamed, hash_bytes(&data));
        assert_eq!(len, data.len() as u64);
    }

    #[test]
    fn test_rejects_short_hex() {
        assert!("abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn test_serializes_as_hex_string() {
        let digest = hash_bytes(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
