//! Overlay node Id, lookup target, or content address.
use ed25519_dalek::VerifyingKey;
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Overlay node Id, lookup target, or content address.
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Derive a node Id from an ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());

        Id(hasher.digest().bytes())
    }

    /// Bitwise XOR of two ids, the raw distance between them.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Compare the distances from `a` and `b` to this target.
    ///
    /// The XOR result is read as a big-endian unsigned magnitude, so comparing
    /// the byte arrays lexicographically compares the distances. Equal
    /// distances fall back to the raw value of the ids.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        a.xor(self)
            .cmp(&b.xor(self))
            .then_with(|| a.cmp(b))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() % 2 != 0 {
            return Err(Error::InvalidIdEncoding(
                "Number of Hex characters should be even".into(),
            ));
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);

        for i in 0..s.len() / 2 {
            let byte_str = s
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| Error::InvalidIdEncoding("Non ASCII characters".into()))?;

            match u8::from_str_radix(byte_str, 16) {
                Ok(byte) => bytes.push(byte),
                Err(_) => return Err(Error::InvalidIdEncoding("Invalid hex character".into())),
            };
        }

        Id::from_bytes(bytes)
    }
}
