use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{crypto, errors::Result, models::key::FragmentKey};

/// Plaintext carried inside a sealed fragment. The padding metadata needed
/// to strip the decoded payload rides here, so it disappears together with
/// the fragment key.
#[derive(Serialize, Deserialize, Debug, Zeroize, ZeroizeOnDrop)]
pub struct FragmentBody {
    pub set_id: [u8; 16],
    pub index: u8,
    pub total: u8,
    pub threshold: u8,
    pub original_len: u64,
    pub pad_len: u64,
    pub shard: Vec<u8>,
}

impl FragmentBody {
    pub fn set_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.set_id)
    }

    /// Serializes and encrypts the body under `key`.
    pub fn seal(&self, key: &FragmentKey) -> Result<Vec<u8>> {
        let plain = Zeroizing::new(bincode::serialize(self)?);
        crypto::seal(key, &plain)
    }

    pub fn open(key: &FragmentKey, sealed: &[u8]) -> Result<Self> {
        let plain = crypto::open(key, sealed)?;
        let body: FragmentBody = bincode::deserialize(&plain)?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::key::KeyId;

    fn key(byte: u8) -> FragmentKey {
        FragmentKey::new(KeyId::new("t/0"), vec![byte; 32])
    }

    fn body() -> FragmentBody {
        FragmentBody {
            set_id: *Uuid::new_v4().as_bytes(),
            index: 2,
            total: 5,
            threshold: 3,
            original_len: 9,
            pad_len: 3,
            shard: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn sealed_body_opens_with_its_key() {
        let original = body();
        let sealed = original.seal(&key(7)).unwrap();
        let opened = FragmentBody::open(&key(7), &sealed).unwrap();
        assert_eq!(opened.shard, original.shard);
        assert_eq!(opened.set_id, original.set_id);
        assert_eq!(opened.pad_len, 3);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = body().seal(&key(7)).unwrap();
        assert!(FragmentBody::open(&key(8), &sealed).is_err());
    }
}
