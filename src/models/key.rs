use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier under which a fragment key lives in the key store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: &str) -> Self {
        KeyId(id.to_string())
    }

    pub fn for_fragment(set: Uuid, index: u8) -> Self {
        KeyId(format!("{}/{}", set.simple(), index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-fragment symmetric key. The material is wiped whenever a copy is
/// dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FragmentKey {
    #[zeroize(skip)]
    pub id: KeyId,
    material: Vec<u8>, // 256-bit AES-GCM-SIV key
}

impl FragmentKey {
    pub fn new(id: KeyId, material: Vec<u8>) -> Self {
        FragmentKey { id, material }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }
}

// key material never reaches the logs
impl fmt::Debug for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FragmentKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_material() {
        let key = FragmentKey::new(KeyId::new("a/1"), vec![0xAB; 32]);
        let shown = format!("{:?}", key);
        assert!(shown.contains("a/1"));
        assert!(!shown.contains("171"));
    }

    #[test]
    fn zeroize_clears_material() {
        let mut key = FragmentKey::new(KeyId::new("a/2"), vec![0x55; 32]);
        key.zeroize();
        assert!(key.material().is_empty());
    }
}
