//! Per-fragment AES-256-GCM-SIV sealing. A sealed blob is the 12-byte nonce
//! followed by the ciphertext.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    errors::{EngineError, Result},
    models::key::FragmentKey,
};

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

pub fn generate_key_material() -> Vec<u8> {
    let mut key = Aes256GcmSiv::generate_key(&mut OsRng);
    let material = key.as_slice().to_vec();
    key.as_mut_slice().zeroize();
    material
}

pub fn seal(key: &FragmentKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256GcmSiv::new_from_slice(key.material())?;
    let mut nonce_buf = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_buf);
    let nonce = Nonce::from_slice(&nonce_buf);

    let ciphertext = cipher.encrypt(nonce, plaintext)?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_buf);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(key: &FragmentKey, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_LEN {
        return Err(EngineError::invalid_parameters(
            "sealed fragment is shorter than its nonce",
        ));
    }
    let cipher = Aes256GcmSiv::new_from_slice(key.material())?;
    let (nonce_buf, ciphertext) = sealed.split_at(NONCE_LEN);
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce_buf), ciphertext)?;
    Ok(Zeroizing::new(plaintext))
}

/// Overwrites a buffer in place with a zero pass followed by a random pass,
/// then zeroes and truncates it.
pub fn scrub(buf: &mut Vec<u8>) {
    buf.as_mut_slice().zeroize();
    OsRng.fill_bytes(buf.as_mut_slice());
    buf.zeroize();
}
