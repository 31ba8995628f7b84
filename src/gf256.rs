//! Arithmetic over GF(2^8) with the primitive polynomial
//! x^8 + x^4 + x^3 + x^2 + 1 (0x11D).
//!
//! Multiplication goes through log/exp tables evaluated at compile time, so
//! the tables are immutable process-wide state and need no synchronization.

use crate::errors::{EngineError, Result};

const POLYNOMIAL: u16 = 0x11D;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

const fn build_tables() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLYNOMIAL;
        }
        i += 1;
    }
    // doubled so that log[a] + log[b] never needs a reduction
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    Tables { exp, log }
}

static TABLES: Tables = build_tables();

pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// Subtraction and addition coincide in characteristic 2.
pub fn sub(a: u8, b: u8) -> u8 {
    a ^ b
}

pub fn multiply(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let idx = TABLES.log[a as usize] as usize + TABLES.log[b as usize] as usize;
    TABLES.exp[idx]
}

pub fn power(a: u8, e: u32) -> u8 {
    if e == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    let idx = (TABLES.log[a as usize] as u64 * e as u64) % 255;
    TABLES.exp[idx as usize]
}

/// Multiplicative inverse via Fermat: a^254 = a^-1 for every non-zero a.
pub fn inverse(a: u8) -> Result<u8> {
    if a == 0 {
        return Err(EngineError::Domain("zero has no inverse".to_string()));
    }
    Ok(power(a, 254))
}

pub fn divide(a: u8, b: u8) -> Result<u8> {
    Ok(multiply(a, inverse(b)?))
}
