//! Erasure-coded payload fragments that destroy themselves.
//!
//! A payload is split into `n` Reed-Solomon fragments over GF(256), any `k`
//! of which reconstruct it. Each fragment is sealed under its own key,
//! placed at a storage location chosen to stay retrievable within the TTL,
//! and destroyed when the TTL runs out: key first, then the local buffer,
//! then any cached and remote copies.

pub mod codec;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod gf256;
pub mod lifecycle;
pub mod models;
pub mod placement;
pub mod reconstruct;

pub use codec::{CodecParams, ErasureCodec};
pub use collaborators::{
    DirectoryStorage, KeyStore, MemoryKeyStore, MemoryStorage, StorageCollaborator,
};
pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{EngineError, Result};
pub use models::{
    fragment::FragmentStatus,
    handle::SetHandle,
    placement::{Candidate, LocationId, PlacementAssignment},
    record::ReconstructionRecord,
    status::{FragmentSetStatus, SetState},
};
