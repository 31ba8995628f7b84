//! Reed-Solomon style (n, k) threshold codec over GF(256).
//!
//! The payload is zero-padded to a multiple of `k` bytes and cut into
//! `k`-byte chunks. Fragment `i` receives, for every chunk, the product of
//! generator row `i` with that chunk. Any `k` distinct fragments identify a
//! square Vandermonde submatrix whose inverse recovers the chunks.
//!
//! The padding length is never encoded as a sentinel byte; callers carry
//! `original_len` and `pad_len` alongside the fragments (inside the sealed
//! fragment body, see [`crate::models::envelope`]).

pub mod matrix;

use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use zeroize::Zeroizing;

use crate::errors::{EngineError, Result};
use matrix::Matrix;

/// Fragment count and reconstruction threshold. Doubles as the identifier of
/// the generator matrix the fragments were produced with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecParams {
    total: u8,
    threshold: u8,
}

impl CodecParams {
    pub fn new(total: usize, threshold: usize) -> Result<Self> {
        if threshold == 0 {
            return Err(EngineError::invalid_parameters("threshold must be at least 1"));
        }
        if threshold > total {
            return Err(EngineError::InvalidParameters(format!(
                "threshold {} exceeds fragment count {}",
                threshold, total
            )));
        }
        if total > u8::MAX as usize {
            return Err(EngineError::InvalidParameters(format!(
                "at most {} fragments are supported, {} requested",
                u8::MAX,
                total
            )));
        }
        Ok(CodecParams {
            total: total as u8,
            threshold: threshold as u8,
        })
    }

    pub fn total(&self) -> usize {
        self.total as usize
    }

    pub fn threshold(&self) -> usize {
        self.threshold as usize
    }
}

impl fmt::Display for CodecParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rs({},{})", self.total, self.threshold)
    }
}

/// Output of [`ErasureCodec::encode`]. Shards are indexed by position.
#[derive(Debug)]
pub struct Encoded {
    pub shards: Vec<Vec<u8>>,
    pub original_len: usize,
    pub pad_len: usize,
}

pub struct ErasureCodec {
    min_len: usize,
    generators: DashMap<CodecParams, Arc<Matrix>>,
    inverses: DashMap<Vec<u8>, Arc<Matrix>>,
}

impl Default for ErasureCodec {
    fn default() -> Self {
        ErasureCodec::new(0)
    }
}

impl ErasureCodec {
    /// `min_len` is the floor payloads are zero-padded up to before encoding.
    pub fn new(min_len: usize) -> Self {
        ErasureCodec {
            min_len,
            generators: DashMap::new(),
            inverses: DashMap::new(),
        }
    }

    pub fn generator(&self, params: CodecParams) -> Arc<Matrix> {
        if let Some(m) = self.generators.get(&params) {
            return Arc::clone(&m);
        }
        let built = Arc::new(Matrix::vandermonde(params.total(), params.threshold()));
        // racing writers insert equal matrices, first one wins
        Arc::clone(&self.generators.entry(params).or_insert(built))
    }

    /// Inverse of the generator rows at `indices`, which must be sorted and
    /// distinct. Cached by the index tuple.
    pub fn inverse_for(&self, indices: &[u8]) -> Result<Arc<Matrix>> {
        if let Some(m) = self.inverses.get(indices) {
            return Ok(Arc::clone(&m));
        }
        let inverted = Matrix::vandermonde_rows(indices, indices.len()).invert()?;
        debug!("cached decoding matrix for indices {:?}", indices);
        Ok(Arc::clone(
            &self
                .inverses
                .entry(indices.to_vec())
                .or_insert(Arc::new(inverted)),
        ))
    }

    pub fn cached_inverses(&self) -> usize {
        self.inverses.len()
    }

    pub fn encode(&self, payload: &[u8], params: CodecParams) -> Result<Encoded> {
        let k = params.threshold();
        let n = params.total();
        let floor = payload.len().max(self.min_len);
        let padded_len = floor.div_ceil(k) * k;
        let pad_len = padded_len - payload.len();

        let mut padded = Zeroizing::new(Vec::with_capacity(padded_len));
        padded.extend_from_slice(payload);
        padded.resize(padded_len, 0u8);

        let generator = self.generator(params);
        let shard_len = padded_len / k;
        let mut shards = vec![vec![0u8; shard_len]; n];
        let mut column = vec![0u8; n];

        for (c, chunk) in padded.chunks_exact(k).enumerate() {
            generator.mul_vec(chunk, &mut column);
            for (shard, &byte) in shards.iter_mut().zip(column.iter()) {
                shard[c] = byte;
            }
        }

        Ok(Encoded {
            shards,
            original_len: payload.len(),
            pad_len,
        })
    }

    /// Recovers the payload from at least `k` `(index, shard)` pairs. The
    /// `k` lowest distinct indices are used.
    pub fn decode(
        &self,
        fragments: &[(u8, &[u8])],
        params: CodecParams,
        original_len: usize,
    ) -> Result<Vec<u8>> {
        let k = params.threshold();
        let mut chosen: Vec<(u8, &[u8])> = fragments.to_vec();
        chosen.sort_by_key(|(idx, _)| *idx);
        chosen.dedup_by_key(|(idx, _)| *idx);

        if chosen.len() < k {
            return Err(EngineError::InsufficientFragments {
                available: chosen.len(),
                required: k,
            });
        }
        chosen.truncate(k);

        if let Some((idx, _)) = chosen.iter().find(|(idx, _)| *idx as usize >= params.total()) {
            return Err(EngineError::InvalidParameters(format!(
                "fragment index {} is outside {}",
                idx, params
            )));
        }

        let shard_len = chosen[0].1.len();
        if chosen.iter().any(|(_, shard)| shard.len() != shard_len) {
            return Err(EngineError::invalid_parameters(
                "fragments have differing lengths",
            ));
        }

        let padded_len = shard_len * k;
        if original_len > padded_len {
            return Err(EngineError::InvalidParameters(format!(
                "original length {} exceeds decoded length {}",
                original_len, padded_len
            )));
        }

        let indices: Vec<u8> = chosen.iter().map(|(idx, _)| *idx).collect();
        let inverse = self.inverse_for(&indices)?;

        let mut out = vec![0u8; padded_len];
        let mut column = Zeroizing::new(vec![0u8; k]);
        for c in 0..shard_len {
            for (slot, (_, shard)) in column.iter_mut().zip(chosen.iter()) {
                *slot = shard[c];
            }
            inverse.mul_vec(&column, &mut out[c * k..(c + 1) * k]);
        }

        out.truncate(original_len);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use proptest::prelude::*;
    use rstest::rstest;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn pairs(encoded: &Encoded, indices: &[usize]) -> Vec<(u8, Vec<u8>)> {
        indices
            .iter()
            .map(|&i| (i as u8, encoded.shards[i].clone()))
            .collect()
    }

    fn decode_with(
        codec: &ErasureCodec,
        encoded: &Encoded,
        params: CodecParams,
        indices: &[usize],
    ) -> Result<Vec<u8>> {
        let owned = pairs(encoded, indices);
        let borrowed: Vec<(u8, &[u8])> = owned.iter().map(|(i, s)| (*i, s.as_slice())).collect();
        codec.decode(&borrowed, params, encoded.original_len)
    }

    #[rstest]
    #[case(5, 3)]
    #[case(7, 5)]
    #[case(4, 4)]
    #[case(4, 1)]
    fn every_k_subset_reconstructs(#[case] n: usize, #[case] k: usize) {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(n, k).unwrap();
        let payload = sample(101);
        let encoded = codec.encode(&payload, params).unwrap();
        assert_eq!(encoded.shards.len(), n);

        for subset in (0..n).combinations(k) {
            let decoded = decode_with(&codec, &encoded, params, &subset).unwrap();
            assert_eq!(decoded, payload, "subset {:?}", subset);
        }
    }

    #[test]
    fn different_subsets_agree() {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(5, 3).unwrap();
        let payload = sample(64);
        let encoded = codec.encode(&payload, params).unwrap();
        let a = decode_with(&codec, &encoded, params, &[0, 1, 2]).unwrap();
        let b = decode_with(&codec, &encoded, params, &[1, 3, 4]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn below_threshold_fails() {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(5, 3).unwrap();
        let encoded = codec.encode(&sample(40), params).unwrap();
        let err = decode_with(&codec, &encoded, params, &[0, 4]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFragments {
                available: 2,
                required: 3
            }
        ));
    }

    #[test]
    fn duplicate_indices_count_once() {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(5, 3).unwrap();
        let encoded = codec.encode(&sample(40), params).unwrap();
        let err = decode_with(&codec, &encoded, params, &[1, 1, 2]).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFragments { .. }));
    }

    #[test]
    fn trailing_zero_bytes_survive() {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(4, 3).unwrap();
        let payload = vec![1u8, 0, 0, 0, 0];
        let encoded = codec.encode(&payload, params).unwrap();
        assert_eq!(encoded.pad_len, 1);
        let decoded = decode_with(&codec, &encoded, params, &[1, 2, 3]).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn short_payloads_pad_to_the_floor() {
        let codec = ErasureCodec::new(64);
        let params = CodecParams::new(3, 2).unwrap();
        let encoded = codec.encode(b"hi", params).unwrap();
        assert_eq!(encoded.shards[0].len(), 32);
        assert_eq!(encoded.pad_len, 62);
        let decoded = decode_with(&codec, &encoded, params, &[0, 2]).unwrap();
        assert_eq!(decoded, b"hi");
    }

    #[test]
    fn encoding_is_deterministic() {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(6, 4).unwrap();
        let a = codec.encode(&sample(77), params).unwrap();
        let b = codec.encode(&sample(77), params).unwrap();
        assert_eq!(a.shards, b.shards);
    }

    #[test]
    fn inverse_cache_is_keyed_by_indices() {
        let codec = ErasureCodec::default();
        let params = CodecParams::new(5, 3).unwrap();
        let encoded = codec.encode(&sample(30), params).unwrap();
        decode_with(&codec, &encoded, params, &[4, 2, 0]).unwrap();
        decode_with(&codec, &encoded, params, &[0, 2, 4]).unwrap();
        assert_eq!(codec.cached_inverses(), 1);
        decode_with(&codec, &encoded, params, &[1, 2, 4]).unwrap();
        assert_eq!(codec.cached_inverses(), 2);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(3, 4)]
    #[case(256, 2)]
    fn invalid_params_are_rejected(#[case] n: usize, #[case] k: usize) {
        assert!(matches!(
            CodecParams::new(n, k),
            Err(EngineError::InvalidParameters(_))
        ));
    }

    proptest! {
        #[test]
        fn round_trip_from_any_k_fragments(
            payload in proptest::collection::vec(any::<u8>(), 0..300),
            n in 1usize..9,
            k_seed in 0usize..9,
            pick_seed in any::<u64>(),
        ) {
            let k = 1 + k_seed % n;
            let codec = ErasureCodec::default();
            let params = CodecParams::new(n, k).unwrap();
            let encoded = codec.encode(&payload, params).unwrap();

            let subsets: Vec<Vec<usize>> = (0..n).combinations(k).collect();
            let subset = &subsets[(pick_seed % subsets.len() as u64) as usize];
            let decoded = decode_with(&codec, &encoded, params, subset).unwrap();
            prop_assert_eq!(decoded, payload);
        }
    }
}
