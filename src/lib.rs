#![deny(trivial_casts, trivial_numeric_casts)]

//! Entropy-guided optimal LZ77 parsing ("squeeze") for DEFLATE-compatible
//! compressors.
//!
//! Given a byte range of a larger input, this crate produces the sequence of
//! LZ77 symbols (literals and length/distance back-references) that minimizes
//! the estimated bit cost of encoding the range with a Huffman cost model. The
//! parse is a shortest-path problem over the bytes of the block; because the
//! best cost model depends on the symbol frequencies of the parse itself, the
//! iterative driver repeatedly re-parses with the statistics of the previous
//! round, keeping the cheapest result under exact dynamic-tree accounting.
//!
//! # Entry points
//!
//! - [`lz77_optimal`] — the full iterative optimizer.
//! - [`lz77_optimal_fixed`] — a single pass optimized for the fixed Huffman
//!   tree of RFC 1951.
//!
//! Both append to a caller-owned [`Lz77Store`] and can use up to a window of
//! bytes before the block start as dictionary.
//!
//! ```
//! use squeeze::{lz77_optimal, BlockState, Lz77Store};
//!
//! let data = b"how much wood would a woodchuck chuck";
//! let mut state = BlockState::new(0, data.len());
//! let mut store = Lz77Store::new();
//! lz77_optimal(&mut state, data, 0, data.len(), 15, &mut store);
//! assert!(store.size() > 0);
//! ```
//!
//! This crate only chooses symbols; it does not emit a DEFLATE bitstream,
//! split blocks, or frame the result as gzip/zlib.

#[macro_use]
extern crate alloc;

pub use crate::cache::{Cache, MatchCache, NoCache};
pub use crate::deflate::{calculate_block_size, BlockType};
pub use crate::hash::{RollingHash, Which};
pub use crate::lz77::{find_longest_match, BlockState, LongestMatch, Lz77Store, Symbol};
pub use crate::squeeze::{lz77_optimal, lz77_optimal_fixed};
pub use crate::util::{MAX_MATCH, MIN_MATCH, WINDOW_SIZE};

mod cache;
mod deflate;
mod hash;
mod katajainen;
mod lz77;
mod squeeze;
mod symbols;
mod util;

#[cfg(test)]
pub(crate) mod testutil {
    use alloc::vec::Vec;

    use crate::lz77::{Lz77Store, Symbol};

    /// Expands a store back into bytes; back-references copy from the
    /// already produced output, which assumes the store starts at input
    /// position 0.
    pub(crate) fn decode(store: &Lz77Store) -> Vec<u8> {
        let mut out = Vec::new();
        for &symbol in &store.symbols {
            match symbol {
                Symbol::Literal(lit) => out.push(lit as u8),
                Symbol::BackRef(len, dist) => {
                    for _ in 0..len {
                        let byte = out[out.len() - dist as usize];
                        out.push(byte);
                    }
                }
            }
        }
        out
    }

    /// Deterministic pseudo-random bytes (xorshift32) for tests.
    pub(crate) fn xorshift_bytes(len: usize, mut state: u32) -> Vec<u8> {
        assert_ne!(state, 0);
        let mut out = Vec::with_capacity(len + 4);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use crate::lz77::{BlockState, Lz77Store, Symbol};
    use crate::squeeze::{lz77_optimal, lz77_optimal_fixed};
    use crate::testutil::decode;
    use crate::util::{MAX_MATCH, MIN_MATCH};

    fn optimal_fixed_store(data: &[u8]) -> Lz77Store {
        let mut s = BlockState::new(0, data.len());
        let mut store = Lz77Store::new();
        lz77_optimal_fixed(&mut s, data, 0, data.len(), &mut store);
        store
    }

    fn optimal_store(data: &[u8], iterations: u64) -> Lz77Store {
        let mut s = BlockState::new(0, data.len());
        let mut store = Lz77Store::new();
        lz77_optimal(&mut s, data, 0, data.len(), iterations, &mut store);
        store
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn fixed_squeeze_is_lossless(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let store = optimal_fixed_store(&data);
            prop_assert_eq!(&decode(&store), &data);
            let covered: usize = store.symbols.iter().map(Symbol::span).sum();
            prop_assert_eq!(covered, data.len());
        }

        #[test]
        fn iterated_squeeze_is_lossless_and_deterministic(
            data in prop::collection::vec(any::<u8>(), 1..2048),
            iterations in 1u64..6,
        ) {
            let first = optimal_store(&data, iterations);
            let second = optimal_store(&data, iterations);
            prop_assert_eq!(&decode(&first), &data);
            prop_assert_eq!(&first.symbols, &second.symbols);
            prop_assert_eq!(&first.pos, &second.pos);
        }

        #[test]
        fn every_emitted_symbol_is_well_formed(
            data in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            let store = optimal_fixed_store(&data);
            for (k, &symbol) in store.symbols.iter().enumerate() {
                match symbol {
                    Symbol::Literal(lit) => prop_assert!(lit <= 255),
                    Symbol::BackRef(len, dist) => {
                        prop_assert!((MIN_MATCH..=MAX_MATCH).contains(&(len as usize)));
                        prop_assert!(dist as usize <= store.pos[k]);
                        prop_assert!(dist > 0);
                    }
                }
            }
        }
    }
}
