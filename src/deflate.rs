//! Exact DEFLATE block size accounting. Computes how many bits a block of
//! LZ77 symbols costs under each block type without emitting a bitstream;
//! the optimizer uses the dynamic-tree size as its true cost metric.

use alloc::vec::Vec;
use core::cmp;

use crate::katajainen::length_limited_code_lengths;
use crate::lz77::{Lz77Store, Symbol};
use crate::symbols::{dist_symbol, dist_symbol_extra_bits, length_symbol, length_symbol_extra_bits};
use crate::util::{NUM_D, NUM_LL};

/// The deflate block type. `Dynamic` gives the best compression.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum BlockType {
    /// Non compressed blocks (00).
    Uncompressed,
    /// Blocks with the fixed Huffman tree (01).
    Fixed,
    /// Blocks with a dynamic Huffman tree (10).
    Dynamic,
}

/// The predefined code lengths of RFC 1951 section 3.2.6.
fn fixed_tree() -> (Vec<u32>, Vec<u32>) {
    let mut ll = Vec::with_capacity(NUM_LL);
    ll.resize(144, 8);
    ll.resize(256, 9);
    ll.resize(280, 7);
    ll.resize(288, 8);
    let d = vec![5; NUM_D];
    (ll, d)
}

/// Changes the population counts in a way that the consequent Huffman tree
/// compression, especially its rle-part, will be more likely to compress this
/// data more efficiently.
fn optimize_huffman_for_rle(counts: &mut [usize]) {
    // 1) We don't want to touch the trailing zeros. We may break the rules of
    // the format by adding more data in the distance codes.
    let mut length = counts.len();
    loop {
        if length == 0 {
            return;
        }
        if counts[length - 1] != 0 {
            // Now counts[0..length - 1] does not have trailing zeros.
            break;
        }
        length -= 1;
    }

    // 2) Mark all population counts that already can be encoded with an rle
    // code: any run of 0's longer than 5, any run of non-0's longer than 7.
    let mut good_for_rle = vec![false; length];
    let mut symbol = counts[0];
    let mut stride = 0;
    for (i, &count) in counts.iter().enumerate().take(length) {
        if count != symbol {
            if (symbol == 0 && stride >= 5) || (symbol != 0 && stride >= 7) {
                for k in 0..stride {
                    good_for_rle[i - k - 1] = true;
                }
            }
            stride = 1;
            symbol = count;
        } else {
            stride += 1;
        }
    }

    // 3) Replace the population counts that lead to more rle codes.
    stride = 0;
    let mut limit = counts[0];
    let mut sum = 0;
    for i in 0..(length + 1) {
        // Heuristic for selecting the stride ranges to collapse.
        if i == length || good_for_rle[i] || (counts[i] as i64 - limit as i64).abs() >= 4 {
            if stride >= 4 || (stride >= 3 && sum == 0) {
                // The stride must end, collapse what we have, if we have
                // enough (4).
                let count = if sum == 0 {
                    // Don't upgrade an all zeros stride to ones.
                    0
                } else {
                    cmp::max((sum + stride / 2) / stride, 1)
                };
                for k in 0..stride {
                    // We don't want to change value at counts[i], that is
                    // already belonging to the next stride. Thus - 1.
                    counts[i - k - 1] = count;
                }
            }
            stride = 0;
            sum = 0;
            if length > 2 && i < length - 3 {
                // All interesting strides have a count of at least 4, at
                // least when non-zeros.
                limit = (counts[i] + counts[i + 1] + counts[i + 2] + counts[i + 3] + 2) / 4;
            } else if i < length {
                limit = counts[i];
            } else {
                limit = 0;
            }
        }
        stride += 1;
        if i != length {
            sum += counts[i];
        }
    }
}

/// Ensures there are at least 2 distance codes to support buggy decoders.
/// Zlib 1.2.1 and below fail if there isn't at least one distance code with
/// length > 0, even though that is valid per the deflate spec; some mobile
/// phones additionally require two. Adding dummy code lengths of 1 costs at
/// most a few bytes.
fn patch_distance_codes_for_buggy_decoders(d_lengths: &mut [u32]) {
    // Ignore the two unused codes from the spec.
    let num_dist_codes = d_lengths
        .iter()
        .take(30)
        .filter(|&&d_length| d_length != 0)
        .count();

    match num_dist_codes {
        0 => {
            d_lengths[0] = 1;
            d_lengths[1] = 1;
        }
        1 => {
            let index = if d_lengths[0] == 0 { 0 } else { 1 };
            d_lengths[index] = 1;
        }
        _ => {} // Two or more codes is fine.
    }
}

/// Payload size of `[lstart, lend)` in bits, summed symbol by symbol. Used
/// when the range is too small for the histogram short cut to pay off.
fn block_symbol_size_small(
    ll_lengths: &[u32],
    d_lengths: &[u32],
    lz77: &Lz77Store,
    lstart: usize,
    lend: usize,
) -> usize {
    let mut result = 0;
    for &symbol in &lz77.symbols[lstart..lend] {
        match symbol {
            Symbol::Literal(lit) => {
                result += ll_lengths[lit as usize] as usize;
            }
            Symbol::BackRef(len, dist) => {
                let ll_symbol = length_symbol(len as usize);
                let d_symbol = dist_symbol(dist);
                result += ll_lengths[ll_symbol] as usize;
                result += d_lengths[d_symbol] as usize;
                result += length_symbol_extra_bits(ll_symbol);
                result += dist_symbol_extra_bits(d_symbol);
            }
        }
    }
    result += ll_lengths[256] as usize; // end symbol
    result
}

/// Payload size of `[lstart, lend)` in bits, from a precomputed histogram.
fn block_symbol_size_given_counts(
    ll_counts: &[usize],
    d_counts: &[usize],
    ll_lengths: &[u32],
    d_lengths: &[u32],
    lz77: &Lz77Store,
    lstart: usize,
    lend: usize,
) -> usize {
    if lstart + NUM_LL * 3 > lend {
        return block_symbol_size_small(ll_lengths, d_lengths, lz77, lstart, lend);
    }
    let mut result = 0;
    for i in 0..256 {
        result += ll_lengths[i] as usize * ll_counts[i];
    }
    for i in 257..286 {
        result += ll_lengths[i] as usize * ll_counts[i];
        result += length_symbol_extra_bits(i) * ll_counts[i];
    }
    for i in 0..30 {
        result += d_lengths[i] as usize * d_counts[i];
        result += dist_symbol_extra_bits(i) * d_counts[i];
    }
    result += ll_lengths[256] as usize; // end symbol
    result
}

/// Size of the part after the header and tree of an LZ77 block, in bits.
fn block_symbol_size(
    ll_lengths: &[u32],
    d_lengths: &[u32],
    lz77: &Lz77Store,
    lstart: usize,
    lend: usize,
) -> usize {
    if lstart + NUM_LL * 3 > lend {
        block_symbol_size_small(ll_lengths, d_lengths, lz77, lstart, lend)
    } else {
        let (ll_counts, d_counts) = lz77.histogram(lstart, lend);
        block_symbol_size_given_counts(
            &ll_counts, &d_counts, ll_lengths, d_lengths, lz77, lstart, lend,
        )
    }
}

/// Size in bits of the encoded code-length tree, for one combination of the
/// three repeat codes (16: repeat previous, 17/18: repeat zero).
fn encoded_tree_size(
    ll_lengths: &[u32],
    d_lengths: &[u32],
    use_16: bool,
    use_17: bool,
    use_18: bool,
) -> usize {
    let mut hlit = 29; /* 286 - 257 */
    let mut hdist = 29; /* 32 - 1, but gzip does not like hdist > 29. */

    let mut clcounts = [0usize; 19];
    /* The order in which code length code lengths are encoded as per
    deflate. */
    const ORDER: [usize; 19] = [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

    /* Trim zeros. */
    while hlit > 0 && ll_lengths[257 + hlit - 1] == 0 {
        hlit -= 1;
    }
    while hdist > 0 && d_lengths[1 + hdist - 1] == 0 {
        hdist -= 1;
    }
    let hlit2 = hlit + 257;
    let lld_total = hlit2 + hdist + 1; /* Total amount of literal, length and distance codes. */

    let length_at = |i: usize| -> u8 {
        if i < hlit2 {
            ll_lengths[i] as u8
        } else {
            d_lengths[i - hlit2] as u8
        }
    };

    let mut i = 0;
    while i < lld_total {
        /* This is an encoding of a huffman tree, so now the length is a
        symbol. */
        let symbol = length_at(i);
        let mut count = 1;
        if use_16 || (symbol == 0 && (use_17 || use_18)) {
            let mut j = i + 1;
            while j < lld_total && symbol == length_at(j) {
                count += 1;
                j += 1;
            }
        }
        i += count - 1;

        /* Repetitions of zeroes. */
        if symbol == 0 && count >= 3 {
            if use_18 {
                while count >= 11 {
                    let count2 = cmp::min(count, 138);
                    clcounts[18] += 1;
                    count -= count2;
                }
            }
            if use_17 {
                while count >= 3 {
                    let count2 = cmp::min(count, 10);
                    clcounts[17] += 1;
                    count -= count2;
                }
            }
        }

        /* Repetitions of any symbol. */
        if use_16 && count >= 4 {
            count -= 1; /* Since the first one is hardcoded. */
            clcounts[symbol as usize] += 1;
            while count >= 3 {
                let count2 = cmp::min(count, 6);
                clcounts[16] += 1;
                count -= count2;
            }
        }

        /* No or insufficient repetition. */
        clcounts[symbol as usize] += count;
        i += 1;
    }

    let clcl = length_limited_code_lengths(&clcounts, 7);

    let mut hclen = 15;
    /* Trim zeros. */
    while hclen > 0 && clcounts[ORDER[hclen + 4 - 1]] == 0 {
        hclen -= 1;
    }

    let mut result_size = 14; /* hlit, hdist, hclen bits */
    result_size += (hclen + 4) * 3; /* clcl bits */
    for i in 0..19 {
        result_size += clcl[i] as usize * clcounts[i];
    }
    /* Extra bits. */
    result_size += clcounts[16] * 2;
    result_size += clcounts[17] * 3;
    result_size += clcounts[18] * 7;

    result_size
}

/// The exact size of the encoded tree in bits, taking the cheapest of the
/// eight repeat-code combinations.
fn tree_size(ll_lengths: &[u32], d_lengths: &[u32]) -> usize {
    let mut result = 0;
    for i in 0..8 {
        let size = encoded_tree_size(ll_lengths, d_lengths, i & 1 > 0, i & 2 > 0, i & 4 > 0);
        if result == 0 || size < result {
            result = size;
        }
    }
    result
}

/// Tries out `optimize_huffman_for_rle` for this block; if the result is
/// smaller, uses it, otherwise keeps the original counts. Returns the size of
/// the encoded tree and data in bits, not including the 3-bit block header.
fn try_optimize_huffman_for_rle(
    lz77: &Lz77Store,
    lstart: usize,
    lend: usize,
    ll_counts: Vec<usize>,
    d_counts: Vec<usize>,
    ll_lengths: Vec<u32>,
    d_lengths: Vec<u32>,
) -> (f64, Vec<u32>, Vec<u32>) {
    let treesize = tree_size(&ll_lengths, &d_lengths);
    let datasize =
        block_symbol_size_given_counts(&ll_counts, &d_counts, &ll_lengths, &d_lengths, lz77, lstart, lend);

    let mut ll_counts2 = ll_counts.clone();
    let mut d_counts2 = d_counts.clone();
    optimize_huffman_for_rle(&mut ll_counts2);
    optimize_huffman_for_rle(&mut d_counts2);

    let ll_lengths2 = length_limited_code_lengths(&ll_counts2, 15);
    let mut d_lengths2 = length_limited_code_lengths(&d_counts2, 15);
    patch_distance_codes_for_buggy_decoders(&mut d_lengths2);

    let treesize2 = tree_size(&ll_lengths2, &d_lengths2);
    /* The payload is still emitted with the real counts. */
    let datasize2 =
        block_symbol_size_given_counts(&ll_counts, &d_counts, &ll_lengths2, &d_lengths2, lz77, lstart, lend);

    if treesize2 + datasize2 < treesize + datasize {
        ((treesize2 + datasize2) as f64, ll_lengths2, d_lengths2)
    } else {
        ((treesize + datasize) as f64, ll_lengths, d_lengths)
    }
}

/// Calculates the bit lengths for the symbols of a dynamic block. Chooses bit
/// lengths that give the smallest size of tree encoding + encoding of all the
/// symbols to have the smallest output size. These are not necessarily the
/// ideal Huffman bit lengths. Returns the size of the encoded tree and data in
/// bits, not including the 3-bit block header.
fn dynamic_lengths(lz77: &Lz77Store, lstart: usize, lend: usize) -> (f64, Vec<u32>, Vec<u32>) {
    let (mut ll_counts, d_counts) = lz77.histogram(lstart, lend);
    ll_counts[256] = 1; /* End symbol. */

    let ll_lengths = length_limited_code_lengths(&ll_counts, 15);
    let mut d_lengths = length_limited_code_lengths(&d_counts, 15);
    patch_distance_codes_for_buggy_decoders(&mut d_lengths);

    try_optimize_huffman_for_rle(lz77, lstart, lend, ll_counts, d_counts, ll_lengths, d_lengths)
}

/// Calculates the size of the block `[lstart, lend)` of the store in bits,
/// including the 3-bit block header, as it would be encoded with the given
/// block type.
pub fn calculate_block_size(lz77: &Lz77Store, lstart: usize, lend: usize, btype: BlockType) -> f64 {
    match btype {
        BlockType::Uncompressed => {
            let length = lz77.byte_range(lstart, lend);
            let rem = length % 65535;
            let blocks = length / 65535 + usize::from(rem > 0);
            /* An uncompressed block must actually be split into multiple
            blocks if it's larger than 65535 bytes long. Each block header is
            5 bytes: 3 bits, padding, LEN and NLEN (the potentially smaller
            padding of the first one is ignored). */
            (blocks * 5 * 8 + length * 8) as f64
        }
        BlockType::Fixed => {
            let (ll_lengths, d_lengths) = fixed_tree();
            3.0 + block_symbol_size(&ll_lengths, &d_lengths, lz77, lstart, lend) as f64
        }
        BlockType::Dynamic => dynamic_lengths(lz77, lstart, lend).0 + 3.0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn literal_store(data: &[u8]) -> Lz77Store {
        let mut store = Lz77Store::new();
        for (i, &byte) in data.iter().enumerate() {
            store.push(u16::from(byte), 0, i);
        }
        store
    }

    #[test]
    fn fixed_tree_has_rfc_lengths() {
        let (ll, d) = fixed_tree();
        assert_eq!(ll[0], 8);
        assert_eq!(ll[143], 8);
        assert_eq!(ll[144], 9);
        assert_eq!(ll[255], 9);
        assert_eq!(ll[256], 7);
        assert_eq!(ll[279], 7);
        assert_eq!(ll[280], 8);
        assert_eq!(ll[287], 8);
        assert!(d.iter().all(|&len| len == 5));
    }

    #[test]
    fn fixed_block_size_of_single_literal() {
        let store = literal_store(b"A");
        // 3 header bits + 8 bits for 'A' + 7 bits for the end symbol.
        let bits = calculate_block_size(&store, 0, store.size(), BlockType::Fixed);
        assert_eq!(bits, 18.0);
    }

    #[test]
    fn uncompressed_block_size_formula() {
        let store = literal_store(&[0u8; 1000]);
        let bits = calculate_block_size(&store, 0, store.size(), BlockType::Uncompressed);
        assert_eq!(bits, (5 * 8 + 1000 * 8) as f64);
    }

    #[test]
    fn backref_pays_length_and_distance_bits() {
        let mut store = Lz77Store::new();
        store.push(65, 0, 0);
        store.push(65, 0, 1);
        store.push(65, 0, 2);
        // Length 10 at distance 3: fixed tree pays 7 (symbol 264) + 5 (dist).
        store.push(10, 3, 3);
        let with_ref = calculate_block_size(&store, 0, store.size(), BlockType::Fixed);
        let without_ref = calculate_block_size(&store, 0, 3, BlockType::Fixed);
        assert_eq!(with_ref - without_ref, 12.0);
    }

    #[test]
    fn dynamic_beats_fixed_on_skewed_data() {
        // A store of one repeated literal: a dynamic tree gives that literal
        // a 1-bit code, far below the fixed tree's 8 bits.
        let store = literal_store(&[b'e'; 2000]);
        let fixed = calculate_block_size(&store, 0, store.size(), BlockType::Fixed);
        let dynamic = calculate_block_size(&store, 0, store.size(), BlockType::Dynamic);
        assert!(
            dynamic < fixed,
            "dynamic {dynamic} should beat fixed {fixed} here"
        );
    }

    #[test]
    fn patch_distance_codes_guarantees_two() {
        let mut none = vec![0u32; NUM_D];
        patch_distance_codes_for_buggy_decoders(&mut none);
        assert_eq!(none.iter().filter(|&&l| l != 0).count(), 2);

        let mut one = vec![0u32; NUM_D];
        one[7] = 4;
        patch_distance_codes_for_buggy_decoders(&mut one);
        assert_eq!(one.iter().filter(|&&l| l != 0).count(), 2);

        let mut two = vec![0u32; NUM_D];
        two[3] = 2;
        two[9] = 3;
        let before = two.clone();
        patch_distance_codes_for_buggy_decoders(&mut two);
        assert_eq!(two, before);
    }

    #[test]
    fn rle_optimization_never_touches_trailing_zeros() {
        let mut counts = vec![3, 3, 3, 3, 3, 3, 3, 3, 9, 0, 0, 0];
        optimize_huffman_for_rle(&mut counts);
        assert_eq!(&counts[9..], &[0, 0, 0]);
    }

    #[test]
    fn tree_size_is_positive_and_bounded() {
        let (ll, d) = fixed_tree();
        let size = tree_size(&ll, &d);
        // At minimum the 14 header bits plus some code length codes.
        assert!(size > 14);
        // Never worse than spelling out every code length in 7-bit codes plus
        // full headers.
        assert!(size < 14 + 19 * 3 + (286 + 30) * 8);
    }
}
