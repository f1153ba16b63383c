//! Optimal LZ77 parsing driven by a bit-cost model.
//!
//! Instead of greedily taking the longest match, every byte of the block is a
//! node in a shortest-path problem whose edge weights are estimated symbol
//! costs. The catch is that good costs come from the Huffman trees of the
//! final output, which does not exist yet; so the driver alternates between
//! parsing with the current cost model and re-deriving the model from the
//! parse, nudging the frequencies randomly when the iteration gets stuck.

use alloc::vec::Vec;
use core::cmp;

use lockfree_object_pool::LinearObjectPool;
use log::debug;
use once_cell::sync::Lazy;

use crate::cache::Cache;
use crate::deflate::{calculate_block_size, BlockType};
use crate::hash::RollingHash;
use crate::lz77::{find_longest_match, BlockState, Lz77Store, Symbol};
use crate::symbols::{dist_extra_bits, dist_symbol, length_extra_bits, length_symbol};
use crate::util::{LARGE_FLOAT, MAX_MATCH, MIN_MATCH, NUM_D, NUM_LL, WINDOW_MASK, WINDOW_SIZE};

const K_INV_LOG2: f64 = core::f64::consts::LOG2_E; // 1.0 / log(2.0)

/// The driver re-parses the block once per iteration; the scratch stores are
/// pooled so repeated blocks reuse their allocations.
static SCRATCH_STORE_POOL: Lazy<LinearObjectPool<Lz77Store>> =
    Lazy::new(|| LinearObjectPool::new(Lz77Store::new, Lz77Store::reset));

/// Cost model which exactly matches the fixed tree of RFC 1951.
///
/// `litlen` is a literal byte value when `dist` is 0 and a match length
/// otherwise, here and in every other cost model.
fn fixed_cost(litlen: usize, dist: u16) -> f64 {
    let result = if dist == 0 {
        if litlen <= 143 {
            8
        } else {
            9
        }
    } else {
        let dbits = dist_extra_bits(dist);
        let lbits = length_extra_bits(litlen);
        let lsym = length_symbol(litlen);
        // Every dist symbol has length 5.
        7 + usize::from(lsym > 279) + 5 + dbits + lbits
    };
    result as f64
}

/// Cost model based on collected symbol statistics.
fn stat_cost(litlen: usize, dist: u16, stats: &SymbolStats) -> f64 {
    if dist == 0 {
        stats.ll_symbols[litlen]
    } else {
        let lsym = length_symbol(litlen);
        let lbits = length_extra_bits(litlen) as f64;
        let dsym = dist_symbol(dist);
        let dbits = dist_extra_bits(dist) as f64;
        lbits + dbits + stats.ll_symbols[lsym] + stats.d_symbols[dsym]
    }
}

/// "Multiply-With-Carry" generator of G. Marsaglia. Deterministically seeded
/// so that repeated runs perturb the statistics identically.
struct RanState {
    m_w: u32,
    m_z: u32,
}

impl RanState {
    fn new() -> RanState {
        RanState { m_w: 1, m_z: 2 }
    }

    fn random_marsaglia(&mut self) -> u32 {
        self.m_z = 36969 * (self.m_z & 65535) + (self.m_z >> 16);
        self.m_w = 18000 * (self.m_w & 65535) + (self.m_w >> 16);
        (self.m_z << 16).wrapping_add(self.m_w) // 32-bit result.
    }
}

/// Frequency counts over both deflate alphabets, with the entropy-derived
/// fractional bit length of each symbol. The bit lengths are what the
/// statistical cost model reads; the counts are bookkeeping between runs.
#[derive(Copy, Clone)]
struct SymbolStats {
    /* The literal and length symbols. */
    litlens: [usize; NUM_LL],
    /* The 32 unique dist symbols, not the 32768 possible dists. */
    dists: [usize; NUM_D],

    /* Length of each lit/len symbol in bits. */
    ll_symbols: [f64; NUM_LL],
    /* Length of each dist symbol in bits. */
    d_symbols: [f64; NUM_D],
}

impl SymbolStats {
    fn new() -> SymbolStats {
        SymbolStats {
            litlens: [0; NUM_LL],
            dists: [0; NUM_D],
            ll_symbols: [0.0; NUM_LL],
            d_symbols: [0.0; NUM_D],
        }
    }

    fn clear_freqs(&mut self) {
        self.litlens = [0; NUM_LL];
        self.dists = [0; NUM_D];
    }

    /// Replaces a third of the frequencies, on average, with that of a
    /// randomly picked other symbol. Used to kick a stagnated iteration out
    /// of its local minimum.
    fn randomize_freqs(&mut self, state: &mut RanState) {
        fn randomize(freqs: &mut [usize], state: &mut RanState) {
            let n = freqs.len();
            for i in 0..n {
                if (state.random_marsaglia() >> 4) % 3 == 0 {
                    let index = state.random_marsaglia() as usize % n;
                    freqs[i] = freqs[index];
                }
            }
        }
        randomize(&mut self.litlens, state);
        randomize(&mut self.dists, state);
        self.litlens[256] = 1; // End symbol.
    }

    /// Mixes another set of frequencies into this one, weighed. The driver
    /// uses it to damp oscillation once randomization has kicked in.
    fn add_weighed_freqs(&mut self, w1: f64, other: &SymbolStats, w2: f64) {
        for (freq, &other_freq) in self.litlens.iter_mut().zip(other.litlens.iter()) {
            *freq = (*freq as f64 * w1 + other_freq as f64 * w2) as usize;
        }
        for (freq, &other_freq) in self.dists.iter_mut().zip(other.dists.iter()) {
            *freq = (*freq as f64 * w1 + other_freq as f64 * w2) as usize;
        }
        self.litlens[256] = 1; // End symbol.
    }

    /// Derives the fractional bit length of each symbol from the counts. The
    /// result resembles real Huffman code lengths but carries the exact
    /// entropy, so it cannot be used to encode an actual tree.
    fn calculate_entropy(&mut self) {
        fn entropy_of(count: &[usize], bitlengths: &mut [f64]) {
            let n = count.len();
            let sum: usize = count.iter().sum();
            let log2sum = (if sum == 0 { n } else { sum } as f64).ln() * K_INV_LOG2;

            for i in 0..n {
                // When the count of the symbol is 0, but its cost is requested
                // anyway, it means the symbol will appear at least once anyway,
                // so give it the cost as if its count is 1.
                if count[i] == 0 {
                    bitlengths[i] = log2sum;
                } else {
                    bitlengths[i] = log2sum - (count[i] as f64).ln() * K_INV_LOG2;
                }

                // Depending on compiler and architecture, the above subtraction
                // of two floating point numbers may give a negative result very
                // close to zero instead of zero. Clamp it to zero; imprecision
                // at this scale does not affect the cost model.
                if bitlengths[i] < 0.0 && bitlengths[i] > -1e-5 {
                    bitlengths[i] = 0.0;
                }
                debug_assert!(bitlengths[i] >= 0.0);
            }
        }

        entropy_of(&self.litlens, &mut self.ll_symbols);
        entropy_of(&self.dists, &mut self.d_symbols);
    }

    /// Adds the symbol statistics from the store and recomputes the entropy.
    fn collect(&mut self, store: &Lz77Store) {
        for &symbol in &store.symbols {
            match symbol {
                Symbol::Literal(lit) => self.litlens[lit as usize] += 1,
                Symbol::BackRef(len, dist) => {
                    self.litlens[length_symbol(len as usize)] += 1;
                    self.dists[dist_symbol(dist)] += 1;
                }
            }
        }
        self.litlens[256] = 1; /* End symbol. */

        self.calculate_entropy();
    }
}

/// Finds the minimum possible cost this cost model can return for any valid
/// length and distance symbol, a lower bound the forward pass prunes with.
fn min_symbol_cost<F: Fn(usize, u16) -> f64>(costmodel: &F) -> f64 {
    // Table of distances that have a different distance symbol in the deflate
    // specification. Each value is the first distance that has a new symbol.
    // Only different symbols affect the cost model so only these need to be
    // checked. See RFC 1951 section 3.2.5.
    const DSYMBOL_BOUNDARIES: [u16; 30] = [
        1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
        2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
    ];

    let mut bestlength = 0; // length with the lowest cost in the cost model
    let mut mincost = LARGE_FLOAT;
    for length in MIN_MATCH..=MAX_MATCH {
        let c = costmodel(length, 1);
        if c < mincost {
            bestlength = length;
            mincost = c;
        }
    }

    let mut bestdist = 0; // distance with the lowest cost in the cost model
    mincost = LARGE_FLOAT;
    for dist in DSYMBOL_BOUNDARIES {
        let c = costmodel(3, dist);
        if c < mincost {
            bestdist = dist;
            mincost = c;
        }
    }

    costmodel(bestlength, bestdist)
}

/// Performs the forward pass for the squeeze: computes, for every byte of the
/// block, the best length to reach that byte from an earlier one under the
/// cost model. Returns the model cost of reaching the end, along with the
/// length array the backward trace consumes.
///
/// `RUN_SHORTCUT` enables the same-byte-run fast path; production callers
/// always pass `true`, and tests pass `false` to check its equivalence.
fn best_lengths<const RUN_SHORTCUT: bool, F, C>(
    s: &mut BlockState<C>,
    in_data: &[u8],
    instart: usize,
    inend: usize,
    costmodel: F,
    h: &mut RollingHash,
) -> (f64, Vec<u16>)
where
    F: Fn(usize, u16) -> f64,
    C: Cache,
{
    let blocksize = inend - instart;
    let mut length_array = vec![0u16; blocksize + 1];
    if instart == inend {
        return (0.0, length_array);
    }

    let windowstart = instart.saturating_sub(WINDOW_SIZE);
    h.reset();
    let arr = &in_data[..inend];
    h.warmup(arr, windowstart, inend);
    for i in windowstart..instart {
        h.update(arr, i);
    }

    /* Best cost to get to each byte so far. Single precision is enough here;
    the model may return doubles, so comparisons widen. */
    let mut costs: Vec<f32> = vec![LARGE_FLOAT as f32; blocksize + 1];
    costs[0] = 0.0; /* Because it's the start. */

    let mut sublen = vec![0u16; MAX_MATCH + 1];
    let mincost = min_symbol_cost(&costmodel);

    let mut i = instart;
    while i < inend {
        let mut j = i - instart; // Index in the costs array and length_array.
        h.update(arr, i);

        // If we're in a long repetition of the same byte and have more than
        // MAX_MATCH bytes of it before and after our position.
        if RUN_SHORTCUT
            && h.same[i & WINDOW_MASK] > MAX_MATCH as u16 * 2
            && i > instart + MAX_MATCH + 1
            && i + MAX_MATCH * 2 + 1 < inend
            && h.same[(i - MAX_MATCH) & WINDOW_MASK] > MAX_MATCH as u16
        {
            let symbolcost = costmodel(MAX_MATCH, 1);
            // Set the length to reach each one to MAX_MATCH, and the cost to
            // the cost corresponding to that length. Doing this, we skip
            // MAX_MATCH values to avoid calling the match finder.
            for _ in 0..MAX_MATCH {
                costs[j + MAX_MATCH] = costs[j] + symbolcost as f32;
                length_array[j + MAX_MATCH] = MAX_MATCH as u16;
                i += 1;
                j += 1;
                h.update(arr, i);
            }
        }

        let longest_match =
            find_longest_match(s, h, arr, i, inend, MAX_MATCH, &mut Some(&mut sublen));
        let leng = longest_match.length;

        // Literal.
        if i + 1 <= inend {
            let new_cost = costmodel(arr[i] as usize, 0) + costs[j] as f64;
            debug_assert!(new_cost >= 0.0);
            if new_cost < costs[j + 1] as f64 {
                costs[j + 1] = new_cost as f32;
                length_array[j + 1] = 1;
            }
        }

        // Lengths.
        let kend = cmp::min(leng as usize, inend - i);
        let mincostaddcostj = mincost + costs[j] as f64;
        for (k, &sublength) in sublen.iter().enumerate().take(kend + 1).skip(MIN_MATCH) {
            // Calling the cost model is expensive; skip the call when this
            // target already sits at the lowest cost any symbol could give it.
            if costs[j + k] as f64 <= mincostaddcostj {
                continue;
            }

            let new_cost = costmodel(k, sublength) + costs[j] as f64;
            debug_assert!(new_cost >= 0.0);
            if new_cost < costs[j + k] as f64 {
                debug_assert!(k <= MAX_MATCH);
                costs[j + k] = new_cost as f32;
                length_array[j + k] = k as u16;
            }
        }
        i += 1;
    }

    debug_assert!(costs[blocksize] >= 0.0);
    (costs[blocksize] as f64, length_array)
}

/// Walks `length_array` backwards from the end of the block and returns the
/// lengths of the optimal parse in forward order. Every entry of the result
/// is either 1 (a literal) or a match length; they sum to `size`.
fn trace_backwards(size: usize, length_array: &[u16]) -> Vec<u16> {
    if size == 0 {
        return Vec::new();
    }
    let mut path = Vec::new();
    let mut index = size;
    while index > 0 {
        let length = length_array[index];
        path.push(length);
        debug_assert_ne!(length, 0);
        debug_assert!(length as usize <= index);
        debug_assert!(length as usize <= MAX_MATCH);
        index -= length as usize;
    }
    path.reverse();
    path
}

/// Does a single run of the squeeze: forward pass, backward trace, replay
/// into the store. For good compression, repeated runs with updated
/// statistics should be performed. The model cost returned by the forward
/// pass is only asserted on; it is not the actual output cost.
fn lz77_optimal_run<F, C>(
    s: &mut BlockState<C>,
    in_data: &[u8],
    instart: usize,
    inend: usize,
    costmodel: F,
    store: &mut Lz77Store,
    h: &mut RollingHash,
) where
    F: Fn(usize, u16) -> f64,
    C: Cache,
{
    let (cost, length_array) = best_lengths::<true, F, C>(s, in_data, instart, inend, costmodel, h);
    let path = trace_backwards(inend - instart, &length_array);
    store.follow_path(in_data, instart, inend, &path, s);
    debug_assert!(cost < LARGE_FLOAT);
}

/// Computes the best possible LZ77 parse for the fixed tree of the deflate
/// standard and appends it to `store`. The fixed tree never gives the best
/// compression, but this gives the best possible parse for it.
///
/// If `instart` is larger than 0, it uses the bytes before `instart` as the
/// starting dictionary.
pub fn lz77_optimal_fixed<C: Cache>(
    s: &mut BlockState<C>,
    in_data: &[u8],
    instart: usize,
    inend: usize,
    store: &mut Lz77Store,
) {
    if instart == inend {
        return;
    }
    let mut h = RollingHash::new();
    lz77_optimal_run(s, in_data, instart, inend, fixed_cost, store, &mut h);
}

/// Calculates lit/len and dist pairs for the given block.
///
/// Seeds the statistics with a greedy parse, then runs `numiterations`
/// squeeze passes, each parameterized by the statistics of the previous one,
/// keeping whichever parse was cheapest under the exact dynamic-tree bit
/// size. Once the cost stagnates, the best statistics are randomly perturbed
/// to escape the local minimum, and later iterations blend in the previous
/// statistics to damp oscillation.
///
/// With `numiterations == 0` the output store is left untouched; pass at
/// least 1 to get a result. If `instart` is larger than 0, it uses the bytes
/// before `instart` as the starting dictionary.
pub fn lz77_optimal<C: Cache>(
    s: &mut BlockState<C>,
    in_data: &[u8],
    instart: usize,
    inend: usize,
    numiterations: u64,
    store: &mut Lz77Store,
) {
    if instart == inend {
        return;
    }

    let mut currentstore = SCRATCH_STORE_POOL.pull();
    let mut h = RollingHash::new();
    let mut ran_state = RanState::new();

    let mut stats = SymbolStats::new();
    let mut beststats = SymbolStats::new();

    let mut lastrandomstep = None;
    let mut bestcost = LARGE_FLOAT;
    let mut lastcost = 0.0;

    /* Initial run. */
    currentstore.greedy(s, in_data, instart, inend);
    stats.collect(&currentstore);

    /* Repeat the squeeze, each time with the cost model from the previous
    run's statistics. */
    for i in 0..numiterations {
        currentstore.reset();
        lz77_optimal_run(
            s,
            in_data,
            instart,
            inend,
            |litlen, dist| stat_cost(litlen, dist, &stats),
            &mut currentstore,
            &mut h,
        );

        /* The exact size the block would encode to, unlike the cost given by
        the model. */
        let cost = calculate_block_size(&currentstore, 0, currentstore.size(), BlockType::Dynamic);
        debug!("iteration {i}: {} bit", cost as u64);

        if cost < bestcost {
            /* Copy to the output store. */
            store.clone_from(&currentstore);
            beststats = stats;
            bestcost = cost;
        }

        let laststats = stats;
        stats.clear_freqs();
        stats.collect(&currentstore);

        if lastrandomstep.is_some() {
            /* This makes it converge slower but better. Do it only once the
            randomness kicks in so that if the user does few iterations, it
            gives a better result sooner. */
            stats.add_weighed_freqs(1.0, &laststats, 0.5);
            stats.calculate_entropy();
        }

        if i > 5 && cost == lastcost {
            stats = beststats;
            stats.randomize_freqs(&mut ran_state);
            stats.calculate_entropy();
            lastrandomstep = Some(i);
        }

        lastcost = cost;
    }
}
