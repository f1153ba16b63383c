//! LZ77 symbol storage and the sliding-window longest-match search the
//! optimizer is built around.

use alloc::vec::Vec;
use core::cmp;

use crate::cache::Cache;
use crate::hash::{RollingHash, Which};
use crate::symbols::{dist_symbol, length_symbol};
use crate::util::{MAX_CHAIN_HITS, MAX_MATCH, MIN_MATCH, NUM_D, NUM_LL, WINDOW_MASK, WINDOW_SIZE};

/// One LZ77 symbol: a literal byte value, or a back-reference carrying
/// (length, distance).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    Literal(u16),
    BackRef(u16, u16),
}

impl Symbol {
    /// Number of input bytes this symbol covers.
    pub fn span(&self) -> usize {
        match *self {
            Symbol::Literal(_) => 1,
            Symbol::BackRef(len, _) => len as usize,
        }
    }
}

/// Stores lit/length and dist pairs for LZ77, together with the input position
/// each symbol starts at and chunked cumulative histograms that make range
/// histogram queries cheap.
#[derive(Debug, Clone, Default)]
pub struct Lz77Store {
    pub symbols: Vec<Symbol>,
    pub pos: Vec<usize>,

    ll_symbol: Vec<u16>,
    d_symbol: Vec<u16>,

    ll_counts: Vec<usize>,
    d_counts: Vec<usize>,
}

impl Lz77Store {
    pub fn new() -> Lz77Store {
        Lz77Store::default()
    }

    pub fn reset(&mut self) {
        self.symbols.clear();
        self.pos.clear();
        self.ll_symbol.clear();
        self.d_symbol.clear();
        self.ll_counts.clear();
        self.d_counts.clear();
    }

    pub fn size(&self) -> usize {
        self.symbols.len()
    }

    /// Appends one symbol, keeping the cumulative histograms in sync. A new
    /// histogram chunk starts every `NUM_LL` (resp. `NUM_D`) symbols and is
    /// seeded from the previous chunk.
    pub fn append(&mut self, symbol: Symbol, pos: usize) {
        let origsize = self.symbols.len();
        let llstart = NUM_LL * (origsize / NUM_LL);
        let dstart = NUM_D * (origsize / NUM_D);

        if origsize % NUM_LL == 0 {
            if origsize == 0 {
                self.ll_counts.resize(NUM_LL, 0);
            } else {
                let mut last_chunk = self.ll_counts[(origsize - NUM_LL)..origsize].to_vec();
                self.ll_counts.append(&mut last_chunk);
            }
        }
        if origsize % NUM_D == 0 {
            if origsize == 0 {
                self.d_counts.resize(NUM_D, 0);
            } else {
                let mut last_chunk = self.d_counts[(origsize - NUM_D)..origsize].to_vec();
                self.d_counts.append(&mut last_chunk);
            }
        }

        self.pos.push(pos);
        self.symbols.push(symbol);
        match symbol {
            Symbol::Literal(lit) => {
                self.ll_symbol.push(lit);
                self.d_symbol.push(0);
                self.ll_counts[llstart + lit as usize] += 1;
            }
            Symbol::BackRef(length, dist) => {
                debug_assert!((MIN_MATCH..=MAX_MATCH).contains(&(length as usize)));
                let lsym = length_symbol(length as usize);
                let dsym = dist_symbol(dist);
                self.ll_symbol.push(lsym as u16);
                self.d_symbol.push(dsym as u16);
                self.ll_counts[llstart + lsym] += 1;
                self.d_counts[dstart + dsym] += 1;
            }
        }
    }

    /// Appends a raw (litlen, dist) pair: dist 0 means `litlen` is a literal
    /// byte value, otherwise it is a match length.
    pub fn push(&mut self, litlen: u16, dist: u16, pos: usize) {
        let symbol = if dist == 0 {
            Symbol::Literal(litlen)
        } else {
            Symbol::BackRef(litlen, dist)
        };
        self.append(symbol, pos);
    }

    /// Does LZ77 using an algorithm similar to gzip, with lazy matching,
    /// rather than with the slow but better "squeeze" implementation. The
    /// optimizer uses the result as its seed statistics.
    ///
    /// If `instart` is larger than 0, it uses values before `instart` as the
    /// starting dictionary.
    pub fn greedy<C: Cache>(
        &mut self,
        s: &mut BlockState<C>,
        in_data: &[u8],
        instart: usize,
        inend: usize,
    ) {
        if instart == inend {
            return;
        }
        let windowstart = instart.saturating_sub(WINDOW_SIZE);
        let mut h = RollingHash::new();

        let arr = &in_data[..inend];
        h.warmup(arr, windowstart, inend);
        for i in windowstart..instart {
            h.update(arr, i);
        }

        let mut i = instart;
        let mut prev_length: u16 = 0;
        let mut prev_dist: u16 = 0;
        let mut match_available = false;

        while i < inend {
            h.update(arr, i);

            let longest_match =
                find_longest_match(s, &mut h, arr, i, inend, MAX_MATCH, &mut None);
            let mut dist = longest_match.distance;
            let mut leng = longest_match.length;
            let lengthscore = length_score(leng, dist);

            /* Lazy matching. */
            let prevlengthscore = length_score(prev_length, prev_dist);
            if match_available {
                match_available = false;
                if lengthscore > prevlengthscore + 1 {
                    self.push(u16::from(arr[i - 1]), 0, i - 1);
                    if lengthscore as usize >= MIN_MATCH && (leng as usize) < MAX_MATCH {
                        match_available = true;
                        prev_length = leng;
                        prev_dist = dist;
                        i += 1;
                        continue;
                    }
                } else {
                    /* Add the previous match to the output. */
                    leng = prev_length;
                    dist = prev_dist;
                    verify_len_dist(arr, i - 1, dist, leng);
                    self.push(leng, dist, i - 1);
                    for _ in 2..leng as usize {
                        debug_assert!(i < inend);
                        i += 1;
                        h.update(arr, i);
                    }
                    i += 1;
                    continue;
                }
            } else if lengthscore as usize >= MIN_MATCH && (leng as usize) < MAX_MATCH {
                match_available = true;
                prev_length = leng;
                prev_dist = dist;
                i += 1;
                continue;
            }
            /* End of lazy matching. */

            if lengthscore as usize >= MIN_MATCH {
                verify_len_dist(arr, i, dist, leng);
                self.push(leng, dist, i);
            } else {
                leng = 1;
                self.push(u16::from(arr[i]), 0, i);
            }
            for _ in 1..leng as usize {
                debug_assert!(i < inend);
                i += 1;
                h.update(arr, i);
            }
            i += 1;
        }
    }

    /// Replays a path of lengths produced by the backward trace, emitting the
    /// corresponding symbols. Distances are not kept in the path; each one is
    /// re-derived by running the matcher capped to the path length.
    pub fn follow_path<C: Cache>(
        &mut self,
        in_data: &[u8],
        instart: usize,
        inend: usize,
        path: &[u16],
        s: &mut BlockState<C>,
    ) {
        if instart == inend {
            return;
        }
        let windowstart = instart.saturating_sub(WINDOW_SIZE);
        let mut h = RollingHash::new();

        let arr = &in_data[..inend];
        h.warmup(arr, windowstart, inend);
        for i in windowstart..instart {
            h.update(arr, i);
        }

        let mut pos = instart;
        for &item in path {
            let mut length = item;
            debug_assert!(pos < inend);

            h.update(arr, pos);

            if length as usize >= MIN_MATCH {
                /* Get the distance by recalculating the longest match capped
                to this length. The found length should match. */
                let longest_match =
                    find_longest_match(s, &mut h, arr, pos, inend, length as usize, &mut None);
                let dist = longest_match.distance;
                let found = longest_match.length;
                debug_assert!(!(found != length && length > 2 && found > 2));
                verify_len_dist(arr, pos, dist, length);
                self.push(length, dist, pos);
            } else {
                length = 1;
                self.push(u16::from(arr[pos]), 0, pos);
            }

            debug_assert!(pos + length as usize <= inend);
            for j in 1..length as usize {
                h.update(arr, pos + j);
            }
            pos += length as usize;
        }
    }

    fn histogram_at(&self, lpos: usize) -> (Vec<usize>, Vec<usize>) {
        /* The real histogram is the cumulative histogram of this chunk minus
        the symbols of the chunk that come after lpos. */
        let llpos = NUM_LL * (lpos / NUM_LL);
        let dpos = NUM_D * (lpos / NUM_D);

        let mut ll: Vec<usize> = self.ll_counts[llpos..llpos + NUM_LL].to_vec();
        let end = cmp::min(llpos + NUM_LL, self.size());
        for i in (lpos + 1)..end {
            ll[self.ll_symbol[i] as usize] -= 1;
        }

        let mut d: Vec<usize> = self.d_counts[dpos..dpos + NUM_D].to_vec();
        let end = cmp::min(dpos + NUM_D, self.size());
        for i in (lpos + 1)..end {
            if let Symbol::BackRef(_, _) = self.symbols[i] {
                d[self.d_symbol[i] as usize] -= 1;
            }
        }

        (ll, d)
    }

    /// Gets the histogram of lit/len and dist symbols in the given range,
    /// using the cumulative histograms, so faster than adding one by one for
    /// a large range. Does not add the one end symbol of value 256.
    pub fn histogram(&self, lstart: usize, lend: usize) -> (Vec<usize>, Vec<usize>) {
        if lstart + NUM_LL * 3 > lend {
            let mut ll_counts = vec![0; NUM_LL];
            let mut d_counts = vec![0; NUM_D];
            for i in lstart..lend {
                ll_counts[self.ll_symbol[i] as usize] += 1;
                if let Symbol::BackRef(_, _) = self.symbols[i] {
                    d_counts[self.d_symbol[i] as usize] += 1;
                }
            }
            (ll_counts, d_counts)
        } else {
            /* Subtract the cumulative histogram at the start from the one at
            the end to get the histogram for this range. */
            let (ll, d) = self.histogram_at(lend - 1);
            if lstart > 0 {
                let (ll2, d2) = self.histogram_at(lstart - 1);
                (
                    ll.iter().zip(&ll2).map(|(&a, &b)| a - b).collect(),
                    d.iter().zip(&d2).map(|(&a, &b)| a - b).collect(),
                )
            } else {
                (ll, d)
            }
        }
    }

    /// Number of input bytes the symbol range `[lstart, lend)` covers.
    pub fn byte_range(&self, lstart: usize, lend: usize) -> usize {
        if lstart == lend {
            return 0;
        }
        let l = lend - 1;
        self.pos[l] + self.symbols[l].span() - self.pos[lstart]
    }
}

/// Per-block state for the optimizer: the block bounds and the longest-match
/// cache that amortizes repeated squeeze runs over the block.
pub struct BlockState<C> {
    lmc: C,
    /* The start (inclusive) and end (not inclusive) of the current block. */
    pub blockstart: usize,
    pub blockend: usize,
}

impl BlockState<crate::cache::MatchCache> {
    pub fn new(blockstart: usize, blockend: usize) -> Self {
        BlockState {
            lmc: crate::cache::MatchCache::new(blockend - blockstart),
            blockstart,
            blockend,
        }
    }
}

impl BlockState<crate::cache::NoCache> {
    pub fn new_uncached(blockstart: usize, blockend: usize) -> Self {
        BlockState {
            lmc: crate::cache::NoCache,
            blockstart,
            blockend,
        }
    }
}

/// Result of a longest-match query.
pub struct LongestMatch {
    pub distance: u16,
    pub length: u16,
    pub from_cache: bool,
    pub limit: usize,
}

impl LongestMatch {
    pub fn new(limit: usize) -> Self {
        LongestMatch {
            distance: 0,
            length: 0,
            from_cache: false,
            limit,
        }
    }
}

/// Finds how many bytes starting from `scan` and from `matched` are equal.
/// Returns the first position after `scan` whose byte no longer matches, with
/// `end` as the last position to look at.
fn match_end(array: &[u8], mut scan: usize, mut matched: usize, end: usize) -> usize {
    while scan != end && array[scan] == array[matched] {
        scan += 1;
        matched += 1;
    }
    scan
}

/// Finds the longest match (length and corresponding distance) at `pos` in the
/// window before it, capped to `limit`.
///
/// When `sublen` is provided, `sublen[k]` receives, for every `k` up to the
/// returned length, the smallest-cost distance at which a match of length `k`
/// is available under the chain-walk policy.
pub fn find_longest_match<C: Cache>(
    s: &mut BlockState<C>,
    h: &mut RollingHash,
    array: &[u8],
    pos: usize,
    size: usize,
    limit: usize,
    sublen: &mut Option<&mut [u16]>,
) -> LongestMatch {
    let mut longest_match = s.lmc.try_get(pos, limit, sublen, s.blockstart);

    if longest_match.from_cache {
        debug_assert!(pos + longest_match.length as usize <= size);
        return longest_match;
    }

    let mut limit = longest_match.limit;

    debug_assert!(limit <= MAX_MATCH);
    debug_assert!(limit >= MIN_MATCH);
    debug_assert!(pos < size);

    if size - pos < MIN_MATCH {
        /* The rest of the code assumes there are at least MIN_MATCH bytes to
        try. */
        longest_match.distance = 0;
        longest_match.length = 0;
        longest_match.from_cache = false;
        longest_match.limit = 0;
        return longest_match;
    }

    if pos + limit > size {
        limit = size - pos;
    }

    let (bestdist, bestlength) = chain_walk(h, array, pos, size, limit, sublen);

    s.lmc
        .store(pos, limit, sublen, bestdist as u16, bestlength as u16, s.blockstart);

    debug_assert!(bestlength <= limit);
    debug_assert!(pos + bestlength <= size);
    longest_match.distance = bestdist as u16;
    longest_match.length = bestlength as u16;
    longest_match.from_cache = false;
    longest_match.limit = limit;
    longest_match
}

fn chain_walk(
    h: &RollingHash,
    array: &[u8],
    pos: usize,
    size: usize,
    limit: usize,
    sublen: &mut Option<&mut [u16]>,
) -> (i32, usize) {
    let mut which_hash = Which::Triplet;
    /* During the whole loop, p == prev_at(pp). */
    let mut pp = h.head_at(h.val(which_hash) as usize, which_hash);
    let mut p = h.prev_at(pp as usize, which_hash);

    let hpos = pos & WINDOW_MASK;
    debug_assert_eq!(pp as usize, hpos);

    let mut dist = if (p as i32) < pp {
        pp - p as i32
    } else {
        (WINDOW_SIZE - p as usize) as i32 + pp
    };

    let mut bestlength = 1;
    let mut bestdist = 0;
    let mut chain_counter = MAX_CHAIN_HITS; /* For quitting early. */
    let arrayend = pos + limit;

    /* Go through all distances. */
    while (dist as usize) < WINDOW_SIZE {
        debug_assert!((p as usize) < WINDOW_SIZE);
        debug_assert_eq!(p, h.prev_at(pp as usize, which_hash));
        debug_assert_eq!(h.hash_val_at(p as usize, which_hash), h.val(which_hash) as i32);

        if dist > 0 {
            debug_assert!(pos < size);
            debug_assert!(dist as usize <= pos);
            let mut scan = pos;
            let mut matched = pos - dist as usize;

            /* Testing the byte at position bestlength first, goes slightly
            faster. */
            if pos + bestlength >= size || array[scan + bestlength] == array[matched + bestlength]
            {
                let same0 = h.same[pos & WINDOW_MASK];
                if same0 > 2 && array[scan] == array[matched] {
                    let same1 = h.same[(pos - dist as usize) & WINDOW_MASK];
                    let same = cmp::min(cmp::min(same0, same1) as usize, limit);
                    scan += same;
                    matched += same;
                }
                scan = match_end(array, scan, matched, arrayend);
                let currentlength = scan - pos; /* The found length. */

                if currentlength > bestlength {
                    if let Some(subl) = sublen {
                        for entry in &mut subl[(bestlength + 1)..=currentlength] {
                            *entry = dist as u16;
                        }
                    }
                    bestdist = dist;
                    bestlength = currentlength;
                    if currentlength >= limit {
                        break;
                    }
                }
            }
        }

        /* Switch to the run-aware hash once the matches to beat are longer
        than the run at this position; it skips straight to candidates that
        agree on the run length. */
        if which_hash == Which::Triplet
            && bestlength >= h.same[hpos] as usize
            && h.val(Which::Run) as i32 == h.hash_val_at(p as usize, Which::Run)
        {
            which_hash = Which::Run;
        }

        pp = p as i32;
        p = h.prev_at(p as usize, which_hash);
        if p as i32 == pp {
            break; /* Uninited prev value. */
        }

        dist += if (p as i32) < pp {
            pp - p as i32
        } else {
            (WINDOW_SIZE - p as usize) as i32 + pp
        };

        chain_counter -= 1;
        if chain_counter == 0 {
            break;
        }
    }
    (bestdist, bestlength)
}

/// Gets a score of the length given the distance. Typically the score of the
/// length is the length itself, but if the distance is very long, decrease the
/// score of the length a bit to make up for the fact that long distances use
/// large amounts of extra bits.
///
/// This is not an accurate score, it is a heuristic only for the greedy LZ77
/// implementation. More accurate cost models are employed later. Making this
/// heuristic more accurate may hurt rather than improve compression.
fn length_score(length: u16, distance: u16) -> i32 {
    // At 1024, the distance uses 9+ extra bits and this seems to be the sweet
    // spot on tested files.
    if distance > 1024 {
        i32::from(length) - 1
    } else {
        i32::from(length)
    }
}

/// Checks that a back-reference really reproduces the bytes it claims to.
pub(crate) fn verify_len_dist(data: &[u8], pos: usize, dist: u16, length: u16) {
    if cfg!(debug_assertions) {
        for i in 0..length as usize {
            debug_assert_eq!(
                data[pos - dist as usize + i],
                data[pos + i],
                "back-reference mismatch at pos {pos} dist {dist} offset {i}"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::MatchCache;

    fn state_for(data: &[u8]) -> BlockState<MatchCache> {
        BlockState::new(0, data.len())
    }

    fn hash_through(data: &[u8], pos: usize) -> RollingHash {
        let mut h = RollingHash::new();
        h.warmup(data, 0, data.len());
        for i in 0..=pos {
            h.update(data, i);
        }
        h
    }

    #[test]
    fn finds_simple_repeat() {
        let data = b"abcde_abcde_abcde_x";
        let mut s = state_for(data);
        let mut h = hash_through(data, 6);
        let mut sublen = vec![0u16; MAX_MATCH + 1];
        let lm = find_longest_match(
            &mut s,
            &mut h,
            data,
            6,
            data.len(),
            MAX_MATCH,
            &mut Some(&mut sublen),
        );
        // At position 6 the previous "abcde_" is 6 back; the overlapping
        // periodic match extends until the 'x' breaks it, 12 bytes.
        assert_eq!(lm.distance, 6);
        assert_eq!(lm.length, 12);
        for k in MIN_MATCH..=12 {
            assert_eq!(sublen[k], 6);
        }
    }

    #[test]
    fn no_match_in_unique_data() {
        let data = b"abcdefghij";
        let mut s = state_for(data);
        let mut h = hash_through(data, 5);
        let lm = find_longest_match(&mut s, &mut h, data, 5, data.len(), MAX_MATCH, &mut None);
        assert!((lm.length as usize) < MIN_MATCH);
    }

    #[test]
    fn match_respects_limit() {
        let data = b"abcdefgh_abcdefgh";
        let mut s = state_for(data);
        let mut h = hash_through(data, 9);
        let lm = find_longest_match(&mut s, &mut h, data, 9, data.len(), 4, &mut None);
        assert_eq!(lm.length, 4);
        assert_eq!(lm.distance, 9);
    }

    #[test]
    fn greedy_covers_input() {
        let data = b"to be or not to be, that is the question";
        let mut s = state_for(data);
        let mut store = Lz77Store::new();
        store.greedy(&mut s, data, 0, data.len());
        let total: usize = store.symbols.iter().map(Symbol::span).sum();
        assert_eq!(total, data.len());
        // "to be" repeats 14 bytes in, so the greedy pass must have found at
        // least one back-reference.
        assert!(store
            .symbols
            .iter()
            .any(|sym| matches!(sym, Symbol::BackRef(_, _))));
    }

    #[test]
    fn histogram_ranges_agree_with_per_symbol_count() {
        // Mostly incompressible bytes, so the store is large enough to use
        // the cumulative-histogram path rather than the per-symbol loop.
        let data = crate::testutil::xorshift_bytes(2000, 0x9E3779B9);
        let mut s = state_for(&data);
        let mut store = Lz77Store::new();
        store.greedy(&mut s, &data, 0, data.len());

        let lstart = 1;
        let lend = store.size() - 1;
        let (ll, d) = store.histogram(lstart, lend);

        let mut ll_expected = vec![0usize; NUM_LL];
        let mut d_expected = vec![0usize; NUM_D];
        for i in lstart..lend {
            match store.symbols[i] {
                Symbol::Literal(lit) => ll_expected[lit as usize] += 1,
                Symbol::BackRef(len, dist) => {
                    ll_expected[length_symbol(len as usize)] += 1;
                    d_expected[dist_symbol(dist)] += 1;
                }
            }
        }
        assert_eq!(ll, ll_expected);
        assert_eq!(d, d_expected);
    }

    #[test]
    fn byte_range_spans_symbols() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let mut s = state_for(data);
        let mut store = Lz77Store::new();
        store.greedy(&mut s, data, 0, data.len());
        assert_eq!(store.byte_range(0, store.size()), data.len());
    }
}
