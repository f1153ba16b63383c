//! Cache used by `find_longest_match` to remember previously found
//! length/dist values.
//!
//! This is needed because the squeeze runs ask for these values many times for
//! the same position. Uses large amounts of memory, since it has to remember
//! the distance belonging to every possible shorter-than-the-best length (the
//! so called "sublen" array).

use alloc::vec::Vec;

use crate::lz77::LongestMatch;
use crate::util::{CACHE_LENGTH, MAX_MATCH, MIN_MATCH};

/// The seam between `find_longest_match` and its memoization: a real cache for
/// block-sized optimizer runs, or [`NoCache`] for one-shot passes.
pub trait Cache {
    /// Gets distance, length and sublen values from the cache if possible.
    /// Sets `from_cache` on a hit; on a miss, the returned `limit` may have
    /// been tightened using partial information from the cache.
    fn try_get(
        &self,
        pos: usize,
        limit: usize,
        sublen: &mut Option<&mut [u16]>,
        blockstart: usize,
    ) -> LongestMatch;

    /// Stores the found sublen, distance and length for `pos`, if this lookup
    /// is cacheable (a full-limit query with a sublen table).
    fn store(
        &mut self,
        pos: usize,
        limit: usize,
        sublen: &mut Option<&mut [u16]>,
        distance: u16,
        length: u16,
        blockstart: usize,
    );
}

/// Cache disabled; every lookup is a miss and nothing is remembered.
pub struct NoCache;

impl Cache for NoCache {
    fn try_get(
        &self,
        _pos: usize,
        limit: usize,
        _sublen: &mut Option<&mut [u16]>,
        _blockstart: usize,
    ) -> LongestMatch {
        LongestMatch::new(limit)
    }

    fn store(
        &mut self,
        _pos: usize,
        _limit: usize,
        _sublen: &mut Option<&mut [u16]>,
        _distance: u16,
        _length: u16,
        _blockstart: usize,
    ) {
    }
}

/// Remembers the best match per block position, plus a compressed form of the
/// sublen array: up to `CACHE_LENGTH` (length, dist) change points of three
/// bytes each.
pub struct MatchCache {
    length: Vec<u16>,
    dist: Vec<u16>,
    sublen: Vec<u8>,
}

impl MatchCache {
    pub fn new(blocksize: usize) -> MatchCache {
        MatchCache {
            /* length > 0 and dist 0 is an invalid combination, which indicates
            on purpose that this cache value is not filled in yet. */
            length: vec![1; blocksize],
            dist: vec![0; blocksize],
            /* Rather large amount of memory. */
            sublen: vec![0; CACHE_LENGTH * blocksize * 3],
        }
    }

    fn filled(&self, lmcpos: usize) -> bool {
        self.length[lmcpos] == 0 || self.dist[lmcpos] != 0
    }

    /// Returns the length up to which sublen values are stored in the cache
    /// for this position, or 0 if no sublen is cached.
    fn max_sublen(&self, lmcpos: usize) -> u32 {
        let start = CACHE_LENGTH * lmcpos * 3;
        if self.sublen[start + 1] == 0 && self.sublen[start + 2] == 0 {
            return 0;
        }
        u32::from(self.sublen[start + (CACHE_LENGTH - 1) * 3]) + 3
    }

    /// Compresses a sublen array into the cache slots for this position.
    fn store_sublen(&mut self, sublen: &[u16], lmcpos: usize, length: usize) {
        if length < MIN_MATCH {
            return;
        }

        let start = CACHE_LENGTH * lmcpos * 3;
        let mut bestlength = 0;
        let mut j = 0;
        // Only the lengths where the distance changes need a slot.
        for i in MIN_MATCH..=length {
            if i == length || sublen[i] != sublen[i + 1] {
                self.sublen[start + j * 3] = (i - MIN_MATCH) as u8;
                self.sublen[start + j * 3 + 1] = (sublen[i] & 0xff) as u8;
                self.sublen[start + j * 3 + 2] = (sublen[i] >> 8) as u8;
                bestlength = i;
                j += 1;
                if j >= CACHE_LENGTH {
                    break;
                }
            }
        }

        if j < CACHE_LENGTH {
            debug_assert_eq!(bestlength, length);
            self.sublen[start + (CACHE_LENGTH - 1) * 3] = (bestlength - MIN_MATCH) as u8;
        } else {
            debug_assert!(bestlength <= length);
        }
        debug_assert_eq!(bestlength as u32, self.max_sublen(lmcpos));
    }

    /// Expands the cached change points back into a sublen array.
    fn fetch_sublen(&self, lmcpos: usize, length: usize, sublen: &mut [u16]) {
        if length < MIN_MATCH {
            return;
        }

        let maxlength = self.max_sublen(lmcpos);
        let start = CACHE_LENGTH * lmcpos * 3;
        let mut prevlength = 0;

        for j in 0..CACHE_LENGTH {
            let length = u32::from(self.sublen[start + j * 3]) + MIN_MATCH as u32;
            let dist = u16::from(self.sublen[start + j * 3 + 1])
                | (u16::from(self.sublen[start + j * 3 + 2]) << 8);

            for entry in &mut sublen[prevlength as usize..=length as usize] {
                *entry = dist;
            }
            if length == maxlength {
                break;
            }
            prevlength = length + 1;
        }
    }
}

impl Cache for MatchCache {
    fn try_get(
        &self,
        pos: usize,
        limit: usize,
        sublen: &mut Option<&mut [u16]>,
        blockstart: usize,
    ) -> LongestMatch {
        let mut longest_match = LongestMatch::new(limit);

        /* The cache is indexed relative to the block rather than the whole
        input array. */
        let lmcpos = pos - blockstart;

        if !self.filled(lmcpos) {
            return longest_match;
        }

        let cached_length = self.length[lmcpos];
        let max_sublen = self.max_sublen(lmcpos);
        let limit_ok_for_cache = limit == MAX_MATCH
            || usize::from(cached_length) <= limit
            || (sublen.is_some() && max_sublen >= limit as u32);

        if limit_ok_for_cache {
            if sublen.is_none() || u32::from(cached_length) <= max_sublen {
                let length = cached_length.min(limit as u16);
                let distance = if let Some(subl) = sublen {
                    self.fetch_sublen(lmcpos, length as usize, subl);
                    if limit == MAX_MATCH && usize::from(length) >= MIN_MATCH {
                        debug_assert_eq!(subl[length as usize], self.dist[lmcpos]);
                    }
                    subl[length as usize]
                } else {
                    self.dist[lmcpos]
                };
                longest_match.distance = distance;
                longest_match.length = length;
                longest_match.from_cache = true;
                return longest_match;
            }
            /* Can't use the cached sublens, since those would need to be
            recalculated, but at least we already know when to stop. */
            longest_match.limit = usize::from(cached_length);
        }

        longest_match
    }

    fn store(
        &mut self,
        pos: usize,
        limit: usize,
        sublen: &mut Option<&mut [u16]>,
        distance: u16,
        length: u16,
        blockstart: usize,
    ) {
        /* Only full-limit lookups with sublen information are cached; partial
        lookups would poison later, wider queries. */
        if limit != MAX_MATCH {
            return;
        }
        let Some(subl) = sublen else { return };

        let lmcpos = pos - blockstart;
        if self.filled(lmcpos) {
            return;
        }

        debug_assert_eq!(self.length[lmcpos], 1);
        debug_assert_eq!(self.dist[lmcpos], 0);
        if usize::from(length) < MIN_MATCH {
            self.dist[lmcpos] = 0;
            self.length[lmcpos] = 0;
        } else {
            self.dist[lmcpos] = distance;
            self.length[lmcpos] = length;
        }
        debug_assert!(!(self.length[lmcpos] == 1 && self.dist[lmcpos] == 0));
        self.store_sublen(subl, lmcpos, usize::from(length));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sublen_buf() -> Vec<u16> {
        vec![0; MAX_MATCH + 1]
    }

    #[test]
    fn empty_cache_misses() {
        let cache = MatchCache::new(16);
        let mut sublen = None;
        let lm = cache.try_get(3, MAX_MATCH, &mut sublen, 0);
        assert!(!lm.from_cache);
        assert_eq!(lm.limit, MAX_MATCH);
    }

    #[test]
    fn store_then_fetch_round_trips() {
        let mut cache = MatchCache::new(16);
        let mut buf = sublen_buf();
        // A match of length 7: distance 30 up to length 5, then 100.
        for k in MIN_MATCH..=5 {
            buf[k] = 30;
        }
        buf[6] = 100;
        buf[7] = 100;
        let mut sublen = Some(&mut buf[..]);
        cache.store(4, MAX_MATCH, &mut sublen, 100, 7, 0);

        let mut out = sublen_buf();
        let mut query = Some(&mut out[..]);
        let lm = cache.try_get(4, MAX_MATCH, &mut query, 0);
        assert!(lm.from_cache);
        assert_eq!(lm.length, 7);
        assert_eq!(lm.distance, 100);
        assert_eq!(&out[MIN_MATCH..=7], &[30, 30, 30, 100, 100]);
    }

    #[test]
    fn short_match_is_cached_as_no_match() {
        let mut cache = MatchCache::new(8);
        let mut buf = sublen_buf();
        let mut sublen = Some(&mut buf[..]);
        cache.store(2, MAX_MATCH, &mut sublen, 0, 1, 0);

        let mut none = None;
        let lm = cache.try_get(2, MAX_MATCH, &mut none, 0);
        assert!(lm.from_cache);
        assert_eq!(lm.length, 0);
        assert_eq!(lm.distance, 0);
    }

    #[test]
    fn partial_limit_lookups_are_not_stored() {
        let mut cache = MatchCache::new(8);
        let mut buf = sublen_buf();
        for k in MIN_MATCH..=10 {
            buf[k] = 1;
        }
        let mut sublen = Some(&mut buf[..]);
        cache.store(0, 10, &mut sublen, 1, 10, 0);

        let mut none = None;
        let lm = cache.try_get(0, MAX_MATCH, &mut none, 0);
        assert!(!lm.from_cache);
    }

    #[test]
    fn cached_length_tightens_limit_for_sublen_queries() {
        let mut cache = MatchCache::new(8);
        let mut buf = sublen_buf();
        for k in MIN_MATCH..=20 {
            buf[k] = 5;
        }
        let mut sublen = Some(&mut buf[..]);
        cache.store(1, MAX_MATCH, &mut sublen, 5, 20, 0);

        // Without a sublen table the hit is served directly, capped to the
        // requested limit.
        let mut none = None;
        let lm = cache.try_get(1, 10, &mut none, 0);
        assert!(lm.from_cache);
        assert_eq!(lm.length, 10);
        assert_eq!(lm.distance, 5);
    }
}
