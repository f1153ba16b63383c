/// Number of distinct literal/length symbols in DEFLATE.
pub const NUM_LL: usize = 288;
/// Number of distinct distance symbols in DEFLATE.
pub const NUM_D: usize = 32;

/// The window size for deflate. Must be a power of two. This should be 32768,
/// the maximum possible by the deflate spec. Anything less hurts compression
/// more than speed.
pub const WINDOW_SIZE: usize = 32768;

/// The window mask used to wrap indices into the window. This is why the
/// window size must be a power of two.
pub const WINDOW_MASK: usize = WINDOW_SIZE - 1;

/// Maximum length that can be encoded in deflate.
pub const MAX_MATCH: usize = 258;
/// Minimum length that can be encoded in deflate.
pub const MIN_MATCH: usize = 3;

/// For the longest match cache. max 256. Uses huge amounts of memory but makes
/// it faster. Uses this many times three bytes per single byte of the input
/// data. This is so because longest match finding has to find the exact
/// distance that belongs to each length for the best lz77 strategy.
/// Good values: e.g. 5, 8.
pub const CACHE_LENGTH: usize = 8;

/// Limit the max hash chain hits for this hash value. This has an effect only
/// on files where the hash value is the same very often. On these files, this
/// gives worse compression (the value should ideally be 32768, which is the
/// `WINDOW_SIZE`, while zlib uses 4096 even for best level), but makes it
/// faster on some specific files.
/// Good value: e.g. 8192.
pub const MAX_CHAIN_HITS: usize = 8192;

/// A cost higher than any reachable path cost. Used as the "not reached yet"
/// sentinel in the shortest-path cost array.
pub const LARGE_FLOAT: f64 = 1e30;
