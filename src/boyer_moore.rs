//! Boyer–Moore–Horspool substring search.
//!
//! A 256-entry skip table built once per pattern, then reused across many
//! searches (one per scanned key/value).
//!
//! The "empty pattern matches everything" rule from spec.md section 3 is
//! deliberately *not* implemented here — this searcher treats an empty
//! pattern as never found, and the call site (`workers::read`) only
//! constructs a searcher when a filter string was actually supplied,
//! gating on `Option` for the "no filter" case instead.

pub struct Searcher {
    pattern: Vec<u8>,
    skip: [usize; 256],
}

impl Searcher {
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        let mut skip = [pattern.len(); 256];
        if !pattern.is_empty() {
            for (i, &byte) in pattern[..pattern.len() - 1].iter().enumerate() {
                skip[byte as usize] = pattern.len() - i - 1;
            }
        }
        Searcher { pattern, skip }
    }

    /// Returns `true` if `pattern` occurs anywhere in `haystack`.
    pub fn contains(&self, haystack: &[u8]) -> bool {
        if self.pattern.is_empty() || self.pattern.len() > haystack.len() {
            return false;
        }
        let plen = self.pattern.len();
        let mut i = 0usize;
        while i <= haystack.len() - plen {
            let mut j = plen - 1;
            while haystack[i + j] == self.pattern[j] {
                if j == 0 {
                    return true;
                }
                j -= 1;
            }
            i += self.skip[haystack[i + plen - 1] as usize];
        }
        false
    }
}
