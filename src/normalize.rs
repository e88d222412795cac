//! Text normalization for indexed values.
//!
//! Pipeline: NFD decomposition, optional combining-mark (accent) and
//! punctuation stripping, Unicode lowercasing, and consecutive-whitespace
//! deduplication. Index entries and compound ids are built from the
//! normalized form so equality and range comparisons ignore case and
//! diacritics.

use parking_lot::Mutex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone)]
pub struct Normalizer {
    remove_accents: bool,
    remove_punct: bool,
    buf: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl Normalizer {
    pub fn new(remove_accents: bool, remove_punct: bool) -> Self {
        Self {
            remove_accents,
            remove_punct,
            buf: String::new(),
        }
    }

    pub fn normalize(&mut self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        self.buf.clear();
        self.buf.reserve(input.len());

        let mut prev_white = false;
        for c in input.nfd() {
            if self.remove_accents && is_combining_mark(c) {
                continue;
            }
            if self.remove_punct && is_punctuation(c) {
                continue;
            }
            // keep the first whitespace of a run, drop the rest
            if c.is_whitespace() {
                if prev_white {
                    continue;
                }
                prev_white = true;
            } else {
                prev_white = false;
            }
            for lc in c.to_lowercase() {
                self.buf.push(lc);
            }
        }

        std::mem::take(&mut self.buf)
    }
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || ('\u{2000}'..='\u{206f}').contains(&c)
}

/// A free-list of normalizers so concurrent indexing operations do not
/// contend on a single scratch buffer.
#[derive(Debug, Default)]
pub struct NormalizerPool {
    idle: Mutex<Vec<Normalizer>>,
}

impl NormalizerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Normalizer {
        self.idle.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, normalizer: Normalizer) {
        self.idle.lock().push(normalizer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_accents() {
        let mut n = Normalizer::default();
        assert_eq!(n.normalize("Ovji Sir"), "ovji sir");
        assert_eq!(n.normalize("Üben çédille Ångström"), "uben cedille angstrom");
    }

    #[test]
    fn dedupes_consecutive_whitespace() {
        let mut n = Normalizer::default();
        assert_eq!(n.normalize("a  b\t\tc   d"), "a b\tc d");
    }

    #[test]
    fn empty_input_is_empty() {
        let mut n = Normalizer::default();
        assert_eq!(n.normalize(""), "");
    }

    #[test]
    fn punctuation_stripping_is_opt_in() {
        let mut keep = Normalizer::new(true, false);
        assert_eq!(keep.normalize("it's fine."), "it's fine.");

        let mut strip = Normalizer::new(true, true);
        assert_eq!(strip.normalize("it's fine."), "its fine");
    }

    #[test]
    fn pool_recycles_instances() {
        let pool = NormalizerPool::new();
        let mut n = pool.get();
        assert_eq!(n.normalize("Abc"), "abc");
        pool.put(n);
        assert_eq!(pool.idle.lock().len(), 1);
    }
}
