//! Local block presence.
//!
//! Bits are grouped in pages of 32768 (1024 little-endian `u32` words,
//! 4 KiB on disk). Pages are allocated on first write and persisted at
//! `page * 4096` in the bitfield storage.

use crate::domain::errors::CoreError;
use crate::ports::outbound::RandomAccess;
use std::collections::{BTreeMap, BTreeSet};

/// Bits per page.
pub const BITS_PER_PAGE: u64 = 32768;

/// `u32` words per page.
pub const WORDS_PER_PAGE: usize = (BITS_PER_PAGE / 32) as usize;

/// Bytes per page on disk.
pub const PAGE_BYTES: u64 = BITS_PER_PAGE / 8;

/// Presence bitfield backed by storage.
pub struct Bitfield {
    storage: Box<dyn RandomAccess>,
    pages: BTreeMap<u64, Vec<u32>>,
    dirty: BTreeSet<u64>,
}

impl Bitfield {
    /// Load every stored page.
    pub fn open(storage: Box<dyn RandomAccess>) -> Result<Self, CoreError> {
        let size = storage.len()?;
        let mut pages = BTreeMap::new();

        let mut page = 0;
        while page * PAGE_BYTES < size {
            let offset = page * PAGE_BYTES;
            let length = PAGE_BYTES.min(size - offset);
            if let Some(bytes) = storage.read(offset, length)? {
                let words = decode_page(&bytes);
                if words.iter().any(|w| *w != 0) {
                    pages.insert(page, words);
                }
            }
            page += 1;
        }

        Ok(Self {
            storage,
            pages,
            dirty: BTreeSet::new(),
        })
    }

    /// Whether block `index` is present.
    pub fn get(&self, index: u64) -> bool {
        let (page, word, bit) = locate(index);
        self.pages
            .get(&page)
            .is_some_and(|words| words[word] & (1 << bit) != 0)
    }

    /// Set or clear block `index`.
    pub fn set(&mut self, index: u64, value: bool) {
        let (page, word, bit) = locate(index);
        if !value && !self.pages.contains_key(&page) {
            return;
        }
        let words = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0; WORDS_PER_PAGE]);
        if value {
            words[word] |= 1 << bit;
        } else {
            words[word] &= !(1 << bit);
        }
        self.dirty.insert(page);
    }

    /// Set or clear every block in `[start, end)`, a word at a time.
    pub fn set_range(&mut self, start: u64, end: u64, value: bool) {
        let mut index = start;
        while index < end {
            let (page, word, bit) = locate(index);
            if !value && !self.pages.contains_key(&page) {
                match self.next_page_start(page) {
                    Some(next) => index = next,
                    None => break,
                }
                continue;
            }
            let span = (32 - u64::from(bit)).min(end - index);
            let mask = word_mask(bit, span);
            let words = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0; WORDS_PER_PAGE]);
            if value {
                words[word] |= mask;
            } else {
                words[word] &= !mask;
            }
            self.dirty.insert(page);
            index += span;
        }
    }

    /// Words of page `index`, if allocated.
    pub fn page(&self, index: u64) -> Option<&[u32]> {
        self.pages.get(&index).map(|words| words.as_slice())
    }

    /// Allocated pages that hold at least one set bit, in order.
    pub fn pages(&self) -> impl Iterator<Item = (u64, &[u32])> {
        self.pages
            .iter()
            .filter(|(_, words)| words.iter().any(|w| *w != 0))
            .map(|(index, words)| (*index, words.as_slice()))
    }

    /// Number of present blocks in `[start, end)`.
    pub fn count(&self, start: u64, end: u64) -> u64 {
        let mut total = 0;
        let mut index = start;
        while index < end {
            let (page, word, bit) = locate(index);
            let Some(words) = self.pages.get(&page) else {
                match self.next_page_start(page) {
                    Some(next) => index = next,
                    None => break,
                }
                continue;
            };
            let span = (32 - u64::from(bit)).min(end - index);
            total += u64::from((words[word] & word_mask(bit, span)).count_ones());
            index += span;
        }
        total
    }

    /// First missing block at or after `start` and before `end`.
    pub fn first_missing(&self, start: u64, end: u64) -> Option<u64> {
        let mut index = start;
        while index < end {
            let (page, word, bit) = locate(index);
            let Some(words) = self.pages.get(&page) else {
                return Some(index);
            };
            let missing = !words[word] >> bit;
            if missing != 0 {
                let found = index + u64::from(missing.trailing_zeros());
                return (found < end).then_some(found);
            }
            index += 32 - u64::from(bit);
        }
        None
    }

    /// First present block at or after `start` and before `end`.
    pub fn first_present(&self, start: u64, end: u64) -> Option<u64> {
        let mut index = start;
        while index < end {
            let (page, word, bit) = locate(index);
            let Some(words) = self.pages.get(&page) else {
                index = self.next_page_start(page)?;
                continue;
            };
            let present = words[word] >> bit;
            if present != 0 {
                let found = index + u64::from(present.trailing_zeros());
                return (found < end).then_some(found);
            }
            index += 32 - u64::from(bit);
        }
        None
    }

    /// First block of the next allocated page after `page`.
    fn next_page_start(&self, page: u64) -> Option<u64> {
        self.pages
            .range(page + 1..)
            .next()
            .map(|(next, _)| next.saturating_mul(BITS_PER_PAGE))
    }

    /// Persist modified pages.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        for page in std::mem::take(&mut self.dirty) {
            if let Some(words) = self.pages.get(&page) {
                self.storage.write(page * PAGE_BYTES, &encode_page(words))?;
            }
        }
        self.storage.sync()
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("pages", &self.pages.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

/// `span` bits starting at `bit` within one word.
fn word_mask(bit: u32, span: u64) -> u32 {
    if span >= 32 {
        u32::MAX
    } else {
        ((1u32 << span) - 1) << bit
    }
}

fn locate(index: u64) -> (u64, usize, u32) {
    let page = index / BITS_PER_PAGE;
    let within = index % BITS_PER_PAGE;
    (page, (within / 32) as usize, (within % 32) as u32)
}

/// Encode page words as little-endian bytes.
pub fn encode_page(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Decode little-endian bytes into a full page, zero-padding short input.
pub fn decode_page(bytes: &[u8]) -> Vec<u32> {
    let mut words = vec![0u32; WORDS_PER_PAGE];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks(4)) {
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        *word = u32::from_le_bytes(buf);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStorage;

    fn open(storage: &MemoryStorage) -> Bitfield {
        Bitfield::open(Box::new(storage.clone())).unwrap()
    }

    #[test]
    fn test_set_get() {
        let mut bits = open(&MemoryStorage::new());
        assert!(!bits.get(5));
        bits.set(5, true);
        bits.set(BITS_PER_PAGE + 1, true);
        assert!(bits.get(5));
        assert!(bits.get(BITS_PER_PAGE + 1));
        assert!(!bits.get(6));

        bits.set(5, false);
        assert!(!bits.get(5));
    }

    #[test]
    fn test_sparse_pages() {
        let mut bits = open(&MemoryStorage::new());
        bits.set(10 * BITS_PER_PAGE, true);
        bits.set(3, false);
        assert_eq!(bits.pages().map(|(i, _)| i).collect::<Vec<_>>(), vec![10]);
        assert!(bits.page(0).is_none());
    }

    #[test]
    fn test_flush_and_reopen() {
        let storage = MemoryStorage::new();
        let mut bits = open(&storage);
        bits.set_range(30, 40, true);
        bits.set(BITS_PER_PAGE * 2, true);
        bits.flush().unwrap();

        let reopened = open(&storage);
        assert_eq!(reopened.count(0, 100), 10);
        assert!(reopened.get(BITS_PER_PAGE * 2));
        assert_eq!(reopened.first_missing(30, 45), Some(40));
    }

    #[test]
    fn test_clear_range() {
        let mut bits = open(&MemoryStorage::new());
        bits.set_range(0, 5, true);
        bits.set_range(3, 5, false);
        assert_eq!(bits.count(0, 5), 3);
        assert_eq!(bits.first_missing(0, 5), Some(3));
    }

    #[test]
    fn test_ranges_across_words_and_pages() {
        let mut bits = open(&MemoryStorage::new());
        let start = BITS_PER_PAGE - 40;
        let end = BITS_PER_PAGE * 2 + 3;
        bits.set_range(start, end, true);

        assert_eq!(bits.count(0, BITS_PER_PAGE * 3), end - start);
        assert_eq!(bits.first_missing(0, end), Some(0));
        assert_eq!(bits.first_missing(start, end + 10), Some(end));
        assert_eq!(bits.first_missing(start, end), None);
        assert!(!bits.get(start - 1) && bits.get(start) && bits.get(end - 1) && !bits.get(end));

        bits.set_range(start + 5, BITS_PER_PAGE + 1, false);
        assert_eq!(bits.first_missing(start, end), Some(start + 5));
        assert_eq!(bits.count(start, end), 5 + (end - BITS_PER_PAGE - 1));
        assert_eq!(bits.first_missing(BITS_PER_PAGE + 1, end), None);
    }

    #[test]
    fn test_first_present_skips_empty_pages() {
        let mut bits = open(&MemoryStorage::new());
        assert_eq!(bits.first_present(0, u64::MAX), None);

        bits.set(BITS_PER_PAGE * 9 + 33, true);
        bits.set(2, true);
        bits.set(2, false);
        assert_eq!(bits.first_present(0, u64::MAX), Some(BITS_PER_PAGE * 9 + 33));
        assert_eq!(bits.first_present(0, BITS_PER_PAGE * 9 + 33), None);
    }

    #[test]
    fn test_clearing_unallocated_pages_is_free() {
        let mut bits = open(&MemoryStorage::new());
        bits.set(3, true);
        bits.set_range(4, u64::MAX, false);
        assert_eq!(bits.pages().count(), 1);
        assert_eq!(bits.count(0, u64::MAX), 1);
        assert_eq!(bits.first_missing(3, u64::MAX), Some(4));
    }

    #[test]
    fn test_page_codec() {
        let mut words = vec![0u32; WORDS_PER_PAGE];
        words[0] = 0xdead_beef;
        words[WORDS_PER_PAGE - 1] = 1;
        let bytes = encode_page(&words);
        assert_eq!(bytes.len() as u64, PAGE_BYTES);
        assert_eq!(decode_page(&bytes), words);
        assert_eq!(decode_page(&[1, 0, 0])[0], 1);
    }
}
