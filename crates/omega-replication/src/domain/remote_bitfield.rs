//! A peer's block presence, as it told us.
//!
//! Pages use the same layout as the local [`Bitfield`](omega_core::Bitfield)
//! so a broadcast page can be stored as is. Runs of fully claimed pages are
//! kept as a single entry, so range updates cost O(pages touched) no matter
//! how many blocks they cover.

use omega_core::{BITS_PER_PAGE, WORDS_PER_PAGE};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Page {
    /// Every bit of pages `[key, end)` is set.
    Full { end: u64 },
    /// One partially claimed page.
    Words(Vec<u32>),
}

/// In-memory presence bits of one remote peer.
#[derive(Debug, Clone, Default)]
pub struct RemoteBitfield {
    pages: BTreeMap<u64, Page>,
}

impl RemoteBitfield {
    /// Empty bitfield.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the peer claims block `index`. Unknown pages read as `false`.
    pub fn get(&self, index: u64) -> bool {
        let page = index / BITS_PER_PAGE;
        let bit = index % BITS_PER_PAGE;
        match self.pages.range(..=page).next_back() {
            Some((_, Page::Full { end })) => page < *end,
            Some((&key, Page::Words(words))) if key == page => {
                words[(bit / 32) as usize] & (1 << (bit % 32)) != 0
            }
            _ => false,
        }
    }

    /// Set or clear the claim on block `index`.
    pub fn set(&mut self, index: u64, value: bool) {
        let bit = index % BITS_PER_PAGE;
        self.patch(index / BITS_PER_PAGE, bit, bit + 1, value);
    }

    /// Set or clear `[start, start + length)`.
    pub fn set_range(&mut self, start: u64, length: u64, value: bool) {
        let end = start.saturating_add(length);
        if start >= end {
            return;
        }
        let first = start / BITS_PER_PAGE;
        let last = (end - 1) / BITS_PER_PAGE;
        let head = start % BITS_PER_PAGE;
        let tail = (end - 1) % BITS_PER_PAGE + 1;
        if first == last {
            self.patch(first, head, tail, value);
            return;
        }

        let mut whole = first..last + 1;
        if head != 0 {
            self.patch(first, head, BITS_PER_PAGE, value);
            whole.start = first + 1;
        }
        if tail != BITS_PER_PAGE {
            self.patch(last, 0, tail, value);
            whole.end = last;
        }
        if whole.start < whole.end {
            self.remove_pages(whole.start, whole.end);
            if value {
                self.pages.insert(whole.start, Page::Full { end: whole.end });
            }
        }
    }

    /// Replace page `page` wholesale. Short pages are zero padded.
    pub fn set_page(&mut self, page: u64, words: &[u32]) {
        let mut full = vec![0; WORDS_PER_PAGE];
        let n = words.len().min(WORDS_PER_PAGE);
        full[..n].copy_from_slice(&words[..n]);
        self.remove_pages(page, page + 1);
        if full.iter().any(|word| *word != 0) {
            self.pages.insert(page, Page::Words(full));
        }
    }

    /// Whether any block in `[start, end)` is claimed.
    pub fn any(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        let first = start / BITS_PER_PAGE;
        let last = (end - 1) / BITS_PER_PAGE;
        if let Some((_, Page::Full { end: run_end })) = self.pages.range(..first).next_back() {
            if *run_end > first {
                return true;
            }
        }
        self.pages.range(first..=last).any(|(&key, page)| match page {
            Page::Full { .. } => true,
            Page::Words(words) => {
                let lo = if key == first { start % BITS_PER_PAGE } else { 0 };
                let hi = if key == last {
                    (end - 1) % BITS_PER_PAGE + 1
                } else {
                    BITS_PER_PAGE
                };
                word_masks(lo, hi).any(|(word, mask)| words[word] & mask != 0)
            }
        })
    }

    /// Number of stored page entries, counting a run of full pages once.
    pub fn entries(&self) -> usize {
        self.pages.len()
    }

    /// Set or clear bits `[lo, hi)` of page `page`.
    fn patch(&mut self, page: u64, lo: u64, hi: u64, value: bool) {
        if lo == 0 && hi == BITS_PER_PAGE {
            self.remove_pages(page, page + 1);
            if value {
                self.pages.insert(page, Page::Full { end: page + 1 });
            }
            return;
        }
        if !value && !self.has_page(page) {
            return;
        }

        self.split_at(page);
        self.split_at(page + 1);
        let mut words = match self.pages.remove(&page) {
            Some(Page::Full { .. }) => vec![u32::MAX; WORDS_PER_PAGE],
            Some(Page::Words(words)) => words,
            None => vec![0; WORDS_PER_PAGE],
        };
        for (word, mask) in word_masks(lo, hi) {
            if value {
                words[word] |= mask;
            } else {
                words[word] &= !mask;
            }
        }

        if words.iter().all(|word| *word == u32::MAX) {
            self.pages.insert(page, Page::Full { end: page + 1 });
        } else if words.iter().any(|word| *word != 0) {
            self.pages.insert(page, Page::Words(words));
        }
    }

    fn has_page(&self, page: u64) -> bool {
        match self.pages.range(..=page).next_back() {
            Some((_, Page::Full { end })) => page < *end,
            Some((&key, Page::Words(_))) => key == page,
            None => false,
        }
    }

    /// Drop every entry for pages `[from, to)`, splitting runs at the edges.
    fn remove_pages(&mut self, from: u64, to: u64) {
        self.split_at(from);
        self.split_at(to);
        let keys: Vec<u64> = self.pages.range(from..to).map(|(key, _)| *key).collect();
        for key in keys {
            self.pages.remove(&key);
        }
    }

    /// Make sure no run straddles the start of page `page`.
    fn split_at(&mut self, page: u64) {
        let straddling = self
            .pages
            .range(..page)
            .next_back()
            .and_then(|(&key, entry)| match entry {
                Page::Full { end } if *end > page => Some((key, *end)),
                _ => None,
            });
        if let Some((key, end)) = straddling {
            self.pages.insert(key, Page::Full { end: page });
            self.pages.insert(page, Page::Full { end });
        }
    }
}

/// `(word, mask)` pairs covering bits `[lo, hi)` of a page.
fn word_masks(lo: u64, hi: u64) -> impl Iterator<Item = (usize, u32)> {
    let first = lo / 32;
    let last = (hi - 1) / 32;
    (first..=last).map(move |word| {
        let from = if word == first { lo % 32 } else { 0 };
        let to = if word == last { (hi - 1) % 32 + 1 } else { 32 };
        let mask = if to - from == 32 {
            u32::MAX
        } else {
            ((1u32 << (to - from)) - 1) << from
        };
        (word as usize, mask)
    })
}
