//! Arena management.
//!
//! An arena is a contiguous, word-aligned memory region owned by the GC and
//! subdivided into objects by the allocator. Arenas are immutable in start
//! and size after creation and are only released when the GC is torn down.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::object::{MIN_OBJECT_WORDS, WORD_SIZE, Word};

/// Arena alignment in bytes: two words, so the low bit of every object
/// pointer is guaranteed clear (string-context tagging relies on it).
pub const ARENA_ALIGN: usize = 2 * WORD_SIZE;

/// Saturation point for arena growth, in words. Kept far below the address
/// space limit so word-to-byte conversions can never overflow.
pub const MAX_ARENA_WORDS: usize = usize::MAX / (4 * WORD_SIZE);

/// Next arena size after one of `words`: grows by 1.5x, saturating at
/// [`MAX_ARENA_WORDS`] instead of wrapping.
#[inline]
pub fn next_arena_words(words: usize) -> usize {
    (words.saturating_mul(3) / 2).min(MAX_ARENA_WORDS)
}

/// A contiguous region of `words` words obtained from the system allocator.
pub struct Arena {
    start: NonNull<Word>,
    words: usize,
}

impl Arena {
    /// Allocate an arena of `words` words. Aborts via
    /// [`alloc::handle_alloc_error`] if the system allocator refuses.
    pub fn new(words: usize) -> Self {
        assert!(words >= MIN_OBJECT_WORDS, "arena below the minimum object size");
        assert!(words <= MAX_ARENA_WORDS, "arena beyond the growth saturation point");
        let layout = Self::layout(words);
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc::alloc(layout) } as *mut Word;
        let Some(start) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        Arena { start, words }
    }

    fn layout(words: usize) -> Layout {
        Layout::from_size_align(words * WORD_SIZE, ARENA_ALIGN).expect("arena layout")
    }

    /// First word of the arena.
    #[inline]
    pub fn start(&self) -> *mut Word {
        self.start.as_ptr()
    }

    /// One past the last word of the arena.
    #[inline]
    pub fn end(&self) -> *mut Word {
        // SAFETY: start..start+words is the allocation we own.
        unsafe { self.start.as_ptr().add(self.words) }
    }

    /// Size in words.
    #[inline]
    pub fn words(&self) -> usize {
        self.words
    }

    /// True if `p` points inside this arena.
    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        addr >= self.start.as_ptr() as usize && addr < self.end() as usize
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the identical layout.
        unsafe { alloc::dealloc(self.start.as_ptr() as *mut u8, Self::layout(self.words)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_alignment() {
        let arena = Arena::new(64);
        assert_eq!(arena.start() as usize % ARENA_ALIGN, 0);
        assert_eq!(arena.words(), 64);
    }

    #[test]
    fn test_arena_contains() {
        let arena = Arena::new(16);
        let start = arena.start() as *const u8;
        assert!(arena.contains(start));
        // SAFETY: in-bounds offsets of the arena allocation.
        assert!(arena.contains(unsafe { start.add(16 * WORD_SIZE - 1) }));
        assert!(!arena.contains(unsafe { start.add(16 * WORD_SIZE) }));
        assert!(!arena.contains(std::ptr::null()));
    }

    #[test]
    fn test_growth_saturates() {
        assert_eq!(next_arena_words(32), 48);
        assert_eq!(next_arena_words(48), 72);
        assert_eq!(next_arena_words(usize::MAX / 2), MAX_ARENA_WORDS);
        assert_eq!(next_arena_words(MAX_ARENA_WORDS), MAX_ARENA_WORDS);
    }
}
