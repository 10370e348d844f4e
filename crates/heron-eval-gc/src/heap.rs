//! Heap: configuration, the arena collection and the raw free-list
//! allocator.
//!
//! The heap serves allocations from the segregated lists and grows by one
//! arena when asked; deciding *when* to collect or grow belongs to the
//! collector. Sweeping lives here too because it is an arena walk that
//! rebuilds the free-lists in place.

use std::ptr::{self, NonNull};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::arena::{Arena, MAX_ARENA_WORDS, next_arena_words};
use crate::free_list::{FreeLists, SIZE_CLASSES, class_for_block, init_free};
use crate::object::{
    Header, MIN_OBJECT_WORDS, Tag, WORD_SIZE, Word, initial_misc, object_words,
};

/// Default initial arena size in bytes.
pub const DEFAULT_INITIAL_HEAP_BYTES: usize = 131_072;

/// Environment variable overriding the initial arena size, in bytes.
pub const INITIAL_HEAP_ENV_VAR: &str = "GC_INITIAL_HEAP_SIZE";

/// GC configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Initial arena size in bytes. Every later arena is 1.5x its
    /// predecessor.
    pub initial_heap_bytes: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_heap_bytes: DEFAULT_INITIAL_HEAP_BYTES,
        }
    }
}

impl GcConfig {
    /// The default configuration with `GC_INITIAL_HEAP_SIZE` applied if set.
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = GcConfig::default();
        if let Ok(raw) = std::env::var(INITIAL_HEAP_ENV_VAR) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) => config.initial_heap_bytes = bytes,
                Err(err) => warn!(
                    target: "heron::gc",
                    value = %raw,
                    %err,
                    "ignoring unparsable GC_INITIAL_HEAP_SIZE"
                ),
            }
        }
        config
    }

    /// Initial arena size in words, at least the minimum object size.
    pub(crate) fn initial_words(&self) -> usize {
        (self.initial_heap_bytes / WORD_SIZE)
            .max(MIN_OBJECT_WORDS)
            .min(MAX_ARENA_WORDS)
    }
}

/// Counters produced by one sweep.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepStats {
    pub(crate) objects_freed: usize,
    pub(crate) words_freed: usize,
}

/// The arena collection plus the segregated free-lists.
pub(crate) struct Heap {
    arenas: Vec<Arena>,
    free_lists: FreeLists,
    /// Size of the next arena, in words.
    next_size: usize,
    /// Sum of all arena sizes, in words.
    total_words: usize,
    /// Words handed out over the heap's lifetime, padding included.
    pub(crate) lifetime_allocated_words: usize,
    /// Words reclaimed by sweeps over the heap's lifetime.
    pub(crate) lifetime_freed_words: usize,
}

impl Heap {
    pub(crate) fn new(config: &GcConfig) -> Self {
        let mut heap = Heap {
            arenas: Vec::new(),
            free_lists: FreeLists::new(),
            next_size: config.initial_words(),
            total_words: 0,
            lifetime_allocated_words: 0,
            lifetime_freed_words: 0,
        };
        let first = heap.next_size;
        heap.add_arena(first);
        heap
    }

    /// Acquire a fresh arena of `words` words and put it on the free-lists
    /// as a single spanning block.
    pub(crate) fn add_arena(&mut self, words: usize) {
        let words = words.min(MAX_ARENA_WORDS);
        debug!(target: "heron::gc", bytes = words * WORD_SIZE, "allocating arena");
        let arena = Arena::new(words);
        // SAFETY: the arena is fresh, unaliased memory of exactly `words`
        // words.
        unsafe {
            let block = init_free(arena.start(), words);
            self.free_lists.insert(block);
        }
        self.total_words += words;
        self.next_size = next_arena_words(words);
        self.arenas.push(arena);
    }

    pub(crate) fn next_size(&self) -> usize {
        self.next_size
    }

    pub(crate) fn total_words(&self) -> usize {
        self.total_words
    }

    pub(crate) fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// True if `p` points into any arena.
    pub(crate) fn contains(&self, p: *const u8) -> bool {
        self.arenas.iter().any(|arena| arena.contains(p))
    }

    #[cfg(feature = "gc_debug")]
    pub(crate) fn arena_ranges(&self) -> Vec<(usize, usize)> {
        self.arenas
            .iter()
            .map(|arena| (arena.start() as usize, arena.end() as usize))
            .collect()
    }

    /// Serve `words` words from the free-lists, splitting oversized blocks.
    /// Returns `None` when no block fits; the collector then collects or
    /// grows.
    pub(crate) fn try_allocate(&mut self, tag: Tag, words: usize) -> Option<NonNull<Header>> {
        debug_assert!(words >= MIN_OBJECT_WORDS);
        debug_assert_ne!(tag, Tag::Free, "free blocks are not allocated");
        // SAFETY: the lists hold only well-formed free blocks inside our
        // arenas; the block is unlinked before its header is rewritten.
        unsafe {
            let block = self.free_lists.take(words)?;
            let have = (*block).misc();
            debug_assert!(have >= words);
            let pad = if have >= words + MIN_OBJECT_WORDS {
                // Split off the suffix as its own free block.
                let suffix = init_free((block as *mut Word).add(words), have - words);
                self.free_lists.insert(suffix);
                0
            } else {
                // A remainder below the minimum object size cannot stand
                // alone; the object absorbs it.
                have - words
            };
            ptr::write(block, Header::new(tag, initial_misc(tag, words)));
            (*block).set_padding(pad);
            debug_assert_eq!(object_words(block), words + pad, "unrepresentable size");
            self.lifetime_allocated_words += words + pad;
            Some(NonNull::new_unchecked(block))
        }
    }

    /// Sweep every arena: rebuild the free-lists, coalesce dead runs, clear
    /// marks on survivors.
    pub(crate) fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        let Heap {
            arenas, free_lists, ..
        } = self;
        free_lists.reset();
        for arena in arenas.iter() {
            sweep_arena(arena, free_lists, &mut stats);
        }
        self.lifetime_freed_words += stats.words_freed;
        stats
    }

    /// Walk the whole heap checking the structural invariants: exact arena
    /// tiling, no marks, no adjacent free blocks, and every free block of at
    /// least two words on exactly the list its size selects. Panics on the
    /// first violation.
    pub(crate) fn verify(&self) {
        let mut on_list: FxHashMap<usize, usize> = FxHashMap::default();
        // SAFETY: the lists hold only blocks inside our arenas.
        unsafe {
            self.free_lists.for_each(|class, block| {
                let prev = on_list.insert(block as usize, class);
                assert!(prev.is_none(), "free block {block:p} linked twice");
            });
        }
        for arena in &self.arenas {
            let end = arena.end();
            let mut pos = arena.start();
            let mut prev_was_free = false;
            while pos < end {
                let obj = pos as *const Header;
                // SAFETY: the tiling invariant says pos is a live header; a
                // violation panics inside object_words, which is the point.
                let size = unsafe { object_words(obj) };
                assert!(size > 0, "zero-sized object at {obj:p}");
                let header = unsafe { &*obj };
                assert!(!header.is_marked(), "marked object at {obj:p} outside a collection");
                if header.tag() == Some(Tag::Free) {
                    assert!(!prev_was_free, "adjacent free blocks at {obj:p}");
                    prev_was_free = true;
                    if size >= MIN_OBJECT_WORDS {
                        let class = on_list
                            .remove(&(pos as usize))
                            .unwrap_or_else(|| panic!("free block {obj:p} on no list"));
                        assert!(
                            size >= SIZE_CLASSES[class] && class == class_for_block(size),
                            "free block {obj:p} of {size} words on the wrong list"
                        );
                    }
                } else {
                    assert!(size >= MIN_OBJECT_WORDS, "undersized object at {obj:p}");
                    prev_was_free = false;
                }
                pos = unsafe { pos.add(size) };
            }
            assert!(pos == end, "arena tiling broken at {pos:p}");
        }
        assert!(
            on_list.is_empty(),
            "free-lists reference blocks outside the heap tiling"
        );
    }
}

#[cfg(feature = "gc_debug")]
const POISON_WORD: Word = 0xdead_c0de_dead_beef_u64 as Word;

fn sweep_arena(arena: &Arena, free_lists: &mut FreeLists, stats: &mut SweepStats) {
    let end = arena.end();
    let mut pos = arena.start();
    // Running coalesce accumulator: the free block every adjacent dead or
    // free span is folded into.
    let mut cur_free: *mut Header = ptr::null_mut();

    fn flush(free_lists: &mut FreeLists, cur_free: &mut *mut Header) {
        if !cur_free.is_null() {
            // SAFETY: cur_free is a well-formed free block built this walk.
            unsafe {
                if (**cur_free).misc() > 1 {
                    free_lists.insert(*cur_free);
                }
            }
            *cur_free = ptr::null_mut();
        }
    }

    while pos < end {
        let obj = pos as *mut Header;
        // SAFETY: the walk only lands on headers as long as every object
        // reports its true size; object_words panics on corrupted tags.
        let size = unsafe { object_words(obj) };
        assert!(size > 0, "zero-sized object at {obj:p}");
        let header = unsafe { &*obj };
        let tag = header.tag().expect("validated by object_words");

        if tag == Tag::Free {
            if cur_free.is_null() {
                cur_free = obj;
            } else {
                // SAFETY: cur_free precedes obj contiguously; growing its
                // size swallows obj.
                unsafe { (*cur_free).set_misc((*cur_free).misc() + size) };
            }
        } else if header.is_marked() {
            flush(free_lists, &mut cur_free);
            header.unmark();
        } else {
            // Dead object: poison, count, fold into the current free run.
            #[cfg(feature = "gc_debug")]
            // SAFETY: the object spans `size` words starting at obj.
            unsafe {
                for i in 0..size {
                    (obj as *mut Word).add(i).write(POISON_WORD);
                }
            }
            stats.objects_freed += 1;
            stats.words_freed += size;
            if cur_free.is_null() {
                // SAFETY: converting the dead object in place; its span is
                // exactly `size` words.
                cur_free = unsafe { init_free(obj as *mut Word, size) };
            } else {
                // SAFETY: as in the Free case above.
                unsafe { (*cur_free).set_misc((*cur_free).misc() + size) };
            }
        }

        // SAFETY: size is bounded by the tiling; the overshoot check follows.
        pos = unsafe { pos.add(size) };
    }
    flush(free_lists, &mut cur_free);

    if pos != end {
        panic!("mis-sized object made the arena walk overshoot the end at {pos:p}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::VALUE_WORDS;

    fn small_heap(words: usize) -> Heap {
        Heap::new(&GcConfig {
            initial_heap_bytes: words * WORD_SIZE,
        })
    }

    #[test]
    fn test_new_heap_is_one_free_block() {
        let heap = small_heap(64);
        assert_eq!(heap.arena_count(), 1);
        assert_eq!(heap.total_words(), 64);
        heap.verify();
    }

    #[test]
    fn test_allocate_splits() {
        let mut heap = small_heap(64);
        let a = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        let b = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        // Successive splits carve the arena front to back.
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            VALUE_WORDS * WORD_SIZE
        );
        assert_eq!(unsafe { object_words(a.as_ptr()) }, VALUE_WORDS);
        assert_eq!(heap.lifetime_allocated_words, 2 * VALUE_WORDS);
        heap.verify();
    }

    #[test]
    fn test_allocate_absorbs_small_remainder() {
        let mut heap = small_heap(32);
        // Leave exactly four words free.
        let _a = heap.try_allocate(Tag::String, 28).expect("fits");
        // A three-word request from a four-word block cannot split.
        let b = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        assert_eq!(unsafe { object_words(b.as_ptr()) }, 4);
        heap.verify();
    }

    #[test]
    fn test_allocate_exhaustion() {
        let mut heap = small_heap(8);
        let _a = heap.try_allocate(Tag::String, 8).expect("fits");
        assert!(heap.try_allocate(Tag::Int, VALUE_WORDS).is_none());
    }

    #[test]
    fn test_add_arena_grows_geometrically() {
        let mut heap = small_heap(32);
        assert_eq!(heap.next_size(), 48);
        heap.add_arena(48);
        assert_eq!(heap.arena_count(), 2);
        assert_eq!(heap.total_words(), 80);
        assert_eq!(heap.next_size(), 72);
        heap.verify();
    }

    #[test]
    fn test_sweep_reclaims_unmarked() {
        let mut heap = small_heap(64);
        let a = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        let b = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        unsafe { (*a.as_ptr()).mark() };

        let stats = heap.sweep();
        assert_eq!(stats.objects_freed, 1);
        assert_eq!(stats.words_freed, VALUE_WORDS);
        assert_eq!(heap.lifetime_freed_words, VALUE_WORDS);

        // The survivor is unmarked again; the dead object's words are free.
        assert!(unsafe { !(*a.as_ptr()).is_marked() });
        assert_eq!(unsafe { (*b.as_ptr()).tag() }, Some(Tag::Free));
        heap.verify();
    }

    #[test]
    fn test_sweep_coalesces_adjacent_dead() {
        let mut heap = small_heap(64);
        let a = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        let _b = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        let _c = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        let d = heap.try_allocate(Tag::Int, VALUE_WORDS).expect("fits");
        unsafe { (*a.as_ptr()).mark() };
        unsafe { (*d.as_ptr()).mark() };

        let stats = heap.sweep();
        assert_eq!(stats.objects_freed, 2);

        // b and c merged into one free block of six words.
        let b = unsafe { (a.as_ptr() as *mut Word).add(VALUE_WORDS) as *mut Header };
        assert_eq!(unsafe { (*b).tag() }, Some(Tag::Free));
        assert_eq!(unsafe { (*b).misc() }, 2 * VALUE_WORDS);
        heap.verify();
    }

    #[test]
    fn test_config_from_env() {
        // SAFETY: no other thread reads this variable concurrently.
        unsafe { std::env::set_var(INITIAL_HEAP_ENV_VAR, "4096") };
        assert_eq!(GcConfig::from_env().initial_heap_bytes, 4096);
        unsafe { std::env::set_var(INITIAL_HEAP_ENV_VAR, "not a number") };
        assert_eq!(
            GcConfig::from_env().initial_heap_bytes,
            DEFAULT_INITIAL_HEAP_BYTES
        );
        unsafe { std::env::remove_var(INITIAL_HEAP_ENV_VAR) };
        assert_eq!(
            GcConfig::from_env().initial_heap_bytes,
            DEFAULT_INITIAL_HEAP_BYTES
        );
    }

    #[test]
    fn test_initial_words_minimum() {
        let config = GcConfig {
            initial_heap_bytes: 1,
        };
        assert_eq!(config.initial_words(), MIN_OBJECT_WORDS);
    }
}
