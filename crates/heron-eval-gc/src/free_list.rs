//! Size-segregated free-lists.
//!
//! Free blocks are headers with [`Tag::Free`], their total size in `misc`
//! and a singly-linked list pointer in payload word 0. Each list holds
//! blocks of at least its threshold size; insertion pushes at the head, so
//! the most recently freed block of a class is reused first.

use std::ptr;

use crate::object::{Header, MIN_OBJECT_WORDS, Tag, Word, read_field, write_field};

/// Number of segregated lists.
pub const NUM_SIZE_CLASSES: usize = 8;

/// Minimum-size thresholds of the segregated lists, in words.
pub const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [2, 3, 4, 8, 16, 32, 64, 128];

/// List a block of `words` belongs on: the largest threshold not above it.
#[inline]
pub fn class_for_block(words: usize) -> usize {
    debug_assert!(words >= MIN_OBJECT_WORDS);
    SIZE_CLASSES
        .iter()
        .rposition(|&threshold| words >= threshold)
        .expect("two words meet the smallest threshold")
}

/// First list worth scanning for a request of `words`: the smallest
/// threshold that covers it, or the last list for oversized requests.
#[inline]
pub fn class_for_request(words: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .position(|&threshold| threshold >= words)
        .unwrap_or(NUM_SIZE_CLASSES - 1)
}

/// Rewrite the words at `at` as a free block of `words` words and return its
/// header.
///
/// # Safety
/// `at` must point at `words` contiguous writable words.
pub(crate) unsafe fn init_free(at: *mut Word, words: usize) -> *mut Header {
    debug_assert!(words >= MIN_OBJECT_WORDS);
    let block = at as *mut Header;
    unsafe {
        ptr::write(block, Header::new(Tag::Free, words));
        write_field(block, 0, 0);
    }
    block
}

/// The eight segregated list heads.
pub(crate) struct FreeLists {
    heads: [*mut Header; NUM_SIZE_CLASSES],
}

impl FreeLists {
    pub(crate) fn new() -> Self {
        FreeLists {
            heads: [ptr::null_mut(); NUM_SIZE_CLASSES],
        }
    }

    /// Forget every block. The sweep rebuilds the lists from the arena walk.
    pub(crate) fn reset(&mut self) {
        self.heads = [ptr::null_mut(); NUM_SIZE_CLASSES];
    }

    /// Push `block` onto the list for its size.
    ///
    /// # Safety
    /// `block` must be a well-formed free block not currently on any list.
    pub(crate) unsafe fn insert(&mut self, block: *mut Header) {
        unsafe {
            debug_assert_eq!((*block).tag(), Some(Tag::Free));
            let words = (*block).misc();
            let class = class_for_block(words);
            write_field(block, 0, self.heads[class] as Word);
            self.heads[class] = block;
        }
    }

    /// Unlink and return the first block of at least `words` words, scanning
    /// lists from the one covering the request upward.
    ///
    /// # Safety
    /// The lists must contain only well-formed free blocks.
    pub(crate) unsafe fn take(&mut self, words: usize) -> Option<*mut Header> {
        for class in class_for_request(words)..NUM_SIZE_CLASSES {
            let mut prev: *mut Header = ptr::null_mut();
            let mut cur = self.heads[class];
            // Every block on a covering list fits, so this normally pops the
            // head; the final list can require a walk for oversized requests.
            while !cur.is_null() {
                unsafe {
                    if (*cur).misc() >= words {
                        let next = read_field(cur, 0) as *mut Header;
                        if prev.is_null() {
                            self.heads[class] = next;
                        } else {
                            write_field(prev, 0, next as Word);
                        }
                        return Some(cur);
                    }
                    prev = cur;
                    cur = read_field(cur, 0) as *mut Header;
                }
            }
        }
        None
    }

    /// Visit every block on every list as `(class, block)`.
    ///
    /// # Safety
    /// The lists must contain only well-formed free blocks.
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(usize, *mut Header)) {
        for (class, &head) in self.heads.iter().enumerate() {
            let mut cur = head;
            while !cur.is_null() {
                f(class, cur);
                cur = unsafe { read_field(cur, 0) as *mut Header };
            }
        }
    }
}
