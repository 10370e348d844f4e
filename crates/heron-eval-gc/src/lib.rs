//! # Heron Eval Garbage Collector
//!
//! Stop-the-world, non-moving mark-and-sweep collector for the heron
//! expression evaluator.
//!
//! ## Design
//!
//! - **Growing arenas**: the heap is an ordered set of contiguous
//!   word-aligned regions; each new arena is 1.5x the previous one
//! - **Segregated free-lists**: eight lists keyed by minimum size
//!   {2, 3, 4, 8, 16, 32, 64, 128} words; first fit, oversized blocks split
//! - **One-word headers**: tag, mark bit and a tag-dependent misc field in
//!   disjoint bit ranges
//! - **Dual root protocols**: pointer-slot roots and embedded-object roots
//!   on intrusive sentinel lists with O(1) splice
//! - **Mark and sweep**: explicit mark stack driven by a per-tag trace
//!   dictionary; the sweep walks each arena left to right, coalescing dead
//!   runs back onto the free-lists
//!
//! ## The allocation hazard
//!
//! Allocation may trigger a collection. Any heap pointer held across a call
//! to [`Gc::alloc`] must be reachable from a registered root
//! ([`Gc::root_ptr`] / [`Gc::root_obj`]) or it may be left dangling; that is
//! why `alloc` is `unsafe` and [`Gc::alloc_rooted`] stores its result into a
//! root slot before returning.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod arena;
pub mod collector;
pub mod free_list;
pub mod heap;
pub mod object;
pub mod roots;

pub use collector::{Gc, GcStats};
pub use heap::{DEFAULT_INITIAL_HEAP_BYTES, GcConfig, INITIAL_HEAP_ENV_VAR};
pub use object::{
    Header, MIN_OBJECT_WORDS, StringContext, Tag, VALUE_PAYLOAD_WORDS, VALUE_WORDS, WORD_SIZE,
    Word, bindings_words, context_words, env_words, read_child, read_field, string_words,
    value_list_words, write_child, write_field,
};
pub use roots::{ObjRoot, PtrRoot};
