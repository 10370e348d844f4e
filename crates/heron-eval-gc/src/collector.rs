//! The collector: allocation entry points, root registration and the
//! stop-the-world mark and sweep cycle.
//!
//! One [`Gc`] exists per evaluation session and is passed explicitly to
//! every allocation site. Interior mutability keeps every method on `&self`
//! so root guards can stay alive across allocations; the type is neither
//! `Send` nor `Sync`, matching the single-mutator model.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use tracing::{debug, info, warn};

use crate::heap::{GcConfig, Heap};
use crate::object::{Header, MIN_OBJECT_WORDS, Tag, WORD_SIZE, trace_children};
use crate::roots::{ObjRoot, ObjRoots, PtrRoot, PtrRoots};

/// The garbage collector for one evaluation session.
pub struct Gc {
    heap: RefCell<Heap>,
    ptr_roots: PtrRoots,
    obj_roots: ObjRoots,
    collections: Cell<usize>,
    last_marked: Cell<usize>,
    last_freed_objects: Cell<usize>,
    last_freed_words: Cell<usize>,
}

/// Point-in-time collector statistics.
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    /// Bytes currently owned by arenas.
    pub arena_bytes: usize,
    /// Number of arenas.
    pub arena_count: usize,
    /// Collections run so far.
    pub collections: usize,
    /// Objects marked live by the last collection.
    pub last_marked: usize,
    /// Objects reclaimed by the last collection.
    pub last_freed_objects: usize,
    /// Bytes reclaimed by the last collection.
    pub last_freed_bytes: usize,
    /// Bytes handed out over the collector's lifetime.
    pub lifetime_allocated_bytes: usize,
    /// Bytes reclaimed over the collector's lifetime.
    pub lifetime_freed_bytes: usize,
}

impl Gc {
    /// A collector configured from the environment (`GC_INITIAL_HEAP_SIZE`).
    pub fn new() -> Self {
        Self::with_config(GcConfig::from_env())
    }

    /// A collector with an explicit configuration.
    pub fn with_config(config: GcConfig) -> Self {
        Gc {
            heap: RefCell::new(Heap::new(&config)),
            ptr_roots: PtrRoots::new(),
            obj_roots: ObjRoots::new(),
            collections: Cell::new(0),
            last_marked: Cell::new(0),
            last_freed_objects: Cell::new(0),
            last_freed_words: Cell::new(0),
        }
    }

    /// Allocate an object of `tag` spanning `words` words (rounded up to the
    /// two-word minimum). Never returns null: exhaustion collects, then
    /// grows the heap by an arena.
    ///
    /// The returned header carries the tag with the mark bit clear; the
    /// payload is NOT zeroed. The caller must initialize every field the
    /// tag's trace function reads before the next allocation or collection.
    ///
    /// # Safety
    /// This call may collect. Every heap pointer the caller intends to use
    /// afterwards must be reachable from a registered root when the call is
    /// made; an unrooted pointer held across it may be left dangling.
    pub unsafe fn alloc(&self, tag: Tag, words: usize) -> NonNull<Header> {
        let words = words.max(MIN_OBJECT_WORDS);
        if let Some(obj) = self.heap.borrow_mut().try_allocate(tag, words) {
            return obj;
        }
        self.collect();
        let mut heap = self.heap.borrow_mut();
        if let Some(obj) = heap.try_allocate(tag, words) {
            return obj;
        }
        let grow = heap.next_size().max(words);
        heap.add_arena(grow);
        heap.try_allocate(tag, words)
            .expect("a fresh arena satisfies the allocation")
    }

    /// Allocate and immediately store the result into a registered root
    /// slot, so the fresh object is rooted before control returns.
    pub fn alloc_rooted(&self, root: &PtrRoot<'_>, tag: Tag, words: usize) -> NonNull<Header> {
        // SAFETY: the object does not exist until after any collection this
        // call performs, and it is rooted before the caller sees it.
        let obj = unsafe { self.alloc(tag, words) };
        root.set(obj.as_ptr());
        obj
    }

    /// Register a pointer-slot root holding `value` (possibly null). The
    /// slot is unregistered when the guard drops.
    pub fn root_ptr(&self, value: *mut Header) -> PtrRoot<'_> {
        self.ptr_roots.register(value)
    }

    /// Register an embedded-object root, initially `Null`. The root is
    /// unregistered when the guard drops.
    pub fn root_obj(&self) -> ObjRoot<'_> {
        self.obj_roots.register()
    }

    /// Run a full stop-the-world collection.
    pub fn collect(&self) {
        let mut marked = 0usize;
        let mut stack: Vec<*mut Header> = Vec::new();

        #[cfg(feature = "gc_debug")]
        let ranges = self.heap.borrow().arena_ranges();

        // Push target for traced out-edges. Null children are dropped here;
        // under gc_debug every pointer is checked against the arenas.
        let push = |stack: &mut Vec<*mut Header>, child: *mut Header| {
            if child.is_null() {
                return;
            }
            #[cfg(feature = "gc_debug")]
            {
                let addr = child as usize;
                if !ranges.iter().any(|&(lo, hi)| (lo..hi).contains(&addr)) {
                    panic!("traced pointer {child:p} outside every arena");
                }
            }
            stack.push(child);
        };

        let drain = |stack: &mut Vec<*mut Header>, marked: &mut usize| {
            while let Some(obj) = stack.pop() {
                // SAFETY: obj came from a root or a traced field; the
                // mutator contract says those point at live headers.
                let header = unsafe { &*obj };
                if header.is_marked() {
                    continue;
                }
                header.mark();
                *marked += 1;
                // SAFETY: marked objects are live and initialized.
                unsafe { trace_children(obj, &mut |child| push(stack, child)) };
            }
        };

        // Embedded-object roots first: the root object itself lives outside
        // the heap and is never marked, only its out-edges are.
        self.obj_roots.for_each(|obj| {
            // SAFETY: the embedded object is alive as long as its guard.
            unsafe { trace_children(obj, &mut |child| push(&mut stack, child)) };
            drain(&mut stack, &mut marked);
        });

        self.ptr_roots.for_each(|value| {
            if value.is_null() {
                return;
            }
            stack.push(value);
            drain(&mut stack, &mut marked);
        });

        let stats = self.heap.borrow_mut().sweep();

        self.collections.set(self.collections.get() + 1);
        self.last_marked.set(marked);
        self.last_freed_objects.set(stats.objects_freed);
        self.last_freed_words.set(stats.words_freed);

        debug!(
            target: "heron::gc",
            marked,
            freed_objects = stats.objects_freed,
            freed_bytes = stats.words_freed * WORD_SIZE,
            "GC cycle complete"
        );
    }

    /// True if `p` points into some arena. A debugging aid, not a safety
    /// primitive.
    pub fn is_object(&self, p: *const Header) -> bool {
        self.heap.borrow().contains(p as *const u8)
    }

    /// Current statistics.
    pub fn stats(&self) -> GcStats {
        let heap = self.heap.borrow();
        GcStats {
            arena_bytes: heap.total_words() * WORD_SIZE,
            arena_count: heap.arena_count(),
            collections: self.collections.get(),
            last_marked: self.last_marked.get(),
            last_freed_objects: self.last_freed_objects.get(),
            last_freed_bytes: self.last_freed_words.get() * WORD_SIZE,
            lifetime_allocated_bytes: heap.lifetime_allocated_words * WORD_SIZE,
            lifetime_freed_bytes: heap.lifetime_freed_words * WORD_SIZE,
        }
    }

    /// Walk the whole heap checking the structural invariants, panicking on
    /// the first violation. A debugging aid; the test suite runs it after
    /// every collection.
    pub fn verify_heap(&self) {
        self.heap.borrow().verify();
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let heap = self.heap.borrow();
        info!(
            target: "heron::gc",
            "{} bytes in arenas, {} bytes allocated, {} bytes reclaimed by GC",
            heap.total_words() * WORD_SIZE,
            heap.lifetime_allocated_words * WORD_SIZE,
            heap.lifetime_freed_words * WORD_SIZE,
        );
        let ptrs = self.ptr_roots.count();
        if ptrs > 0 {
            warn!(target: "heron::gc", "{ptrs} GC root pointers still exist on exit");
        }
        let objs = self.obj_roots.count();
        if objs > 0 {
            warn!(target: "heron::gc", "{objs} GC root objects still exist on exit");
        }
    }
}
