//! Object layout: the one-word header, the tag dictionary, and the per-tag
//! size and trace functions that drive the collector.
//!
//! Every heap object begins with a [`Header`] packing the tag, the mark bit
//! and a tag-dependent `misc` field into a single word. The collector walks
//! and traces objects exclusively through [`object_words`] and
//! [`trace_children`]; it never interprets payloads beyond what the tag
//! dictionary prescribes.

use std::cell::Cell;

/// Allocation unit. All object sizes in this crate are counted in words,
/// never bytes.
pub type Word = usize;

/// Size of one [`Word`] in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Smallest object the allocator will produce: a header plus one payload
/// word. Free blocks below this size cannot carry a list link and are never
/// created.
pub const MIN_OBJECT_WORDS: usize = 2;

/// Total size of a value-family object: header plus two payload words.
pub const VALUE_WORDS: usize = 3;

/// Payload words of a value-family object.
pub const VALUE_PAYLOAD_WORDS: usize = VALUE_WORDS - 1;

/// Object type tags.
///
/// The value family occupies a contiguous discriminant range with `Int`
/// first and `Float` last; [`Tag::is_value`] tests membership with a single
/// range check and the size dictionary assigns the whole range one fixed
/// size.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// An unallocated span. Carries its length in `misc` and a free-list
    /// link in payload word 0. Reaching one during tracing is a fatal bug.
    Free = 0,

    // Container family: variable-sized.
    /// Attribute-set table: `misc` attributes of two words each (name word,
    /// value pointer).
    Bindings = 1,
    /// Out-of-line pointer array: `misc` element pointers.
    ValueList = 2,
    /// Lexical environment frame: an `up` pointer plus `misc` value slots.
    Env = 3,
    /// Environment frame for a `with` whose attribute set is still an
    /// unevaluated expression. Only the `up` pointer is an out-edge.
    WithExprEnv = 4,
    /// Environment frame for an evaluated `with`: `up` plus the attribute
    /// set pointer in slot 0.
    WithAttrsEnv = 5,
    /// Variable-length character payload; `misc` is the byte length.
    String = 6,
    /// String-context payload of `misc` words. No out-edges.
    Context = 7,

    // Value family: one header plus a fixed two-word payload.
    /// Integer value.
    Int = 8,
    /// Boolean value.
    Bool = 9,
    /// Null value.
    Null = 10,
    /// Short string stored inline in the payload words; `misc` is the byte
    /// length.
    ShortString = 11,
    /// String with static storage duration; the payload holds a borrowed
    /// address that is not an out-edge.
    StaticString = 12,
    /// Heap string: payload word 0 points at a [`Tag::String`] body, word 1
    /// is a [`StringContext`] encoding.
    LongString = 13,
    /// Filesystem path; payload word 0 points at a [`Tag::String`] body.
    Path = 14,
    /// Attribute set; payload word 0 points at a [`Tag::Bindings`] table.
    Attrs = 15,
    /// Empty list.
    List0 = 16,
    /// One-element list stored inline.
    List1 = 17,
    /// Two-element list stored inline.
    List2 = 18,
    /// List of three or more elements; payload word 0 points at a
    /// [`Tag::ValueList`].
    ListN = 19,
    /// Unevaluated thunk: payload word 0 is the captured environment, word 1
    /// the expression (not an out-edge).
    Thunk = 20,
    /// Thunk currently under evaluation; same layout as [`Tag::Thunk`].
    Blackhole = 21,
    /// Function application: payload words 0 and 1 are the operands.
    App = 22,
    /// Partial primop application; same layout as [`Tag::App`].
    PrimOpApp = 23,
    /// Lambda value: payload word 0 is the captured environment, word 1 the
    /// function body (not an out-edge).
    Lambda = 24,
    /// Builtin function. Deliberately untraced: a primop that owns heap
    /// state must keep it alive through a root or give it static lifetime.
    PrimOp = 25,
    /// Floating-point value. Must stay the last value-family discriminant.
    Float = 26,
}

impl Tag {
    /// Decode a tag from its raw discriminant.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Tag::Free,
            1 => Tag::Bindings,
            2 => Tag::ValueList,
            3 => Tag::Env,
            4 => Tag::WithExprEnv,
            5 => Tag::WithAttrsEnv,
            6 => Tag::String,
            7 => Tag::Context,
            8 => Tag::Int,
            9 => Tag::Bool,
            10 => Tag::Null,
            11 => Tag::ShortString,
            12 => Tag::StaticString,
            13 => Tag::LongString,
            14 => Tag::Path,
            15 => Tag::Attrs,
            16 => Tag::List0,
            17 => Tag::List1,
            18 => Tag::List2,
            19 => Tag::ListN,
            20 => Tag::Thunk,
            21 => Tag::Blackhole,
            22 => Tag::App,
            23 => Tag::PrimOpApp,
            24 => Tag::Lambda,
            25 => Tag::PrimOp,
            26 => Tag::Float,
            _ => return None,
        })
    }

    /// True for the fixed-layout value family (`Int..=Float`).
    #[inline]
    pub fn is_value(self) -> bool {
        (Tag::Int as u8..=Tag::Float as u8).contains(&(self as u8))
    }
}

/// One-word object header.
///
/// Bit layout, all fields disjoint:
///
/// ```text
/// bits 0..8   tag (u8 discriminant)
/// bit  8      mark bit, cleared by every sweep
/// bit  9      padding bit: one absorbed word the allocator could not split off
/// bits 16..   misc, a tag-dependent small integer
/// ```
///
/// Interior mutability lets the collector flip the mark bit through shared
/// references while raw pointers into arena memory stay the only handle the
/// mutator holds.
#[repr(transparent)]
pub struct Header(Cell<Word>);

const TAG_MASK: Word = 0xff;
const MARK_BIT: Word = 1 << 8;
const PAD_BIT: Word = 1 << 9;
const MISC_SHIFT: u32 = 16;

impl Header {
    /// A header with the given tag and misc, mark and padding clear.
    pub fn new(tag: Tag, misc: Word) -> Self {
        Header(Cell::new((tag as Word) | (misc << MISC_SHIFT)))
    }

    /// The raw tag byte, valid or not.
    #[inline]
    pub fn raw_tag(&self) -> u8 {
        (self.0.get() & TAG_MASK) as u8
    }

    /// The decoded tag, or `None` if the header byte is not a known tag.
    #[inline]
    pub fn tag(&self) -> Option<Tag> {
        Tag::from_u8(self.raw_tag())
    }

    /// Rewrite the tag, preserving every other field.
    #[inline]
    pub fn set_tag(&self, tag: Tag) {
        self.0.set((self.0.get() & !TAG_MASK) | tag as Word);
    }

    /// Whether the mark bit is set.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.0.get() & MARK_BIT != 0
    }

    /// Set the mark bit.
    #[inline]
    pub fn mark(&self) {
        self.0.set(self.0.get() | MARK_BIT);
    }

    /// Clear the mark bit.
    #[inline]
    pub fn unmark(&self) {
        self.0.set(self.0.get() & !MARK_BIT);
    }

    /// The tag-dependent misc field.
    #[inline]
    pub fn misc(&self) -> Word {
        self.0.get() >> MISC_SHIFT
    }

    /// Rewrite misc, preserving tag, mark and padding.
    #[inline]
    pub fn set_misc(&self, misc: Word) {
        debug_assert!(misc <= Word::MAX >> MISC_SHIFT, "misc out of range");
        self.0.set((self.0.get() & ((1 << MISC_SHIFT) - 1)) | (misc << MISC_SHIFT));
    }

    /// Replace the whole header word: fresh tag and misc, mark and padding
    /// clear.
    #[inline]
    pub(crate) fn overwrite(&self, tag: Tag, misc: Word) {
        self.0.set((tag as Word) | (misc << MISC_SHIFT));
    }

    /// Absorbed trailing words (0 or 1).
    #[inline]
    pub(crate) fn padding(&self) -> usize {
        usize::from(self.0.get() & PAD_BIT != 0)
    }

    #[inline]
    pub(crate) fn set_padding(&self, pad: usize) {
        debug_assert!(pad <= 1, "padding is at most one word");
        if pad == 0 {
            self.0.set(self.0.get() & !PAD_BIT);
        } else {
            self.0.set(self.0.get() | PAD_BIT);
        }
    }
}

/// The context word of a [`Tag::LongString`], surfaced as a sum type.
///
/// The low bit of the raw word distinguishes an inline immediate (LSB set)
/// from a heap pointer to a [`Tag::Context`] object (LSB clear, possibly
/// null). Arena alignment keeps the low bit of every object pointer clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringContext {
    /// Immediate encoding carried directly in the context word.
    Inline(Word),
    /// Pointer to a heap context object; null means no context.
    Heap(*mut Header),
}

impl StringContext {
    /// Decode a raw context word.
    #[inline]
    pub fn decode(word: Word) -> Self {
        if word & 1 == 1 {
            StringContext::Inline(word >> 1)
        } else {
            StringContext::Heap(word as *mut Header)
        }
    }

    /// Encode back into a raw context word.
    #[inline]
    pub fn encode(self) -> Word {
        match self {
            StringContext::Inline(v) => {
                debug_assert!(v <= Word::MAX >> 1, "inline context out of range");
                (v << 1) | 1
            }
            StringContext::Heap(p) => {
                debug_assert!(p as Word & 1 == 0, "misaligned context pointer");
                p as Word
            }
        }
    }
}

/// Words needed for a [`Tag::String`] of `byte_len` payload bytes.
#[inline]
pub fn string_words(byte_len: usize) -> usize {
    (1 + byte_len.div_ceil(WORD_SIZE)).max(MIN_OBJECT_WORDS)
}

/// Words needed for a [`Tag::Context`] of `entries` payload words.
#[inline]
pub fn context_words(entries: usize) -> usize {
    (1 + entries).max(MIN_OBJECT_WORDS)
}

/// Words needed for a [`Tag::Bindings`] table of `count` attributes.
#[inline]
pub fn bindings_words(count: usize) -> usize {
    (1 + 2 * count).max(MIN_OBJECT_WORDS)
}

/// Words needed for a [`Tag::ValueList`] of `count` elements.
#[inline]
pub fn value_list_words(count: usize) -> usize {
    (1 + count).max(MIN_OBJECT_WORDS)
}

/// Words needed for an environment frame with `slots` value slots.
#[inline]
pub fn env_words(slots: usize) -> usize {
    2 + slots
}

/// A misc value that makes [`object_words`] report `words` for `tag`.
///
/// Freshly allocated headers carry this so the heap stays walkable between
/// allocation and the caller's own initialization; callers refine misc
/// afterwards as long as the reported size does not change.
pub(crate) fn initial_misc(tag: Tag, words: usize) -> Word {
    debug_assert!(words >= MIN_OBJECT_WORDS);
    if tag.is_value() {
        debug_assert_eq!(words, VALUE_WORDS, "value objects have a fixed size");
        return 0;
    }
    match tag {
        Tag::Free => words,
        Tag::String => (words - 1) * WORD_SIZE,
        Tag::Context | Tag::ValueList => words - 1,
        Tag::Bindings => (words - 1) / 2,
        Tag::Env | Tag::WithExprEnv | Tag::WithAttrsEnv => words - 2,
        _ => unreachable!("value tags are handled by the range check"),
    }
}

/// Pointer to payload word `index` of an object.
///
/// # Safety
/// `obj` must point at a live header whose payload spans at least
/// `index + 1` words.
#[inline]
pub unsafe fn payload_ptr(obj: *const Header, index: usize) -> *mut Word {
    unsafe { (obj as *mut Word).add(1 + index) }
}

/// Read payload word `index`.
///
/// # Safety
/// Same as [`payload_ptr`]; the word must have been initialized.
#[inline]
pub unsafe fn read_field(obj: *const Header, index: usize) -> Word {
    unsafe { payload_ptr(obj, index).read() }
}

/// Write payload word `index`.
///
/// # Safety
/// Same as [`payload_ptr`].
#[inline]
pub unsafe fn write_field(obj: *const Header, index: usize, value: Word) {
    unsafe { payload_ptr(obj, index).write(value) }
}

/// Read payload word `index` as an object pointer.
///
/// # Safety
/// Same as [`read_field`].
#[inline]
pub unsafe fn read_child(obj: *const Header, index: usize) -> *mut Header {
    unsafe { read_field(obj, index) as *mut Header }
}

/// Write an object pointer into payload word `index`.
///
/// # Safety
/// Same as [`payload_ptr`].
#[inline]
pub unsafe fn write_child(obj: *const Header, index: usize, child: *mut Header) {
    unsafe { write_field(obj, index, child as Word) }
}

/// Total size of the object at `obj` in words, including the header and any
/// absorbed padding word. This is the step function of the sweep walk.
///
/// Panics on an invalid tag; the heap contains no such header unless the
/// mutator corrupted one.
///
/// # Safety
/// `obj` must point at an initialized header inside a live allocation.
pub unsafe fn object_words(obj: *const Header) -> usize {
    let header = unsafe { &*obj };
    let Some(tag) = header.tag() else {
        panic!("GC encountered invalid object with tag {}", header.raw_tag());
    };
    let words = if tag.is_value() {
        VALUE_WORDS
    } else {
        match tag {
            Tag::Free => header.misc(),
            Tag::String => string_words(header.misc()),
            Tag::Context => context_words(header.misc()),
            Tag::Bindings => bindings_words(header.misc()),
            Tag::ValueList => value_list_words(header.misc()),
            Tag::Env | Tag::WithExprEnv | Tag::WithAttrsEnv => env_words(header.misc()),
            _ => unreachable!("value tags are handled by the range check"),
        }
    };
    words + header.padding()
}

/// Push every out-edge of the object at `obj`, in the fixed per-tag order.
///
/// Null children are pushed as-is; the consumer skips them. Reaching a
/// [`Tag::Free`] header here means a root or an out-edge pointed into
/// reclaimed memory, which is fatal.
///
/// # Safety
/// `obj` must point at an initialized header whose payload fields named by
/// its tag have been initialized by the mutator.
pub unsafe fn trace_children(obj: *const Header, push: &mut dyn FnMut(*mut Header)) {
    let header = unsafe { &*obj };
    let Some(tag) = header.tag() else {
        panic!(
            "don't know how to traverse object at {:p} (tag {})",
            obj,
            header.raw_tag()
        );
    };
    unsafe {
        match tag {
            Tag::Free => panic!("reached a freed object at {obj:p}"),

            Tag::Bindings => {
                for i in 0..header.misc() {
                    push(read_child(obj, 2 * i + 1));
                }
            }

            Tag::ValueList => {
                for i in 0..header.misc() {
                    push(read_child(obj, i));
                }
            }

            Tag::Env => {
                push(read_child(obj, 0));
                for i in 0..header.misc() {
                    push(read_child(obj, 1 + i));
                }
            }

            Tag::WithExprEnv => push(read_child(obj, 0)),

            Tag::WithAttrsEnv => {
                push(read_child(obj, 0));
                push(read_child(obj, 1));
            }

            Tag::LongString => {
                push(read_child(obj, 0));
                // Inline contexts keep their low bit set; see StringContext.
                let context = read_field(obj, 1);
                if context & 1 == 0 {
                    push(context as *mut Header);
                }
            }

            Tag::Path | Tag::Attrs | Tag::ListN | Tag::List1 => push(read_child(obj, 0)),

            Tag::List2 => {
                push(read_child(obj, 0));
                push(read_child(obj, 1));
            }

            Tag::Thunk | Tag::Blackhole => push(read_child(obj, 0)),

            Tag::App | Tag::PrimOpApp => {
                push(read_child(obj, 0));
                push(read_child(obj, 1));
            }

            Tag::Lambda => push(read_child(obj, 0)),

            Tag::String
            | Tag::Context
            | Tag::Int
            | Tag::Bool
            | Tag::Null
            | Tag::ShortString
            | Tag::StaticString
            | Tag::List0
            | Tag::PrimOp
            | Tag::Float => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields_roundtrip() {
        let h = Header::new(Tag::ValueList, 7);
        assert_eq!(h.tag(), Some(Tag::ValueList));
        assert_eq!(h.misc(), 7);
        assert!(!h.is_marked());
        assert_eq!(h.padding(), 0);

        h.mark();
        assert!(h.is_marked());
        assert_eq!(h.tag(), Some(Tag::ValueList));
        assert_eq!(h.misc(), 7);

        h.set_misc(42);
        assert!(h.is_marked());
        assert_eq!(h.misc(), 42);

        h.set_padding(1);
        assert_eq!(h.padding(), 1);
        assert_eq!(h.misc(), 42);

        h.unmark();
        assert!(!h.is_marked());
        assert_eq!(h.padding(), 1);

        h.set_tag(Tag::Free);
        assert_eq!(h.tag(), Some(Tag::Free));
        assert_eq!(h.misc(), 42);
    }

    #[test]
    fn test_tag_roundtrip() {
        for raw in 0..=26u8 {
            let tag = Tag::from_u8(raw).expect("known tag");
            assert_eq!(tag as u8, raw);
        }
        assert_eq!(Tag::from_u8(27), None);
        assert_eq!(Tag::from_u8(255), None);
    }

    #[test]
    fn test_value_family_range() {
        assert!(Tag::Int.is_value());
        assert!(Tag::Float.is_value());
        assert!(Tag::PrimOp.is_value());
        assert!(Tag::List2.is_value());
        assert!(!Tag::Free.is_value());
        assert!(!Tag::Bindings.is_value());
        assert!(!Tag::String.is_value());
        assert!(!Tag::Context.is_value());
    }

    #[test]
    fn test_size_helpers() {
        // Empty payloads still meet the two-word minimum.
        assert_eq!(string_words(0), 2);
        assert_eq!(string_words(1), 2);
        assert_eq!(string_words(WORD_SIZE), 2);
        assert_eq!(string_words(WORD_SIZE + 1), 3);
        assert_eq!(context_words(0), 2);
        assert_eq!(context_words(3), 4);
        assert_eq!(bindings_words(0), 2);
        assert_eq!(bindings_words(2), 5);
        assert_eq!(value_list_words(0), 2);
        assert_eq!(value_list_words(5), 6);
        assert_eq!(env_words(0), 2);
        assert_eq!(env_words(3), 5);
    }

    #[test]
    fn test_string_context_roundtrip() {
        let inline = StringContext::Inline(1234);
        assert_eq!(StringContext::decode(inline.encode()), inline);
        assert_eq!(inline.encode() & 1, 1);

        let null = StringContext::Heap(std::ptr::null_mut());
        assert_eq!(null.encode(), 0);
        assert_eq!(StringContext::decode(0), null);
    }

    // Builds a fake object in a stack buffer; tracing only reads memory.
    fn with_fake_object<R>(
        tag: Tag,
        misc: Word,
        fields: &[Word],
        f: impl FnOnce(*const Header) -> R,
    ) -> R {
        let mut buf = vec![0 as Word; 1 + fields.len()];
        buf[0] = Header::new(tag, misc).0.get();
        buf[1..].copy_from_slice(fields);
        f(buf.as_ptr() as *const Header)
    }

    #[test]
    fn test_trace_list2_order() {
        let a = 0x100 as Word;
        let b = 0x200 as Word;
        with_fake_object(Tag::List2, 0, &[a, b], |obj| {
            let mut seen = Vec::new();
            unsafe { trace_children(obj, &mut |p| seen.push(p as Word)) };
            assert_eq!(seen, vec![a, b]);
        });
    }

    #[test]
    fn test_trace_env_order() {
        let up = 0x100 as Word;
        let v0 = 0x200 as Word;
        let v1 = 0x300 as Word;
        with_fake_object(Tag::Env, 2, &[up, v0, v1], |obj| {
            let mut seen = Vec::new();
            unsafe { trace_children(obj, &mut |p| seen.push(p as Word)) };
            assert_eq!(seen, vec![up, v0, v1]);
        });
        // A with-expression frame exposes only its parent.
        with_fake_object(Tag::WithExprEnv, 2, &[up, v0, v1], |obj| {
            let mut seen = Vec::new();
            unsafe { trace_children(obj, &mut |p| seen.push(p as Word)) };
            assert_eq!(seen, vec![up]);
        });
    }

    #[test]
    fn test_trace_long_string_skips_inline_context() {
        let body = 0x100 as Word;
        let inline = StringContext::Inline(7).encode();
        with_fake_object(Tag::LongString, 0, &[body, inline], |obj| {
            let mut seen = Vec::new();
            unsafe { trace_children(obj, &mut |p| seen.push(p as Word)) };
            assert_eq!(seen, vec![body]);
        });

        let heap_ctx = 0x200 as Word;
        with_fake_object(Tag::LongString, 0, &[body, heap_ctx], |obj| {
            let mut seen = Vec::new();
            unsafe { trace_children(obj, &mut |p| seen.push(p as Word)) };
            assert_eq!(seen, vec![body, heap_ctx]);
        });
    }

    #[test]
    fn test_trace_leaves_have_no_edges() {
        for tag in [Tag::Int, Tag::Bool, Tag::Null, Tag::Float, Tag::List0, Tag::PrimOp] {
            with_fake_object(tag, 0, &[0xdead, 0xbeef], |obj| {
                let mut count = 0;
                unsafe { trace_children(obj, &mut |_| count += 1) };
                assert_eq!(count, 0, "{tag:?} must not trace");
            });
        }
    }

    #[test]
    #[should_panic(expected = "reached a freed object")]
    fn test_trace_free_is_fatal() {
        with_fake_object(Tag::Free, 2, &[0], |obj| {
            unsafe { trace_children(obj, &mut |_| {}) };
        });
    }

    #[test]
    fn test_object_words_includes_padding() {
        with_fake_object(Tag::Int, 0, &[0, 0], |obj| {
            assert_eq!(unsafe { object_words(obj) }, VALUE_WORDS);
            unsafe { (*obj).set_padding(1) };
            assert_eq!(unsafe { object_words(obj) }, VALUE_WORDS + 1);
        });
    }
}
