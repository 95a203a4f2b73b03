//! object.rs — the heap: every allocation a program creates lives here,
//! addressed by [`GcRef`] handles rather than raw pointers.
//!
//! `spec.md`'s design notes call for "a single indirection (heap-managed
//! index or pointer) rather than embedding sub-objects" for ownership
//! languages; `GcRef` is that indirection. The heap itself is a `Vec`
//! of slots threaded into a free list on deallocation, which stands in
//! for clox's intrusive `obj->next` linked list — both let sweep walk
//! every live allocation in one pass.

use std::fmt;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A handle to a heap object. Two `GcRef`s are equal iff they name the
/// same slot — this is the "pointer identity" the language's string
/// interning and `Value` equality rely on.
///
/// The serde impl serializes only the raw slot index; deserializing a
/// `GcRef` produced by a different `Heap` is meaningless on its own —
/// a `Chunk` dumped this way is only valid alongside the heap it was
/// compiled against.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

impl GcRef {
    pub(crate) fn from_raw(index: u32) -> Self {
        GcRef(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A callable implemented in the host language. `clock` and `input` are
/// registered this way by the driver, never hardcoded in the VM. Takes
/// the heap by mutable reference so a native that needs to hand back a
/// heap object (`input`'s line, say) can intern it itself.
pub type NativeFn = std::rc::Rc<dyn Fn(&mut Heap, &[Value]) -> Result<Value, String>>;

pub struct StrObj {
    pub hash: u32,
    pub chars: String,
}

pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u8,
    /// `None` for the implicit top-level script function.
    pub name: Option<GcRef>,
    pub chunk: Chunk,
}

#[derive(Clone, Copy)]
pub enum UpvalueLocation {
    /// Points at `stack[index]`; still lives on the VM's value stack.
    Open(usize),
    /// The variable outlived its stack slot; the value now lives here.
    Closed(Value),
}

pub struct UpvalueObj {
    pub location: UpvalueLocation,
}

pub struct ClosureObj {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>,
}

pub struct ClassObj {
    pub name: GcRef,
    pub methods: Table,
    /// Cached `init` closure, if any, looked up once at class-build time
    /// so `CALL` on a class doesn't re-probe the method table per
    /// instantiation.
    pub initializer: Option<Value>,
}

pub struct InstanceObj {
    pub class: GcRef,
    pub fields: Table,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: GcRef,
}

/// Not in the normative clox object model; grounded in `SPEC_FULL.md`'s
/// decision to implement the bytecode table's `ARRAY`/`GET_INDEX`/
/// `SET_INDEX` trio despite their "optional" label.
pub struct ArrayObj {
    pub items: Vec<Value>,
}

pub enum Obj {
    Str(StrObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Array(ArrayObj),
}

pub struct NativeObj {
    pub name: GcRef,
    pub arity: Option<u8>,
    pub func: NativeFn,
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "native",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::Array(_) => "array",
        }
    }

    /// Rough byte cost used to drive the GC's heap-growth trigger.
    fn approx_size(&self) -> usize {
        match self {
            Obj::Str(s) => std::mem::size_of::<StrObj>() + s.chars.len(),
            Obj::Function(f) => std::mem::size_of::<FunctionObj>() + f.chunk.code.len() * 2,
            Obj::Closure(c) => std::mem::size_of::<ClosureObj>() + c.upvalues.len() * 4,
            Obj::Upvalue(_) => std::mem::size_of::<UpvalueObj>(),
            Obj::Native(_) => std::mem::size_of::<NativeObj>(),
            Obj::Class(c) => std::mem::size_of::<ClassObj>() + c.methods.len() * 16,
            Obj::Instance(i) => std::mem::size_of::<InstanceObj>() + i.fields.len() * 16,
            Obj::BoundMethod(_) => std::mem::size_of::<BoundMethodObj>(),
            Obj::Array(a) => std::mem::size_of::<ArrayObj>() + a.items.len() * 16,
        }
    }
}

struct HeapEntry {
    marked: bool,
    obj: Obj,
}

enum Slot {
    Occupied(HeapEntry),
    Free(Option<u32>),
}

#[derive(Clone)]
enum InternSlot {
    Empty,
    Tombstone,
    Occupied { hash: u32, ptr: GcRef },
}

/// The weak set of interned strings. Probing compares by *content*
/// (hash, length, bytes) rather than identity — that is precisely how
/// `intern` discovers whether a byte sequence has already been
/// allocated, per `table_find_string` in `spec.md` §4.6.
struct InternTable {
    entries: Vec<InternSlot>,
    count: usize,
}

impl InternTable {
    fn new() -> Self {
        Self { entries: Vec::new(), count: 0 }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, slots: &[Slot], hash: u32, s: &str) -> Option<GcRef> {
        if self.capacity() == 0 {
            return None;
        }
        let mut index = (hash as usize) & (self.capacity() - 1);
        loop {
            match &self.entries[index] {
                InternSlot::Empty => return None,
                InternSlot::Tombstone => {}
                InternSlot::Occupied { hash: h, ptr } => {
                    if *h == hash {
                        if let Slot::Occupied(entry) = &slots[ptr.index()] {
                            if let Obj::Str(so) = &entry.obj {
                                if so.chars == s {
                                    return Some(*ptr);
                                }
                            }
                        }
                    }
                }
            }
            index = (index + 1) & (self.capacity() - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![InternSlot::Empty; new_capacity];
        for slot in self.entries.drain(..) {
            if let InternSlot::Occupied { hash, ptr } = slot {
                let mut index = (hash as usize) & (new_capacity - 1);
                loop {
                    if matches!(new_entries[index], InternSlot::Empty) {
                        new_entries[index] = InternSlot::Occupied { hash, ptr };
                        break;
                    }
                    index = (index + 1) & (new_capacity - 1);
                }
            }
        }
        self.entries = new_entries;
    }

    fn insert(&mut self, hash: u32, ptr: GcRef) {
        if self.capacity() == 0 || (self.count + 1) as f64 > self.capacity() as f64 * 0.75 {
            let new_cap = if self.capacity() == 0 { 8 } else { self.capacity() * 2 };
            self.grow(new_cap);
        }
        let mut index = (hash as usize) & (self.capacity() - 1);
        loop {
            match &self.entries[index] {
                InternSlot::Empty | InternSlot::Tombstone => {
                    self.entries[index] = InternSlot::Occupied { hash, ptr };
                    self.count += 1;
                    return;
                }
                InternSlot::Occupied { .. } => {}
            }
            index = (index + 1) & (self.capacity() - 1);
        }
    }

    /// Drops entries whose string is unmarked, called right before sweep
    /// frees the underlying objects — otherwise the interner would keep
    /// pointing at freed slots.
    fn remove_white(&mut self, slots: &[Slot]) {
        for entry in &mut self.entries {
            if let InternSlot::Occupied { ptr, .. } = entry {
                let alive = matches!(&slots[ptr.index()], Slot::Occupied(e) if e.marked);
                if !alive {
                    *entry = InternSlot::Tombstone;
                }
            }
        }
    }
}

pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The object heap: allocation, string interning, and the mark/sweep
/// primitives the collector in [`crate::gc`] drives.
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    strings: InternTable,
    pub bytes_allocated: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_head: None, strings: InternTable::new(), bytes_allocated: 0 }
    }

    fn insert(&mut self, obj: Obj) -> GcRef {
        self.bytes_allocated += obj.approx_size();
        let entry = HeapEntry { marked: false, obj };
        match self.free_head {
            Some(idx) => {
                let next_free = match &self.slots[idx as usize] {
                    Slot::Free(next) => *next,
                    Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.free_head = next_free;
                self.slots[idx as usize] = Slot::Occupied(entry);
                GcRef::from_raw(idx)
            }
            None => {
                self.slots.push(Slot::Occupied(entry));
                GcRef::from_raw((self.slots.len() - 1) as u32)
            }
        }
    }

    fn alloc(&mut self, obj: Obj) -> GcRef {
        self.insert(obj)
    }

    pub fn alloc_function(&mut self, f: FunctionObj) -> GcRef {
        self.alloc(Obj::Function(f))
    }

    pub fn alloc_closure(&mut self, c: ClosureObj) -> GcRef {
        self.alloc(Obj::Closure(c))
    }

    pub fn alloc_upvalue(&mut self, u: UpvalueObj) -> GcRef {
        self.alloc(Obj::Upvalue(u))
    }

    pub fn alloc_native(&mut self, n: NativeObj) -> GcRef {
        self.alloc(Obj::Native(n))
    }

    pub fn alloc_class(&mut self, c: ClassObj) -> GcRef {
        self.alloc(Obj::Class(c))
    }

    pub fn alloc_instance(&mut self, i: InstanceObj) -> GcRef {
        self.alloc(Obj::Instance(i))
    }

    pub fn alloc_bound_method(&mut self, b: BoundMethodObj) -> GcRef {
        self.alloc(Obj::BoundMethod(b))
    }

    pub fn alloc_array(&mut self, a: ArrayObj) -> GcRef {
        self.alloc(Obj::Array(a))
    }

    /// Interns `s`, allocating a new `Str` object only if no equal
    /// string already exists. Equal-bytes strings compiled anywhere in
    /// the program always resolve to the same `GcRef`.
    pub fn intern_str(&mut self, s: &str) -> GcRef {
        let hash = fnv1a_32(s.as_bytes());
        if let Some(existing) = self.strings.find(&self.slots, hash, s) {
            return existing;
        }
        let ptr = self.insert(Obj::Str(StrObj { hash, chars: s.to_owned() }));
        self.strings.insert(hash, ptr);
        ptr
    }

    pub fn get(&self, r: GcRef) -> &Obj {
        match &self.slots[r.index()] {
            Slot::Occupied(e) => &e.obj,
            Slot::Free(_) => panic!("dangling GcRef {r}: slot has been freed"),
        }
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Slot::Occupied(e) => &mut e.obj,
            Slot::Free(_) => panic!("dangling GcRef {r}: slot has been freed"),
        }
    }

    pub fn as_str(&self, r: GcRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.chars,
            other => panic!("GcRef {r} is a {}, not a string", other.type_name()),
        }
    }

    pub fn string_hash(&self, r: GcRef) -> u32 {
        match self.get(r) {
            Obj::Str(s) => s.hash,
            other => panic!("GcRef {r} is a {}, not a string", other.type_name()),
        }
    }

    pub fn is_marked(&self, r: GcRef) -> bool {
        matches!(&self.slots[r.index()], Slot::Occupied(e) if e.marked)
    }

    /// Marks `r` grey. Returns `true` if this object was previously
    /// white (the caller should then blacken it by tracing its edges).
    pub fn mark(&mut self, r: GcRef) -> bool {
        match &mut self.slots[r.index()] {
            Slot::Occupied(e) => {
                let was_white = !e.marked;
                e.marked = true;
                was_white
            }
            Slot::Free(_) => false,
        }
    }

    /// Drops interned strings not reachable this cycle, then frees every
    /// unmarked object and clears marks on survivors. Returns bytes freed.
    pub fn sweep(&mut self) -> usize {
        self.strings.remove_white(&self.slots);

        let mut freed = 0usize;
        for i in 0..self.slots.len() {
            match &self.slots[i] {
                Slot::Occupied(e) if !e.marked => {
                    freed += e.obj.approx_size();
                    self.slots[i] = Slot::Free(self.free_head);
                    self.free_head = Some(i as u32);
                }
                Slot::Occupied(_) => {
                    if let Slot::Occupied(e) = &mut self.slots[i] {
                        e.marked = false;
                    }
                }
                Slot::Free(_) => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        freed
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied(_))).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern_str("hello");
        let b = heap.intern_str("hello");
        let c = heap.intern_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sweep_frees_unmarked_and_clears_marks() {
        let mut heap = Heap::new();
        let a = heap.intern_str("keep");
        let b = heap.intern_str("drop");
        heap.mark(a);
        heap.sweep();
        assert!(heap.is_marked(a) == false); // marks cleared post-sweep
        assert_eq!(heap.live_count(), 1);
        // re-interning "drop" must allocate fresh since it was freed
        let b2 = heap.intern_str("drop");
        assert_ne!(b, b2);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.intern_str("a");
        heap.sweep(); // a unmarked -> freed
        let count_before = heap.live_count();
        assert_eq!(count_before, 0);
        let _b = heap.intern_str("b");
        // reused slot 0 rather than growing the backing Vec
        assert_eq!(heap.live_count(), 1);
        let _ = a;
    }
}
