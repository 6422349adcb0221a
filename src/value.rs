// The value heap.
//
// Values live in one machine word. If the low bit of the word is set, the
// value is packed directly into the word: small structs and unions are
// encoded as a bit string and never touch the heap. Otherwise the word
// refers to a heap object, or is the distinguished undefined value used for
// recursive-definition holes and error propagation.
//
// Heap objects are allocated to frames. A frame is one function
// activation's slice of the heap: objects expected to die with the frame
// are "stack" allocated and vanish wholesale when the frame pops. Objects
// that escape (returned values, tail-call arguments, reference cells) are
// promoted to GC allocations, which are collected incrementally, a bounded
// amount of work per allocation, using per-frame generation windows.
//
// The frame stack also carries the tail-call protocol: a run function that
// wants to tail call writes the callee and arguments into the heap's
// tail-call buffer and returns a marker; the caller compacts the frame in
// place and dispatches the buffered call. See the function module.

use std::any::Any;
use std::sync::Arc;

use crate::function::{Executable, Function};
use crate::profile::BlockId;


// A value, packed into one word or referring to a heap object.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Value(u64);


// The distinguished undefined value: a hole in a recursive definition, or
// the result of an aborted computation.
pub const UNDEFINED: Value = Value(0);

// The value of every type. Packed identically to the zero-argument struct
// value so it can be packed alongside struct and union values.
pub const GENERIC_TYPE: Value = Value(1);

// Returned by union_field when the union holds a different tag than the
// one accessed. Distinct from every real value and from UNDEFINED.
pub const WRONG_UNION_TAG: Value = Value(2);


impl Value {
    pub fn is_undefined(self) -> bool {
        self.0 == 0
    }

    fn is_packed(self) -> bool {
        self.0 & 1 == 1
    }

    // Unpacked and not undefined: refers to a heap object.
    fn is_alloced(self) -> bool {
        !self.is_packed() && self.0 != 0 && self != WRONG_UNION_TAG
    }

    fn slot(self) -> usize {
        debug_assert!(self.is_alloced());
        (self.0 >> 1) as usize - 2
    }

    fn from_slot(slot: usize) -> Value {
        Value(((slot as u64) + 2) << 1)
    }
}


// Number of bits used by the packed value in the low bits of data, not
// counting the pack marker.
fn packed_value_length(data: u64) -> u32 {
    let mut data = data;
    let mut len = 0;
    if data & 1 == 0 {
        // Struct value.
        data >>= 1;
        len += 1;
        let mut argc = 0;
        while data & 1 == 1 {
            data >>= 1;
            len += 1;
            argc += 1;
        }
        data >>= 1;
        len += 1;

        for _ in 0..argc {
            let arglen = packed_value_length(data);
            data >>= arglen;
            len += arglen;
        }
        len
    } else {
        // Union value.
        data >>= 1;
        len += 1;
        while data & 1 == 1 {
            data >>= 1;
            len += 1;
        }
        data >>= 1;
        len += 1;
        len + packed_value_length(data)
    }
}


// Which GC list an object is on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ListId {
    HeapMarked,
    HeapUnmarked,
    HeapFree,
    FrameUnmarked(usize),
    FrameMarked(usize),
    FrameAlloced(usize),
}


// A doubly linked list of GC objects, threaded through the objects.
#[derive(Copy, Clone, Debug, Default)]
struct GcList {
    head: Option<usize>,
    tail: Option<usize>,
}


// Allocation header for a heap object.
#[derive(Debug)]
enum Alloc {
    // Stack allocated to the given frame. fwd is the GC twin of this
    // object, once the object has been promoted.
    Stack { frame: usize, fwd: Option<Value> },

    // GC allocated, threaded onto one of the GC lists.
    Gc { gen: u64, list: ListId, prev: Option<usize>, next: Option<usize> },
}


enum ObjData {
    Struct { fields: Vec<Value> },
    Union { tag: usize, arg: Value },
    Func { function: Function },
    Ref { value: Value },
    Native { data: Box<dyn Any> },
}


struct Obj {
    alloc: Alloc,
    data: ObjData,
}


// One activation's slice of the heap.
struct Frame {
    // Number of calls sharing this frame instead of pushing their own.
    merges: usize,

    // Objects allocated before entering this frame have generation less
    // than min_gen; objects allocated before the most recent compaction
    // have generation less than gen.
    min_gen: u64,
    gen: u64,

    // Potential garbage: objects inherited from popped callee frames or
    // left behind by compaction.
    unmarked: GcList,
    marked: GcList,

    // Other GC objects allocated to this frame.
    alloced: GcList,

    // Stack allocations owned by this frame, reclaimed wholesale on pop or
    // compaction.
    stack_objs: Vec<usize>,
}


impl Frame {
    fn new(gen: u64) -> Frame {
        Frame {
            merges: 0,
            min_gen: gen,
            gen,
            unmarked: GcList::default(),
            marked: GcList::default(),
            alloced: GcList::default(),
            stack_objs: Vec::new(),
        }
    }
}


pub struct ValueHeap {
    objs: Vec<Option<Obj>>,
    free_slots: Vec<usize>,

    // The frame stack. The last element is the top frame, where new values
    // are allocated.
    frames: Vec<Frame>,

    // The generation to allocate new objects to.
    gen: u64,

    // The frame whose potential garbage is being collected, and the next
    // frame scheduled for collection.
    gc: usize,
    next_gc: Option<usize>,

    // Objects being traversed in the current collection. These belong to
    // the gc frame.
    marked: GcList,
    unmarked: GcList,

    // Garbage waiting to be freed.
    free: GcList,

    // The tail-call buffer: callee at index 0, arguments after. Only live
    // between a run function returning Exec::TailCall and the caller
    // consuming the call.
    pub(crate) tail_call: Vec<Value>,
}


impl ValueHeap {
    pub fn new() -> ValueHeap {
        ValueHeap {
            objs: Vec::new(),
            free_slots: Vec::new(),
            frames: vec![Frame::new(0)],
            gen: 0,
            gc: 0,
            next_gc: None,
            marked: GcList::default(),
            unmarked: GcList::default(),
            free: GcList::default(),
            tail_call: Vec::new(),
        }
    }

    fn top(&self) -> usize {
        self.frames.len() - 1
    }

    // ---- list plumbing ----

    fn list(&mut self, id: ListId) -> &mut GcList {
        match id {
            ListId::HeapMarked => &mut self.marked,
            ListId::HeapUnmarked => &mut self.unmarked,
            ListId::HeapFree => &mut self.free,
            ListId::FrameUnmarked(f) => &mut self.frames[f].unmarked,
            ListId::FrameMarked(f) => &mut self.frames[f].marked,
            ListId::FrameAlloced(f) => &mut self.frames[f].alloced,
        }
    }

    fn links(&mut self, slot: usize) -> (&mut ListId, &mut Option<usize>, &mut Option<usize>) {
        match &mut self.objs[slot].as_mut().unwrap().alloc {
            Alloc::Gc { list, prev, next, .. } => (list, prev, next),
            Alloc::Stack { .. } => unreachable!("stack object on a GC list"),
        }
    }

    fn detach(&mut self, slot: usize) {
        let (list, prev, next) = {
            let (l, p, n) = self.links(slot);
            (*l, *p, *n)
        };
        match prev {
            Some(p) => *self.links(p).2 = next,
            None => self.list(list).head = next,
        }
        match next {
            Some(n) => *self.links(n).1 = prev,
            None => self.list(list).tail = prev,
        }
        let (_, p, n) = self.links(slot);
        *p = None;
        *n = None;
    }

    fn push_list(&mut self, id: ListId, slot: usize) {
        let head = self.list(id).head;
        {
            let (list, prev, next) = self.links(slot);
            *list = id;
            *prev = None;
            *next = head;
        }
        match head {
            Some(h) => *self.links(h).1 = Some(slot),
            None => self.list(id).tail = Some(slot),
        }
        self.list(id).head = Some(slot);
    }

    fn move_to(&mut self, id: ListId, slot: usize) {
        self.detach(slot);
        self.push_list(id, slot);
    }

    fn pop_list(&mut self, id: ListId) -> Option<usize> {
        let head = self.list(id).head?;
        self.detach(head);
        Some(head)
    }

    fn move_all(&mut self, dst: ListId, src: ListId) {
        while let Some(slot) = self.pop_list(src) {
            self.push_list(dst, slot);
        }
    }

    // ---- allocation ----

    fn alloc_slot(&mut self, obj: Obj) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.objs[slot] = Some(obj);
                slot
            }
            None => {
                self.objs.push(Some(obj));
                self.objs.len() - 1
            }
        }
    }

    fn free_obj(&mut self, slot: usize) {
        self.objs[slot] = None;
        self.free_slots.push(slot);
    }

    // Allocate a value to the top frame of the stack.
    fn new_stack_value(&mut self, data: ObjData) -> Value {
        let frame = self.top();
        let slot = self.alloc_slot(Obj {
            alloc: Alloc::Stack { frame, fwd: None },
            data,
        });
        self.frames[frame].stack_objs.push(slot);
        Value::from_slot(slot)
    }

    // Allocate a GC value to the given frame.
    fn new_gc_value(&mut self, frame: usize, data: ObjData) -> Value {
        self.incr_gc();

        let gen = self.frames[frame].gen;
        let slot = self.alloc_slot(Obj {
            alloc: Alloc::Gc {
                gen,
                list: ListId::FrameAlloced(frame),
                prev: None,
                next: None,
            },
            data,
        });
        self.push_list(ListId::FrameAlloced(frame), slot);
        Value::from_slot(slot)
    }

    fn obj(&self, value: Value) -> &Obj {
        self.objs[value.slot()].as_ref().unwrap()
    }

    fn gc_gen(&self, value: Value) -> Option<u64> {
        match self.obj(value).alloc {
            Alloc::Gc { gen, .. } => Some(gen),
            Alloc::Stack { .. } => None,
        }
    }

    // Reallocate a value onto the GC heap. Promotion is memoized through
    // the stack header's forward pointer, so shared structure stays shared.
    fn gc_realloc(&mut self, value: Value) -> Value {
        if !value.is_alloced() {
            return value;
        }

        let frame = match &self.obj(value).alloc {
            Alloc::Gc { .. } => return value,
            Alloc::Stack { fwd: Some(fwd), .. } => return *fwd,
            Alloc::Stack { frame, fwd: None } => *frame,
        };

        match &self.obj(value).data {
            ObjData::Struct { fields } => {
                let fields = fields.clone();
                let twin = self.new_gc_value(
                    frame,
                    ObjData::Struct { fields: vec![UNDEFINED; fields.len()] },
                );
                self.set_fwd(value, twin);
                for (i, field) in fields.iter().enumerate() {
                    let promoted = self.gc_realloc(*field);
                    match &mut self.objs[twin.slot()].as_mut().unwrap().data {
                        ObjData::Struct { fields } => fields[i] = promoted,
                        _ => unreachable!(),
                    }
                }
                twin
            }

            ObjData::Union { tag, arg } => {
                let (tag, arg) = (*tag, *arg);
                let twin =
                    self.new_gc_value(frame, ObjData::Union { tag, arg: UNDEFINED });
                self.set_fwd(value, twin);
                let promoted = self.gc_realloc(arg);
                match &mut self.objs[twin.slot()].as_mut().unwrap().data {
                    ObjData::Union { arg, .. } => *arg = promoted,
                    _ => unreachable!(),
                }
                twin
            }

            ObjData::Func { function } => {
                let function = function.clone();
                let twin = self.new_gc_value(
                    frame,
                    ObjData::Func {
                        function: Function {
                            executable: Arc::clone(&function.executable),
                            profile_block_id: function.profile_block_id,
                            statics: vec![UNDEFINED; function.statics.len()],
                        },
                    },
                );
                self.set_fwd(value, twin);
                for (i, static_) in function.statics.iter().enumerate() {
                    let promoted = self.gc_realloc(*static_);
                    match &mut self.objs[twin.slot()].as_mut().unwrap().data {
                        ObjData::Func { function } => function.statics[i] = promoted,
                        _ => unreachable!(),
                    }
                }
                twin
            }

            // Refs and natives are GC allocated from birth.
            ObjData::Ref { .. } => unreachable!("stack allocated ref value"),
            ObjData::Native { .. } => unreachable!("stack allocated native value"),
        }
    }

    fn set_fwd(&mut self, value: Value, twin: Value) {
        match &mut self.objs[value.slot()].as_mut().unwrap().alloc {
            Alloc::Stack { fwd, .. } => *fwd = Some(twin),
            Alloc::Gc { .. } => unreachable!(),
        }
    }

    // ---- incremental GC ----

    // Mark a GC object referenced from an object in the gc frame's window.
    fn mark_ref(&mut self, dst: Value) {
        if !dst.is_alloced() {
            return;
        }
        if let Some(gen) = self.gc_gen(dst) {
            let frame = &self.frames[self.gc];
            if gen >= frame.min_gen && gen != frame.gen {
                self.move_to(ListId::HeapMarked, dst.slot());
            }
        }
    }

    fn mark_refs(&mut self, slot: usize) {
        let children: Vec<Value> = match &self.objs[slot].as_ref().unwrap().data {
            ObjData::Struct { fields } => fields.clone(),
            ObjData::Union { arg, .. } => vec![*arg],
            ObjData::Func { function } => function.statics.clone(),
            ObjData::Ref { value } => vec![*value],
            ObjData::Native { .. } => Vec::new(),
        };
        for child in children {
            self.mark_ref(child);
        }
    }

    // A constant amount of GC work, performed on every GC allocation.
    fn incr_gc(&mut self) {
        // Free a couple objects from the free list.
        for _ in 0..2 {
            if let Some(slot) = self.pop_list(ListId::HeapFree) {
                self.free_obj(slot);
            }
        }

        // Traverse one object.
        if let Some(slot) = self.pop_list(ListId::HeapMarked) {
            let gen = self.frames[self.gc].gen;
            match &mut self.objs[slot].as_mut().unwrap().alloc {
                Alloc::Gc { gen: g, .. } => *g = gen,
                Alloc::Stack { .. } => unreachable!(),
            }
            self.mark_refs(slot);
            // Re-thread onto the gc frame's list of live objects.
            let gc = self.gc;
            self.push_list(ListId::FrameAlloced(gc), slot);
            return;
        }

        // Anything left unmarked is unreachable.
        self.move_all(ListId::HeapFree, ListId::HeapUnmarked);

        // Set up the next collection.
        if let Some(next) = self.next_gc {
            self.gc = next;
            self.next_gc = if next + 1 < self.frames.len() {
                Some(next + 1)
            } else {
                None
            };
            let gc = self.gc;
            self.move_all(ListId::HeapMarked, ListId::FrameMarked(gc));
            self.move_all(ListId::HeapUnmarked, ListId::FrameUnmarked(gc));
        }
    }

    // Run garbage collection to completion. Expensive; intended for tests
    // and debugging.
    pub fn full_gc(&mut self) {
        if self.next_gc.is_none() {
            self.next_gc = Some(0);
        }
        loop {
            let idle = self.free.head.is_none()
                && self.marked.head.is_none()
                && self.unmarked.head.is_none()
                && self.next_gc.is_none();
            if idle {
                return;
            }
            self.incr_gc();
        }
    }

    // Size of the object table, a high-water mark for how many objects
    // were ever live at once.
    pub fn object_slab_size(&self) -> usize {
        self.objs.len()
    }

    // Number of GC allocated objects currently on the heap.
    pub fn gc_object_count(&self) -> usize {
        self.objs
            .iter()
            .filter(|o| matches!(o, Some(Obj { alloc: Alloc::Gc { .. }, .. })))
            .count()
    }

    // ---- frames ----

    pub(crate) fn push_frame(&mut self, merge: bool) {
        if merge {
            let top = self.top();
            self.frames[top].merges += 1;
            return;
        }

        self.gen += 1;
        self.frames.push(Frame::new(self.gen));
        trace!("push frame {} gen {}", self.top(), self.gen);
    }

    // Pop the top frame, promoting value to the caller.
    pub(crate) fn pop_frame(&mut self, value: Value) -> Value {
        let top = self.top();
        if self.frames[top].merges > 0 {
            self.frames[top].merges -= 1;
            return value;
        }

        let value = self.gc_realloc(value);
        let caller = top - 1;

        self.move_all(ListId::FrameUnmarked(caller), ListId::FrameUnmarked(top));
        self.move_all(ListId::FrameUnmarked(caller), ListId::FrameMarked(top));
        self.move_all(ListId::FrameUnmarked(caller), ListId::FrameAlloced(top));

        if self.gc == top {
            // Collection in progress on the popped frame is out of date.
            self.move_all(ListId::FrameUnmarked(caller), ListId::HeapUnmarked);
            self.move_all(ListId::FrameUnmarked(caller), ListId::HeapMarked);
            self.gc = caller;
        }

        if value.is_alloced() {
            if let Some(gen) = self.gc_gen(value) {
                if gen >= self.frames[top].min_gen {
                    self.move_to(ListId::FrameMarked(caller), value.slot());
                }
            }
        }

        let stack_objs = std::mem::take(&mut self.frames[top].stack_objs);
        for slot in stack_objs {
            self.free_obj(slot);
        }
        self.frames.pop();

        match self.next_gc {
            None => self.next_gc = Some(caller),
            Some(next) if next == top => self.next_gc = Some(caller),
            _ => (),
        }

        value
    }

    // Compact the top frame in place, preserving the save values. With
    // merge set there is nothing to compact. If calls are sharing this
    // frame a fresh frame is pushed instead, since the shared portion
    // cannot be reset.
    pub(crate) fn compact_frame(&mut self, merge: bool, save: &mut [Value]) {
        if merge {
            return;
        }

        let top = self.top();
        if self.frames[top].merges > 0 {
            self.frames[top].merges -= 1;
            self.push_frame(false);
            return;
        }

        // Compaction restarts any collection in progress on this frame, so
        // a tail-call loop could otherwise outrun the collector. A fixed
        // extra round of work here keeps collection ahead of the loop.
        self.incr_gc();
        self.incr_gc();

        for s in save.iter_mut() {
            *s = self.gc_realloc(*s);
        }

        self.gen += 1;
        self.frames[top].gen = self.gen;

        let stack_objs = std::mem::take(&mut self.frames[top].stack_objs);
        for slot in stack_objs {
            self.free_obj(slot);
        }

        self.move_all(ListId::FrameUnmarked(top), ListId::FrameMarked(top));
        self.move_all(ListId::FrameUnmarked(top), ListId::FrameAlloced(top));

        if self.gc == top {
            // Abandon the in-progress collection of this frame.
            self.move_all(ListId::FrameUnmarked(top), ListId::HeapUnmarked);
            self.move_all(ListId::FrameUnmarked(top), ListId::HeapMarked);
        }

        for s in save.iter() {
            if s.is_alloced() {
                if let Some(gen) = self.gc_gen(*s) {
                    if gen >= self.frames[top].min_gen {
                        self.move_to(ListId::FrameMarked(top), s.slot());
                    }
                }
            }
        }

        if self.next_gc.is_none() {
            self.next_gc = Some(top);
        }
    }

    // ---- value constructors and accessors ----

    // Remove layers of references from a value. The result is undefined if
    // the value is a reference with no value yet.
    pub fn strict_value(&self, value: Value) -> Value {
        let mut value = value;
        while value.is_alloced() {
            match &self.obj(value).data {
                ObjData::Ref { value: inner } => value = *inner,
                _ => break,
            }
        }
        value
    }

    pub fn new_struct_value(&mut self, args: &[Value]) -> Value {
        // Try packing optimistically.
        let argc = args.len();
        let mut data: u64 = 0;
        let mut num_bits: u32 = 0;
        let mut packable = true;
        for arg in args.iter().rev() {
            if !arg.is_packed() {
                packable = false;
                break;
            }
            let argdata = arg.0 >> 1;
            let arglen = packed_value_length(argdata);
            num_bits += arglen;
            if num_bits + argc as u32 + 1 >= 64 {
                packable = false;
                break;
            }
            data = (data << arglen) | (((1u64 << arglen) - 1) & argdata);
        }

        if packable && num_bits + argc as u32 + 1 < 64 {
            data <<= 1; // arg count terminator
            for _ in 0..argc {
                data = (data << 1) | 1; // unary encoding of arg count
            }
            data = (data << 2) | 1; // struct value and pack markers
            return Value(data);
        }

        self.new_stack_value(ObjData::Struct { fields: args.to_vec() })
    }

    // The given field of a struct value. The caller is expected to have
    // checked the value is defined.
    pub fn struct_field(&self, object: Value, field: usize) -> Value {
        let object = self.strict_value(object);

        if object.is_undefined() {
            return UNDEFINED;
        }

        if object.is_packed() {
            let mut data = object.0;

            // Skip the pack and struct markers.
            data >>= 2;

            // Skip the argument count.
            while data & 1 == 1 {
                data >>= 1;
            }
            data >>= 1;

            // Skip args before the field we want.
            for _ in 0..field {
                data >>= packed_value_length(data);
            }

            return Value((data << 1) | 1);
        }

        match &self.obj(object).data {
            ObjData::Struct { fields } => fields[field],
            _ => unreachable!("struct access on non-struct value"),
        }
    }

    pub fn new_union_value(&mut self, tag: usize, arg: Value) -> Value {
        if arg.is_packed() {
            let data = arg.0 >> 1;
            let len = packed_value_length(data);
            if (len as u64) + (tag as u64) + 1 < 64 {
                let mut data = data << 1; // tag terminator
                for _ in 0..tag {
                    data = (data << 1) | 1; // unary encoded tag
                }
                return Value((data << 2) | 3); // union value and pack markers
            }
        }

        self.new_stack_value(ObjData::Union { tag, arg })
    }

    // A union value whose argument is the unit value.
    pub fn new_enum_value(&mut self, tag: usize) -> Value {
        let unit = self.new_struct_value(&[]);
        self.new_union_value(tag, unit)
    }

    // The tag of a union value, or None if the value is undefined.
    pub fn union_tag(&self, object: Value) -> Option<usize> {
        let object = self.strict_value(object);

        if object.is_undefined() {
            return None;
        }

        if object.is_packed() {
            let mut data = object.0 >> 2;
            let mut tag = 0;
            while data & 1 == 1 {
                tag += 1;
                data >>= 1;
            }
            return Some(tag);
        }

        match &self.obj(object).data {
            ObjData::Union { tag, .. } => Some(*tag),
            _ => unreachable!("union tag of non-union value"),
        }
    }

    // The argument of a union value.
    pub fn union_arg(&self, object: Value) -> Value {
        let object = self.strict_value(object);

        if object.is_undefined() {
            return UNDEFINED;
        }

        if object.is_packed() {
            let mut data = object.0 >> 2;
            while data & 1 == 1 {
                data >>= 1;
            }
            data >>= 1;
            return Value((data << 1) | 1);
        }

        match &self.obj(object).data {
            ObjData::Union { arg, .. } => *arg,
            _ => unreachable!("union arg of non-union value"),
        }
    }

    // The argument of a union value provided it carries the given tag.
    // Returns WRONG_UNION_TAG otherwise, UNDEFINED if the value is
    // undefined.
    pub fn union_field(&self, object: Value, field: usize) -> Value {
        let object = self.strict_value(object);

        if object.is_undefined() {
            return UNDEFINED;
        }

        match self.union_tag(object) {
            Some(tag) if tag == field => self.union_arg(object),
            _ => WRONG_UNION_TAG,
        }
    }

    pub fn new_func_value(
        &mut self,
        executable: Arc<dyn Executable>,
        profile_block_id: BlockId,
        statics: Vec<Value>,
    ) -> Value {
        debug_assert_eq!(executable.num_statics(), statics.len());
        self.new_stack_value(ObjData::Func {
            function: Function { executable, profile_block_id, statics },
        })
    }

    // Function information for a func value, or None if the value is
    // undefined or not a function.
    pub fn func_value_function(&self, value: Value) -> Option<Function> {
        let value = self.strict_value(value);
        if !value.is_alloced() {
            return None;
        }
        match &self.obj(value).data {
            ObjData::Func { function } => Some(function.clone()),
            _ => None,
        }
    }

    // Whether the value is a reference cell (before stripping).
    pub(crate) fn is_ref_value(&self, value: Value) -> bool {
        value.is_alloced() && matches!(self.obj(value).data, ObjData::Ref { .. })
    }

    // The canonical list encoding: tag 0 cons of (head, tail), tag 1 nil
    // of unit.
    pub fn new_list_value(&mut self, args: &[Value]) -> Value {
        let unit = self.new_struct_value(&[]);
        let mut tail = self.new_union_value(1, unit);
        for arg in args.iter().rev() {
            let cons = self.new_struct_value(&[*arg, tail]);
            tail = self.new_union_value(0, cons);
        }
        tail
    }

    // A list of enum values with the given tags.
    pub fn new_literal_value(&mut self, letters: &[usize]) -> Value {
        let unit = self.new_struct_value(&[]);
        let mut tail = self.new_union_value(1, unit);
        for letter in letters.iter().rev() {
            let arg = self.new_union_value(*letter, unit);
            let cons = self.new_struct_value(&[arg, tail]);
            tail = self.new_union_value(0, cons);
        }
        tail
    }

    // A new unset reference cell. Reference cells are GC allocated from
    // birth so assignment can be observed across frames.
    pub fn new_ref_value(&mut self) -> Value {
        let top = self.top();
        self.new_gc_value(top, ObjData::Ref { value: UNDEFINED })
    }

    // Tie the knot of a recursive definition. Returns false if the
    // assignment is vacuous: the value resolves through references back to
    // the cell itself.
    pub fn assign_ref_value(&mut self, ref_: Value, value: Value) -> bool {
        // Unwrap accumulated layers of references on the value.
        let mut value = value;
        while value.is_alloced() {
            match &self.obj(value).data {
                ObjData::Ref { value: inner } if !inner.is_undefined() => value = *inner,
                _ => break,
            }
        }

        if value == ref_ {
            return false;
        }

        match &mut self.objs[ref_.slot()].as_mut().unwrap().data {
            ObjData::Ref { value: slot } => {
                *slot = value;
                true
            }
            _ => unreachable!("ref assignment to non-ref value"),
        }
    }

    // GC tracked native data. Dropped when the object is collected.
    pub fn new_native_value(&mut self, data: Box<dyn Any>) -> Value {
        let top = self.top();
        self.new_gc_value(top, ObjData::Native { data })
    }

    pub fn native_data<T: 'static>(&self, value: Value) -> Option<&T> {
        let value = self.strict_value(value);
        if !value.is_alloced() {
            return None;
        }
        match &self.obj(value).data {
            ObjData::Native { data } => data.downcast_ref::<T>(),
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    // Build and tear down values through the public accessors only, so the
    // tests hold for packed and heap representations alike.

    fn unit(heap: &mut ValueHeap) -> Value {
        heap.new_struct_value(&[])
    }

    #[test]
    fn test_packed_struct_roundtrip() {
        let mut heap = ValueHeap::new();
        let u = unit(&mut heap);
        let a = heap.new_union_value(1, u);
        let b = heap.new_union_value(2, u);
        let s = heap.new_struct_value(&[a, b]);

        assert_eq!(heap.struct_field(s, 0), a);
        assert_eq!(heap.struct_field(s, 1), b);

        // Small structs of packed values stay packed.
        assert_eq!(heap.gc_object_count(), 0);
        assert_eq!(heap.frames[0].stack_objs.len(), 0);
    }

    #[test]
    fn test_packed_union_roundtrip() {
        let mut heap = ValueHeap::new();
        let u = unit(&mut heap);
        for tag in 0..10 {
            let v = heap.new_union_value(tag, u);
            assert_eq!(heap.union_tag(v), Some(tag));
            assert_eq!(heap.union_arg(v), u);
        }
    }

    #[test]
    fn test_packed_rebuild_is_identical() {
        // Rebuilding a packed value from its parts yields the exact same
        // word, not merely an equivalent value.
        let mut heap = ValueHeap::new();
        let u = unit(&mut heap);
        let a = heap.new_union_value(3, u);
        let b = heap.new_union_value(1, a);
        let s = heap.new_struct_value(&[a, b]);

        let tag = heap.union_tag(a).unwrap();
        let arg = heap.union_arg(a);
        assert_eq!(heap.new_union_value(tag, arg), a);

        let f0 = heap.struct_field(s, 0);
        let f1 = heap.struct_field(s, 1);
        assert_eq!(heap.new_struct_value(&[f0, f1]), s);
    }

    #[test]
    fn test_generic_type_packs_like_unit() {
        let mut heap = ValueHeap::new();
        assert_eq!(unit(&mut heap), GENERIC_TYPE);
    }

    #[test]
    fn test_union_field_wrong_tag() {
        let mut heap = ValueHeap::new();
        let u = unit(&mut heap);
        let v = heap.new_union_value(1, u);
        assert_eq!(heap.union_field(v, 1), u);
        assert_eq!(heap.union_field(v, 0), WRONG_UNION_TAG);
        assert_eq!(heap.union_field(UNDEFINED, 0), UNDEFINED);
    }

    #[test]
    fn test_large_struct_goes_to_heap() {
        let mut heap = ValueHeap::new();
        let u = unit(&mut heap);
        let args: Vec<Value> = (0..40).map(|tag| heap.new_union_value(tag, u)).collect();
        let s = heap.new_struct_value(&args);
        for (i, arg) in args.iter().enumerate() {
            assert_eq!(heap.struct_field(s, i), *arg);
        }
    }

    #[test]
    fn test_deeply_nested_packing() {
        // Nesting eventually exceeds one word and falls back to the heap;
        // access must behave identically either way.
        let mut heap = ValueHeap::new();
        let mut v = unit(&mut heap);
        for _ in 0..100 {
            v = heap.new_union_value(0, v);
        }
        for _ in 0..100 {
            assert_eq!(heap.union_tag(v), Some(0));
            v = heap.union_arg(v);
        }
        assert_eq!(v, unit(&mut heap));
    }

    #[test]
    fn test_ref_value() {
        let mut heap = ValueHeap::new();
        let r = heap.new_ref_value();
        assert!(heap.strict_value(r).is_undefined());

        let u = unit(&mut heap);
        let v = heap.new_union_value(3, u);
        assert!(heap.assign_ref_value(r, v));
        assert_eq!(heap.strict_value(r), v);
        assert_eq!(heap.union_tag(r), Some(3));
    }

    #[test]
    fn test_vacuous_ref() {
        let mut heap = ValueHeap::new();
        let r = heap.new_ref_value();
        assert!(!heap.assign_ref_value(r, r));

        // A chain of refs back to itself is also vacuous.
        let r2 = heap.new_ref_value();
        assert!(heap.assign_ref_value(r2, r));
        assert!(!heap.assign_ref_value(r, r2));
    }

    #[test]
    fn test_pop_frame_promotes_result() {
        let mut heap = ValueHeap::new();
        heap.push_frame(false);

        let u = unit(&mut heap);
        let args: Vec<Value> = (0..40).map(|tag| heap.new_union_value(tag, u)).collect();
        let s = heap.new_struct_value(&args);

        let result = heap.pop_frame(s);
        assert!(!result.is_undefined());

        // The promoted result reads the same as the original.
        for i in 0..40 {
            let field = heap.struct_field(result, i);
            assert_eq!(heap.union_tag(field), Some(i));
        }

        heap.full_gc();
        // One struct survives; its packed fields take no heap space.
        assert_eq!(heap.gc_object_count(), 1);
    }

    #[test]
    fn test_pop_frame_collects_garbage() {
        let mut heap = ValueHeap::new();
        heap.push_frame(false);
        let u = unit(&mut heap);
        for tag in 0..100 {
            let v = heap.new_union_value(tag, u);
            let args = vec![v; 40];
            heap.new_struct_value(&args);
        }
        let result = heap.pop_frame(u);
        assert_eq!(result, u);

        heap.full_gc();
        assert_eq!(heap.gc_object_count(), 0);
    }

    #[test]
    fn test_merged_frames() {
        let mut heap = ValueHeap::new();
        heap.push_frame(false);
        heap.push_frame(true);

        let u = unit(&mut heap);
        let args = vec![u; 40];
        let s = heap.new_struct_value(&args);

        // Popping a merged frame does not promote; the value lives on in
        // the shared frame.
        let s = heap.pop_frame(s);
        assert_eq!(heap.struct_field(s, 0), u);

        let result = heap.pop_frame(s);
        assert_eq!(heap.struct_field(result, 0), u);
    }

    #[test]
    fn test_compact_frame_bounds_residency() {
        let mut heap = ValueHeap::new();
        heap.push_frame(false);

        let u = unit(&mut heap);
        let mut live = heap.new_struct_value(&vec![u; 40]);
        let mut peak = 0;
        for _ in 0..10_000 {
            // Allocate garbage, then compact keeping one live value.
            heap.new_struct_value(&vec![live; 40]);
            let mut save = [live];
            heap.compact_frame(false, &mut save);
            live = save[0];
            peak = peak.max(heap.objs.iter().filter(|o| o.is_some()).count());
        }

        assert_eq!(heap.struct_field(live, 0), u);
        // Residency stays bounded no matter how many iterations ran.
        assert!(peak < 1000, "peak residency {} too high", peak);
    }

    #[test]
    fn test_native_value() {
        let mut heap = ValueHeap::new();
        let v = heap.new_native_value(Box::new(String::from("handle")));
        assert_eq!(heap.native_data::<String>(v).unwrap(), "handle");
        assert!(heap.native_data::<usize>(v).is_none());
    }

    #[test]
    fn test_list_value() {
        let mut heap = ValueHeap::new();
        let u = unit(&mut heap);
        let a = heap.new_union_value(1, u);
        let b = heap.new_union_value(2, u);
        let list = heap.new_list_value(&[a, b]);

        // cons(a, cons(b, nil))
        assert_eq!(heap.union_tag(list), Some(0));
        let cell = heap.union_arg(list);
        assert_eq!(heap.struct_field(cell, 0), a);
        let rest = heap.struct_field(cell, 1);
        assert_eq!(heap.union_tag(rest), Some(0));
        let cell = heap.union_arg(rest);
        assert_eq!(heap.struct_field(cell, 0), b);
        let nil = heap.struct_field(cell, 1);
        assert_eq!(heap.union_tag(nil), Some(1));
    }

    #[test]
    fn test_literal_value() {
        let mut heap = ValueHeap::new();
        let word = [7, 4, 11, 11, 14];
        let mut list = heap.new_literal_value(&word);
        for letter in word.iter() {
            assert_eq!(heap.union_tag(list), Some(0));
            let cell = heap.union_arg(list);
            let head = heap.struct_field(cell, 0);
            assert_eq!(heap.union_tag(head), Some(*letter));
            list = heap.struct_field(cell, 1);
        }
        assert_eq!(heap.union_tag(list), Some(1));
    }
}
