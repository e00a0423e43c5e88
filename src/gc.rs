/// Typed heap with per-type accounting and mark-sweep collection.
///
/// Two arenas (script objects and heap strings) hand out generational
/// handles: `{index, gen}` pairs. A stale handle never dereferences into a
/// recycled slot; it just resolves to nothing. Mark bits live beside the
/// slots. Collection is a staged mark-sweep driven from VM roots and a
/// registry of static roots; unforced collections are gated by allocation
/// churn so most iterations cost nothing.

use crate::object::HeapObject;
use crate::value::Value;

/// Allocation categories for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Object = 0,
    String = 1,
    UpValue = 2,
    Native = 3,
    ExecutionUnit = 4,
}

pub const MEMORY_TYPE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct TypeInfo {
    pub count: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryInfo {
    pub num_allocations: u32,
    pub total_allocated_bytes: u32,
    pub allocations_by_type: [TypeInfo; MEMORY_TYPE_COUNT],
}

/// Generational handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId {
    index: u32,
    gen: u32,
}

/// Generational handle to a heap string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId {
    index: u32,
    gen: u32,
}

struct Slot<T> {
    gen: u32,
    marked: bool,
    value: Option<T>,
}

/// Mark worklist. Root providers push handles with `value`/`object`/
/// `string`; `Heap::collect` drains it transitively.
#[derive(Default)]
pub struct Marker {
    objects: Vec<ObjId>,
    strings: Vec<StringId>,
}

impl Marker {
    pub fn value(&mut self, v: &Value) {
        match v {
            Value::Object(id) => self.objects.push(*id),
            Value::String(id) => self.strings.push(*id),
            _ => {}
        }
    }

    pub fn object(&mut self, id: ObjId) {
        self.objects.push(id);
    }

    pub fn string(&mut self, id: StringId) {
        self.strings.push(id);
    }
}

pub struct Heap {
    objects: Vec<Slot<HeapObject>>,
    free_objects: Vec<u32>,
    strings: Vec<Slot<String>>,
    free_strings: Vec<u32>,
    static_roots: Vec<ObjId>,

    info: MemoryInfo,

    // Churn gating for unforced collections
    objects_since_gc: u32,
    strings_since_gc: u32,
    count_since_gc: u32,
    pub gc_pending: bool,
}

const MAX_GC_OBJECT_DIFF: u32 = 10;
const MAX_GC_STRING_DIFF: u32 = 10;
const MAX_COUNT_SINCE_GC: u32 = 20;

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            free_objects: Vec::new(),
            strings: Vec::new(),
            free_strings: Vec::new(),
            static_roots: Vec::new(),
            info: MemoryInfo::default(),
            objects_since_gc: 0,
            strings_since_gc: 0,
            count_since_gc: 0,
            gc_pending: false,
        }
    }

    // ── Objects ──────────────────────────────────────────────────────────

    pub fn alloc_object(&mut self, obj: HeapObject) -> ObjId {
        self.record_alloc(MemoryType::Object, std::mem::size_of::<HeapObject>() as u32);
        self.objects_since_gc += 1;
        if let Some(index) = self.free_objects.pop() {
            let slot = &mut self.objects[index as usize];
            slot.value = Some(obj);
            slot.marked = true;
            ObjId {
                index,
                gen: slot.gen,
            }
        } else {
            self.objects.push(Slot {
                gen: 0,
                marked: true,
                value: Some(obj),
            });
            ObjId {
                index: (self.objects.len() - 1) as u32,
                gen: 0,
            }
        }
    }

    pub fn object(&self, id: ObjId) -> Option<&HeapObject> {
        let slot = self.objects.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn object_mut(&mut self, id: ObjId) -> Option<&mut HeapObject> {
        let slot = self.objects.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.value.as_mut()
    }

    // ── Strings ──────────────────────────────────────────────────────────

    pub fn alloc_string(&mut self, s: String) -> StringId {
        self.record_alloc(MemoryType::String, (s.len() + 1) as u32);
        self.strings_since_gc += 1;
        if let Some(index) = self.free_strings.pop() {
            let slot = &mut self.strings[index as usize];
            slot.value = Some(s);
            slot.marked = true;
            StringId {
                index,
                gen: slot.gen,
            }
        } else {
            self.strings.push(Slot {
                gen: 0,
                marked: true,
                value: Some(s),
            });
            StringId {
                index: (self.strings.len() - 1) as u32,
                gen: 0,
            }
        }
    }

    pub fn string(&self, id: StringId) -> Option<&str> {
        let slot = self.strings.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.value.as_deref()
    }

    pub fn string_mut(&mut self, id: StringId) -> Option<&mut String> {
        let slot = self.strings.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.value.as_mut()
    }

    // ── Roots ────────────────────────────────────────────────────────────

    pub fn add_static_root(&mut self, id: ObjId) {
        self.static_roots.push(id);
    }

    pub fn remove_static_root(&mut self, id: ObjId) {
        if let Some(pos) = self.static_roots.iter().position(|&r| r == id) {
            self.static_roots.swap_remove(pos);
        }
    }

    // ── Accounting ───────────────────────────────────────────────────────

    pub fn record_alloc(&mut self, mt: MemoryType, size: u32) {
        let entry = &mut self.info.allocations_by_type[mt as usize];
        entry.count += 1;
        entry.size += size;
        self.info.num_allocations += 1;
        self.info.total_allocated_bytes += size;
    }

    pub fn record_free(&mut self, mt: MemoryType, size: u32) {
        let entry = &mut self.info.allocations_by_type[mt as usize];
        entry.count = entry.count.saturating_sub(1);
        entry.size = entry.size.saturating_sub(size);
        self.info.num_allocations = self.info.num_allocations.saturating_sub(1);
        self.info.total_allocated_bytes = self.info.total_allocated_bytes.saturating_sub(size);
    }

    pub fn memory_info(&self) -> &MemoryInfo {
        &self.info
    }

    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn live_strings(&self) -> usize {
        self.strings.iter().filter(|s| s.value.is_some()).count()
    }

    // ── Collection ───────────────────────────────────────────────────────

    fn should_gc(&mut self) -> bool {
        self.count_since_gc += 1;
        self.objects_since_gc > MAX_GC_OBJECT_DIFF
            || self.strings_since_gc > MAX_GC_STRING_DIFF
            || self.count_since_gc > MAX_COUNT_SINCE_GC
    }

    /// Run a collection. `roots` pushes every value reachable from the
    /// active VMs into the marker; the static-root registry is added here.
    /// Unforced runs may be skipped when allocation churn is low.
    pub fn collect<F>(&mut self, force: bool, roots: F)
    where
        F: FnOnce(&mut Marker),
    {
        if !force && !self.should_gc() {
            return;
        }
        self.objects_since_gc = 0;
        self.strings_since_gc = 0;
        self.count_since_gc = 0;
        self.gc_pending = false;

        for slot in &mut self.objects {
            slot.marked = false;
        }
        for slot in &mut self.strings {
            slot.marked = false;
        }

        let mut marker = Marker::default();
        roots(&mut marker);
        for &root in &self.static_roots {
            marker.objects.push(root);
        }

        self.trace(&mut marker);
        self.sweep();
    }

    fn trace(&mut self, marker: &mut Marker) {
        loop {
            if let Some(id) = marker.objects.pop() {
                let index = id.index as usize;
                if index >= self.objects.len() {
                    continue;
                }
                if self.objects[index].gen != id.gen || self.objects[index].marked {
                    continue;
                }
                self.objects[index].marked = true;
                if let Some(obj) = self.objects[index].value.as_ref() {
                    obj.gc_mark_children(marker);
                }
                continue;
            }
            if let Some(id) = marker.strings.pop() {
                let index = id.index as usize;
                if index < self.strings.len() && self.strings[index].gen == id.gen {
                    self.strings[index].marked = true;
                }
                continue;
            }
            break;
        }
    }

    fn sweep(&mut self) {
        for index in 0..self.objects.len() {
            let slot = &mut self.objects[index];
            if slot.value.is_some() && !slot.marked {
                slot.value = None;
                slot.gen = slot.gen.wrapping_add(1);
                self.free_objects.push(index as u32);
                self.record_free(MemoryType::Object, std::mem::size_of::<HeapObject>() as u32);
            }
        }
        for index in 0..self.strings.len() {
            let slot = &mut self.strings[index];
            if let Some(s) = slot.value.as_ref() {
                if !slot.marked {
                    let size = (s.len() + 1) as u32;
                    slot.value = None;
                    slot.gen = slot.gen.wrapping_add(1);
                    self.free_strings.push(index as u32);
                    self.record_free(MemoryType::String, size);
                }
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjectKind};

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut heap = Heap::new();
        let id = heap.alloc_object(HeapObject::new(ObjectKind::Mater));
        heap.collect(true, |_| {});
        assert!(heap.object(id).is_none());

        let reused = heap.alloc_object(HeapObject::new(ObjectKind::Mater));
        assert!(heap.object(reused).is_some());
        assert!(heap.object(id).is_none());
    }

    #[test]
    fn roots_survive_collection() {
        let mut heap = Heap::new();
        let rooted = heap.alloc_object(HeapObject::new(ObjectKind::Mater));
        let garbage = heap.alloc_object(HeapObject::new(ObjectKind::Mater));
        heap.add_static_root(rooted);
        heap.collect(true, |_| {});
        assert!(heap.object(rooted).is_some());
        assert!(heap.object(garbage).is_none());
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn reachable_strings_survive() {
        let mut heap = Heap::new();
        let live = heap.alloc_string("kept".to_string());
        let dead = heap.alloc_string("dropped".to_string());
        heap.collect(true, |m| m.string(live));
        assert_eq!(heap.string(live), Some("kept"));
        assert!(heap.string(dead).is_none());
    }

    #[test]
    fn property_values_are_traced() {
        let mut heap = Heap::new();
        let inner = heap.alloc_object(HeapObject::new(ObjectKind::Mater));
        let mut outer_obj = HeapObject::new(ObjectKind::Mater);
        outer_obj.properties.push((
            crate::atom::Atom::from(crate::atom::SharedAtom::Value),
            Value::Object(inner),
        ));
        let outer = heap.alloc_object(outer_obj);
        heap.collect(true, |m| m.object(outer));
        assert!(heap.object(inner).is_some());
    }
}
