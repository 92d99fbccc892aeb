use std::ffi::CString;

use crate::value::{Closure, Object, ObjRef};

/// Per-object collector state.
pub(crate) struct Header {
    /// Mark bit. Only meaningful during a collection; cleared by the sweep.
    pub alive: bool,
    /// Set once the object has been handed to native code.
    pub external: bool,
    /// Intrusive link to the previously allocated object (the registry).
    pub prev: Option<u32>,
}

pub(crate) struct Entry {
    pub header: Header,
    pub object: Object,
}

pub(crate) struct Slot {
    pub generation: u32,
    pub entry: Option<Entry>,
}

/// The object heap. Every value is allocated here and only the sweep frees it.
///
/// Slots are reused through a free list; `ObjRef` carries the slot generation
/// so a handle to a freed object can never reach its successor.
pub struct Heap {
    pub(crate) slots: Vec<Slot>,
    pub(crate) free_list: Vec<u32>,
    /// Head of the all-objects registry: the most recent allocation.
    pub(crate) latest: Option<u32>,
    /// Number of objects currently in the registry.
    pub(crate) live: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::with_capacity(1024),
            free_list: Vec::new(),
            latest: None,
            live: 0,
        }
    }

    /// Allocate one object and link it at the head of the registry.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let entry = Entry {
            header: Header {
                alive: false,
                external: false,
                prev: self.latest,
            },
            object,
        };

        let index = match self.free_list.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.entry.is_none());
                slot.entry = Some(entry);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                index
            }
        };

        self.latest = Some(index);
        self.live += 1;
        ObjRef {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    #[inline]
    fn entry(&self, r: ObjRef) -> &Entry {
        let slot = &self.slots[r.index as usize];
        match &slot.entry {
            Some(entry) if slot.generation == r.generation => entry,
            _ => panic!("stale object handle {:?}", r),
        }
    }

    #[inline]
    fn entry_mut(&mut self, r: ObjRef) -> &mut Entry {
        let slot = &mut self.slots[r.index as usize];
        match &mut slot.entry {
            Some(entry) if slot.generation == r.generation => entry,
            _ => panic!("stale object handle {:?}", r),
        }
    }

    #[inline]
    pub fn get(&self, r: ObjRef) -> &Object {
        &self.entry(r).object
    }

    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        &mut self.entry_mut(r).object
    }

    /// Returns true if the handle still names an object in the heap.
    pub fn contains(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.index as usize)
            .map(|slot| slot.entry.is_some() && slot.generation == r.generation)
            .unwrap_or(false)
    }

    /// Mark an object as referenced from outside the tracing graph.
    pub fn mark_external(&mut self, r: ObjRef) {
        self.entry_mut(r).header.external = true;
    }

    pub fn is_external(&self, r: ObjRef) -> bool {
        self.entry(r).header.external
    }

    /// Number of objects currently in the registry.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots ever created, free or not.
    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    // === Constructors ===

    pub fn pair(&mut self, car: Option<ObjRef>, cdr: Option<ObjRef>) -> ObjRef {
        self.alloc(Object::Pair { car, cdr })
    }

    pub fn cons(&mut self, car: ObjRef, cdr: ObjRef) -> ObjRef {
        self.pair(Some(car), Some(cdr))
    }

    /// A fresh empty-list terminator.
    pub fn empty_list(&mut self) -> ObjRef {
        self.pair(None, None)
    }

    pub fn int(&mut self, i: i64) -> ObjRef {
        self.alloc(Object::Integer(i))
    }

    pub fn float(&mut self, x: f64) -> ObjRef {
        self.alloc(Object::Float(x))
    }

    /// Allocate a string. Interior NULs cannot cross the native boundary, so
    /// the text is cut at the first one.
    pub fn string(&mut self, s: &str) -> ObjRef {
        let bytes = s.as_bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let c = CString::new(&bytes[..end]).unwrap_or_default();
        self.alloc(Object::Str(c))
    }

    pub fn symbol(&mut self, s: &str) -> ObjRef {
        self.alloc(Object::Symbol(s.to_string()))
    }

    pub fn keyword(&mut self, s: &str) -> ObjRef {
        self.alloc(Object::Keyword(s.to_string()))
    }

    pub fn lambda(&mut self, closure: Closure) -> ObjRef {
        self.alloc(Object::Lambda(closure))
    }

    pub fn macro_(&mut self, closure: Closure) -> ObjRef {
        self.alloc(Object::Macro(closure))
    }

    /// A new environment with no bindings.
    pub fn environment(&mut self, parent: Option<ObjRef>) -> ObjRef {
        let bindings = self.empty_list();
        self.alloc(Object::Environment { parent, bindings })
    }

    // === Pair access ===

    /// Car of a pair. Panics on a non-pair: callers check shapes first.
    #[inline]
    pub fn car(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            Object::Pair { car, .. } => *car,
            other => panic!("car of non-pair {:?}", other.kind()),
        }
    }

    #[inline]
    pub fn cdr(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            Object::Pair { cdr, .. } => *cdr,
            other => panic!("cdr of non-pair {:?}", other.kind()),
        }
    }

    pub fn set_car(&mut self, r: ObjRef, val: Option<ObjRef>) {
        match self.get_mut(r) {
            Object::Pair { car, .. } => *car = val,
            other => panic!("set_car of non-pair {:?}", other.kind()),
        }
    }

    pub fn set_cdr(&mut self, r: ObjRef, val: Option<ObjRef>) {
        match self.get_mut(r) {
            Object::Pair { cdr, .. } => *cdr = val,
            other => panic!("set_cdr of non-pair {:?}", other.kind()),
        }
    }

    /// Car of a pair, or `None` for anything else.
    pub fn car_of(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            Object::Pair { car, .. } => *car,
            _ => None,
        }
    }

    pub fn cdr_of(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            Object::Pair { cdr, .. } => *cdr,
            _ => None,
        }
    }

    /// Element `n` of a list form, `None` when the list is shorter.
    pub fn nth(&self, list: ObjRef, n: usize) -> Option<ObjRef> {
        let mut current = list;
        for _ in 0..n {
            current = self.cdr_of(current)?;
        }
        self.car_of(current)
    }

    pub fn is_pair(&self, r: ObjRef) -> bool {
        self.get(r).is_pair()
    }

    pub fn is_empty_list(&self, r: ObjRef) -> bool {
        self.get(r).is_empty_list()
    }

    /// Text of a string, symbol or keyword.
    pub fn text(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            Object::Symbol(s) | Object::Keyword(s) => Some(s),
            Object::Str(c) => c.to_str().ok(),
            _ => None,
        }
    }

    // === Lists ===

    /// Build a proper list from a slice of values.
    pub fn list(&mut self, values: &[ObjRef]) -> ObjRef {
        let mut result = self.empty_list();
        for &val in values.iter().rev() {
            result = self.cons(val, result);
        }
        result
    }

    /// Collect the elements of a list into a Vec. Stops at the terminator or
    /// at a non-pair tail.
    pub fn list_items(&self, list: ObjRef) -> Vec<ObjRef> {
        let mut result = Vec::new();
        let mut current = Some(list);
        while let Some(p) = current {
            match self.get(p) {
                Object::Pair {
                    car: Some(car),
                    cdr,
                } => {
                    result.push(*car);
                    current = *cdr;
                }
                _ => break,
            }
        }
        result
    }

    pub fn list_len(&self, list: ObjRef) -> usize {
        let mut count = 0;
        let mut current = Some(list);
        while let Some(p) = current {
            match self.get(p) {
                Object::Pair { car: Some(_), cdr } => {
                    count += 1;
                    current = *cdr;
                }
                _ => break,
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_links_registry_newest_first() {
        let mut heap = Heap::new();
        let a = heap.int(1);
        let b = heap.int(2);
        assert_eq!(heap.live_count(), 2);
        assert_eq!(heap.latest, Some(b.index));
        let prev = heap.slots[b.index as usize].entry.as_ref().unwrap().header.prev;
        assert_eq!(prev, Some(a.index));
    }

    #[test]
    fn list_round_trips_items() {
        let mut heap = Heap::new();
        let items: Vec<_> = (0..4).map(|i| heap.int(i)).collect();
        let list = heap.list(&items);
        assert_eq!(heap.list_items(list), items);
        assert_eq!(heap.list_len(list), 4);
        assert_eq!(heap.nth(list, 2), Some(items[2]));
        assert_eq!(heap.nth(list, 4), None);
    }

    #[test]
    fn empty_list_has_no_items() {
        let mut heap = Heap::new();
        let nil = heap.empty_list();
        assert!(heap.is_empty_list(nil));
        assert!(heap.list_items(nil).is_empty());
    }

    #[test]
    fn string_is_cut_at_nul() {
        let mut heap = Heap::new();
        let s = heap.string("abc\0def");
        assert_eq!(heap.text(s), Some("abc"));
    }

    #[test]
    #[should_panic(expected = "car of non-pair")]
    fn car_of_scalar_is_fatal() {
        let mut heap = Heap::new();
        let i = heap.int(3);
        heap.car(i);
    }
}
