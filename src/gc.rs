//! Mark-and-sweep collection over the heap registry.
//!
//! The mark phase traces from whatever roots the caller hands in (the
//! evaluator passes its global environment, operand stack and root stack).
//! The sweep walks the intrusive registry once, unlinking and freeing every
//! object that was not reached, and clears the mark bit on survivors.

use log::debug;

use crate::heap::Heap;
use crate::value::{Object, ObjRef};

/// Counters kept across collections.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub collections: usize,
    pub freed_last: usize,
    pub freed_total: usize,
    /// Objects that survived only because native code holds them.
    pub pinned_last: usize,
}

impl Heap {
    /// Mark a value and everything reachable from it.
    ///
    /// Uses an explicit worklist so long lists don't grow the native stack.
    pub fn mark(&mut self, root: ObjRef) {
        let mut worklist = vec![root];
        while let Some(r) = worklist.pop() {
            let slot = &mut self.slots[r.index as usize];
            let entry = match &mut slot.entry {
                Some(entry) if slot.generation == r.generation => entry,
                _ => panic!("marking stale object handle {:?}", r),
            };
            if entry.header.alive {
                continue;
            }
            entry.header.alive = true;
            trace_children(&entry.object, &mut worklist);
        }
    }

    /// Returns true if the object is currently marked (during a collection).
    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index as usize]
            .entry
            .as_ref()
            .map(|e| e.header.alive)
            .unwrap_or(false)
    }

    /// Free every unmarked object and clear the mark on the rest.
    ///
    /// Externally referenced objects are kept even when unmarked: native
    /// code may still point into their buffers.
    pub fn sweep(&mut self, stats: &mut GcStats) {
        let mut freed = 0;
        let mut pinned = 0;
        // The survivor whose `prev` link must skip over freed objects.
        // `None` means the registry head itself.
        let mut owner: Option<u32> = None;
        let mut cursor = self.latest;

        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            let entry = slot
                .entry
                .as_mut()
                .unwrap_or_else(|| panic!("registry links freed slot {}", index));
            let next = entry.header.prev;

            if entry.header.alive || entry.header.external {
                if !entry.header.alive {
                    pinned += 1;
                }
                entry.header.alive = false;
                owner = Some(index);
            } else {
                // Dropping the entry releases its auxiliary storage
                // (text buffers, call descriptors).
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index);
                self.live -= 1;
                freed += 1;

                match owner {
                    None => self.latest = next,
                    Some(o) => {
                        if let Some(e) = self.slots[o as usize].entry.as_mut() {
                            e.header.prev = next;
                        }
                    }
                }
            }
            cursor = next;
        }

        stats.collections += 1;
        stats.freed_last = freed;
        stats.freed_total += freed;
        stats.pinned_last = pinned;
        debug!("GC: freed {} objects, {} left ({} pinned by native code)", freed, self.live, pinned);
    }

    /// Full collection from the given roots.
    pub fn collect<I>(&mut self, roots: I, stats: &mut GcStats)
    where
        I: IntoIterator<Item = ObjRef>,
    {
        for root in roots {
            self.mark(root);
        }
        self.mark_pinned_children();
        self.sweep(stats);
    }

    /// Whatever a pinned object refers to must outlive it too.
    fn mark_pinned_children(&mut self) {
        let mut children = Vec::new();
        let mut cursor = self.latest;
        while let Some(index) = cursor {
            let entry = match &self.slots[index as usize].entry {
                Some(entry) => entry,
                None => panic!("registry links freed slot {}", index),
            };
            if entry.header.external {
                trace_children(&entry.object, &mut children);
            }
            cursor = entry.header.prev;
        }
        for child in children {
            self.mark(child);
        }
    }
}

/// Push every reference held by an object.
fn trace_children(object: &Object, worklist: &mut Vec<ObjRef>) {
    match object {
        Object::Pair { car, cdr } => {
            worklist.extend(car.iter().copied());
            worklist.extend(cdr.iter().copied());
        }
        Object::Lambda(c) | Object::Macro(c) => {
            worklist.extend([c.params, c.body, c.env, c.code]);
        }
        Object::Environment { parent, bindings } => {
            worklist.extend(parent.iter().copied());
            worklist.push(*bindings);
        }
        Object::Foreign(f) => {
            worklist.extend([f.arg_types, f.return_type]);
        }
        Object::Integer(_)
        | Object::Float(_)
        | Object::Str(_)
        | Object::Symbol(_)
        | Object::Keyword(_)
        | Object::Native { .. }
        | Object::Library { .. }
        | Object::Pointer(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_objects_are_freed() {
        let mut heap = Heap::new();
        let mut stats = GcStats::default();
        let keep = heap.int(1);
        let list = heap.list(&[keep]);
        for i in 0..10 {
            heap.int(i);
        }
        heap.collect([list], &mut stats);
        // list node + terminator + the int
        assert_eq!(heap.live_count(), 3);
        assert!(heap.contains(keep));
        assert_eq!(stats.freed_last, 10);
    }

    #[test]
    fn marks_are_cleared_after_sweep() {
        let mut heap = Heap::new();
        let mut stats = GcStats::default();
        let a = heap.int(1);
        heap.collect([a], &mut stats);
        assert!(!heap.is_marked(a));
        // Second cycle without roots frees it.
        heap.collect(std::iter::empty(), &mut stats);
        assert!(!heap.contains(a));
    }

    #[test]
    fn cycles_terminate() {
        let mut heap = Heap::new();
        let mut stats = GcStats::default();
        let a = heap.pair(None, None);
        let b = heap.pair(Some(a), Some(a));
        heap.set_car(a, Some(b));
        heap.set_cdr(a, Some(b));
        heap.collect([a], &mut stats);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn external_objects_survive_without_roots() {
        let mut heap = Heap::new();
        let mut stats = GcStats::default();
        let s = heap.string("held by C");
        heap.int(7);
        heap.mark_external(s);
        heap.collect(std::iter::empty(), &mut stats);
        assert!(heap.contains(s));
        assert_eq!(heap.text(s), Some("held by C"));
        assert_eq!(stats.pinned_last, 1);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn freed_slots_are_reused_with_new_generation() {
        let mut heap = Heap::new();
        let mut stats = GcStats::default();
        let old = heap.int(1);
        heap.collect(std::iter::empty(), &mut stats);
        assert_eq!(heap.free_count(), 1);
        let new = heap.int(2);
        assert_eq!(heap.free_count(), 0);
        assert_eq!(heap.total_slots(), 1);
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(!heap.contains(old));
    }

    #[test]
    fn registry_stays_consistent_across_interleaved_frees() {
        let mut heap = Heap::new();
        let mut stats = GcStats::default();
        let keep: Vec<_> = (0..5)
            .map(|i| {
                heap.int(i * 100);
                heap.int(i)
            })
            .collect();
        heap.collect(keep.iter().copied(), &mut stats);
        assert_eq!(heap.live_count(), 5);
        // A second collection must walk the relinked registry cleanly.
        heap.collect(keep.iter().copied(), &mut stats);
        assert_eq!(heap.live_count(), 5);
        assert_eq!(stats.freed_last, 0);
        assert_eq!(stats.freed_total, 5);
        assert_eq!(stats.collections, 2);
    }
}
