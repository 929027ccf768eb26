//! Reference host: a small copying garbage-collected heap.
//!
//! Handles carry the epoch they were created in. Every collection copies the
//! objects reachable from the root stack into a fresh arena, rewrites the root
//! slots and starts a new epoch, so a handle that was not rooted across an
//! allocation fails with [`Error::StaleValue`] instead of reading moved memory.

use crate::{Error, Host, Result};

/// Handle to a heap value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Unit,
    Ptr { epoch: u64, index: u32 },
}

#[derive(Debug)]
enum Object {
    Bytes(Box<[u8]>),
    Block { tag: u8, fields: Vec<Value> },
}

/// When the heap collects and how large it may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPolicy {
    /// Collect before an allocation once this many objects exist. `0` collects on
    /// every allocation.
    pub threshold: usize,
    /// Maximum number of objects; allocation fails past it even after collecting.
    pub limit: Option<usize>,
}

impl GcPolicy {
    pub const fn new(threshold: usize) -> Self {
        Self {
            threshold,
            limit: None,
        }
    }

    /// Collects on every allocation, so any unrooted handle goes stale immediately.
    pub const fn stress() -> Self {
        Self::new(0)
    }

    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Counters kept across the heap's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: usize,
    pub collections: usize,
    pub reclaimed: usize,
}

/// Moving heap with an explicit root stack.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
    roots: Vec<Value>,
    epoch: u64,
    policy: GcPolicy,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: GcPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> GcPolicy {
        self.policy
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Objects currently in the arena, including unreachable ones not yet collected.
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    /// Copies everything reachable from the root stack into a new arena.
    pub fn collect(&mut self) {
        let from = std::mem::take(&mut self.objects);
        let before = from.len();
        let mut evac = Evacuation {
            from: from.into_iter().map(Some).collect(),
            forward: vec![None; before],
            to: Vec::new(),
            old_epoch: self.epoch,
            new_epoch: self.epoch + 1,
        };

        for root in self.roots.iter_mut() {
            *root = evac.copy(*root);
        }

        let mut scan = 0;
        while scan < evac.to.len() {
            if let Object::Block { fields, .. } = &mut evac.to[scan] {
                let pending = std::mem::take(fields);
                let moved: Vec<Value> = pending.into_iter().map(|f| evac.copy(f)).collect();
                if let Object::Block { fields, .. } = &mut evac.to[scan] {
                    *fields = moved;
                }
            }
            scan += 1;
        }

        self.objects = evac.to;
        self.epoch = evac.new_epoch;
        self.stats.collections += 1;
        self.stats.reclaimed += before - self.objects.len();
        log::debug!(
            "heap collection {}: {} of {} objects live",
            self.stats.collections,
            self.objects.len(),
            before
        );
    }

    /// Reads field `index` of a block.
    pub fn field(&self, block: Value, index: usize) -> Result<Value> {
        match self.resolve(block)? {
            Object::Block { fields, .. } => fields.get(index).copied().ok_or(Error::FieldOutOfRange {
                index,
                size: fields.len(),
            }),
            Object::Bytes(_) => Err(Error::NotABlock),
        }
    }

    /// Tag of a block.
    pub fn tag(&self, block: Value) -> Result<u8> {
        match self.resolve(block)? {
            Object::Block { tag, .. } => Ok(*tag),
            Object::Bytes(_) => Err(Error::NotABlock),
        }
    }

    /// Contents of a string value.
    pub fn read_string(&self, value: Value) -> Result<&[u8]> {
        self.string_bytes(value)
    }

    /// Decodes an optional string: unit is absent, a one-field block is present.
    pub fn read_optional_string(&self, value: Value) -> Result<Option<&[u8]>> {
        match value {
            Value::Unit => Ok(None),
            block => self.read_string(self.field(block, 0)?).map(Some),
        }
    }

    fn resolve(&self, value: Value) -> Result<&Object> {
        let index = self.index_of(value)?;
        self.objects.get(index).ok_or(Error::StaleValue { epoch: self.epoch })
    }

    fn index_of(&self, value: Value) -> Result<usize> {
        match value {
            Value::Unit => Err(Error::NotABlock),
            Value::Ptr { epoch, .. } if epoch != self.epoch => Err(Error::StaleValue { epoch }),
            Value::Ptr { index, .. } => Ok(index as usize),
        }
    }

    fn reserve(&mut self) -> Result<()> {
        if self.objects.len() >= self.policy.threshold {
            self.collect();
        }
        match self.policy.limit {
            Some(limit) if self.objects.len() >= limit => Err(Error::HeapExhausted { limit }),
            _ => Ok(()),
        }
    }

    fn push(&mut self, object: Object) -> Value {
        let index = self.objects.len() as u32;
        self.objects.push(object);
        self.stats.allocations += 1;
        Value::Ptr {
            epoch: self.epoch,
            index,
        }
    }
}

struct Evacuation {
    from: Vec<Option<Object>>,
    forward: Vec<Option<u32>>,
    to: Vec<Object>,
    old_epoch: u64,
    new_epoch: u64,
}

impl Evacuation {
    fn copy(&mut self, value: Value) -> Value {
        let Value::Ptr { epoch, index } = value else {
            return value;
        };
        // Stale handles left in roots stay stale.
        if epoch != self.old_epoch {
            return value;
        }
        let slot = index as usize;
        let new_index = match self.forward.get(slot).copied().flatten() {
            Some(new_index) => new_index,
            None => match self.from.get_mut(slot).and_then(Option::take) {
                Some(object) => {
                    let new_index = self.to.len() as u32;
                    self.to.push(object);
                    self.forward[slot] = Some(new_index);
                    new_index
                }
                None => return value,
            },
        };
        Value::Ptr {
            epoch: self.new_epoch,
            index: new_index,
        }
    }
}

impl Host for Heap {
    type Value = Value;

    fn unit(&self) -> Value {
        Value::Unit
    }

    fn string_bytes(&self, value: Value) -> Result<&[u8]> {
        if value == Value::Unit {
            return Err(Error::NotAString);
        }
        match self.resolve(value)? {
            Object::Bytes(bytes) => Ok(&bytes[..]),
            Object::Block { .. } => Err(Error::NotAString),
        }
    }

    fn alloc_string(&mut self, bytes: &[u8]) -> Result<Value> {
        self.reserve()?;
        Ok(self.push(Object::Bytes(bytes.into())))
    }

    fn alloc_block(&mut self, tag: u8, size: usize) -> Result<Value> {
        self.reserve()?;
        Ok(self.push(Object::Block {
            tag,
            fields: vec![Value::Unit; size],
        }))
    }

    fn store_field(&mut self, block: Value, index: usize, value: Value) -> Result<()> {
        if let Value::Ptr { epoch, .. } = value {
            if epoch != self.epoch {
                return Err(Error::StaleValue { epoch });
            }
        }
        let slot = self.index_of(block)?;
        match self.objects.get_mut(slot) {
            Some(Object::Block { fields, .. }) => {
                let size = fields.len();
                let field = fields
                    .get_mut(index)
                    .ok_or(Error::FieldOutOfRange { index, size })?;
                *field = value;
                Ok(())
            }
            Some(Object::Bytes(_)) => Err(Error::NotABlock),
            None => Err(Error::StaleValue { epoch: self.epoch }),
        }
    }

    fn roots_len(&self) -> usize {
        self.roots.len()
    }

    fn push_root(&mut self, value: Value) {
        self.roots.push(value);
    }

    fn root(&self, slot: usize) -> Value {
        self.roots[slot]
    }

    fn set_root(&mut self, slot: usize, value: Value) {
        self.roots[slot] = value;
    }

    fn truncate_roots(&mut self, len: usize) {
        self.roots.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_objects_are_reclaimed() {
        let mut heap = Heap::new();
        let kept = heap.alloc_string(b"kept").unwrap();
        heap.alloc_string(b"dropped").unwrap();
        heap.push_root(kept);

        heap.collect();

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.stats().reclaimed, 1);
        assert_eq!(heap.string_bytes(heap.root(0)).unwrap(), b"kept");
    }

    #[test]
    fn collection_traces_block_fields() {
        let mut heap = Heap::new();
        let inner = heap.alloc_string(b"payload").unwrap();
        let block = heap.alloc_block(0, 2).unwrap();
        heap.store_field(block, 1, inner).unwrap();
        heap.push_root(block);

        heap.collect();

        let block = heap.root(0);
        assert_eq!(heap.tag(block).unwrap(), 0);
        assert_eq!(heap.field(block, 0).unwrap(), Value::Unit);
        assert_eq!(heap.string_bytes(heap.field(block, 1).unwrap()).unwrap(), b"payload");
    }

    #[test]
    fn shared_objects_are_copied_once() {
        let mut heap = Heap::new();
        let s = heap.alloc_string(b"shared").unwrap();
        heap.push_root(s);
        heap.push_root(s);

        heap.collect();

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.root(0), heap.root(1));
    }

    #[test]
    fn stress_policy_invalidates_unrooted_handles() {
        let mut heap = Heap::with_policy(GcPolicy::stress());
        let first = heap.alloc_string(b"first").unwrap();
        heap.alloc_string(b"second").unwrap();

        assert_eq!(heap.string_bytes(first), Err(Error::StaleValue { epoch: 1 }));
        assert_eq!(heap.stats().collections, 2);
    }

    #[test]
    fn storing_a_stale_value_is_refused() {
        let mut heap = Heap::new();
        let stale = heap.alloc_string(b"old").unwrap();
        heap.collect();
        let block = heap.alloc_block(0, 1).unwrap();
        assert!(matches!(heap.store_field(block, 0, stale), Err(Error::StaleValue { .. })));
    }

    #[test]
    fn limit_applies_after_collection() {
        let mut heap = Heap::with_policy(GcPolicy::stress().with_limit(1));
        let s = heap.alloc_string(b"one").unwrap();
        heap.push_root(s);
        assert_eq!(heap.alloc_string(b"two"), Err(Error::HeapExhausted { limit: 1 }));

        heap.truncate_roots(0);
        assert!(heap.alloc_string(b"two").is_ok());
    }

    #[test]
    fn kind_mismatches() {
        let mut heap = Heap::new();
        let s = heap.alloc_string(b"s").unwrap();
        let block = heap.alloc_block(0, 1).unwrap();
        assert_eq!(heap.string_bytes(Value::Unit), Err(Error::NotAString));
        assert_eq!(heap.string_bytes(block), Err(Error::NotAString));
        assert_eq!(heap.field(s, 0), Err(Error::NotABlock));
        assert_eq!(
            heap.store_field(block, 1, Value::Unit),
            Err(Error::FieldOutOfRange { index: 1, size: 1 })
        );
    }

    #[test]
    fn epochs_do_not_wrap_at_u32() {
        let mut heap = Heap {
            epoch: u64::from(u32::MAX),
            ..Heap::default()
        };
        let old = heap.alloc_string(b"old").unwrap();
        heap.collect();
        assert_eq!(heap.epoch(), u64::from(u32::MAX) + 1);
        assert_eq!(
            heap.read_string(old),
            Err(Error::StaleValue { epoch: u64::from(u32::MAX) })
        );
    }

    #[test]
    fn read_string_rejects_blocks() {
        let mut heap = Heap::new();
        let s = heap.alloc_string(b"plain").unwrap();
        let block = heap.alloc_block(0, 1).unwrap();
        assert_eq!(heap.read_string(s).unwrap(), b"plain");
        assert_eq!(heap.read_string(block), Err(Error::NotAString));
    }

    #[test]
    fn optional_strings_decode() {
        let mut heap = Heap::new();
        assert_eq!(heap.read_optional_string(Value::Unit).unwrap(), None);

        let s = heap.alloc_string(b"text").unwrap();
        let some = heap.alloc_block(0, 1).unwrap();
        heap.store_field(some, 0, s).unwrap();
        assert_eq!(heap.read_optional_string(some).unwrap(), Some(&b"text"[..]));
    }
}
