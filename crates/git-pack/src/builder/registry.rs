//! Object registry: the deduplicated table of objects a pack build works over.

use git_hash::collections::oid_map::OidMap;
use git_hash::ObjectId;
use git_object::{ObjectType, Tree};

use crate::generate::ObjectResolver;
use crate::PackError;

/// Per-object bookkeeping the builder maintains from insertion through
/// write-out. Most fields start empty and are filled in by later stages
/// (delta search, write-order planning, the writer itself).
#[derive(Debug, Clone)]
pub struct PackObjectEntry {
    pub oid: ObjectId,
    pub obj_type: ObjectType,
    pub size: u64,
    /// Path-locality hash computed from the name this object was inserted
    /// under (empty/unknown name hashes to 0).
    pub name_hash: u32,
    /// Index into the registry of the chosen delta base, if any.
    pub delta_base: Option<usize>,
    /// Size of the delta instruction stream against `delta_base`.
    pub delta_size: u64,
    /// Cached delta instruction stream, already deflated — the scheduler
    /// compresses it in place as soon as it's accepted into the cache
    /// rather than leaving that work for the write phase. Freed once
    /// written or once the cache budget is exceeded.
    pub delta_bytes: Option<Vec<u8>>,
    /// Delta chain depth: 0 for objects stored whole.
    pub depth: u16,
    /// Set when the object is too large (or otherwise unsuitable) to ever
    /// be considered as a delta target.
    pub no_try_delta: bool,
    /// First object (by registry index) that chose this one as a delta
    /// base, forming an intrusive forest alongside `next_sibling`.
    pub first_child: Option<usize>,
    /// Next sibling in the same parent's child list.
    pub next_sibling: Option<usize>,
    /// Set by the write-order planner when this object is a tag target.
    pub tagged: bool,
    /// Set by the planner once this entry has been placed in the write
    /// order, so repeated forest walks don't re-emit it.
    pub filled: bool,
}

impl PackObjectEntry {
    fn new(oid: ObjectId, obj_type: ObjectType, size: u64, name_hash: u32) -> Self {
        Self {
            oid,
            obj_type,
            size,
            name_hash,
            delta_base: None,
            delta_size: 0,
            delta_bytes: None,
            depth: 0,
            no_try_delta: false,
            first_child: None,
            next_sibling: None,
            tagged: false,
            filled: false,
        }
    }
}

/// Fold a path name into a 32-bit locality hash.
///
/// Objects inserted under names that share a hash tend to sit near each
/// other once the registry is sorted, which is what gives the delta
/// scheduler's sliding window its best shot at finding similar content.
/// Whitespace bytes don't participate in the fold, and an absent name
/// hashes to 0.
pub fn name_hash(name: &[u8]) -> u32 {
    if name.is_empty() {
        return 0;
    }
    let mut hash: u32 = 0;
    for &c in name {
        if is_space(c) {
            continue;
        }
        hash = (hash >> 2).wrapping_add((c as u32) << 24);
    }
    hash
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | 0x09..=0x0d)
}

/// The deduplicated object table a pack build accumulates objects into.
pub struct ObjectRegistry {
    entries: Vec<PackObjectEntry>,
    by_oid: OidMap<usize>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_oid: OidMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PackObjectEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [PackObjectEntry] {
        &mut self.entries
    }

    pub fn get(&self, index: usize) -> &PackObjectEntry {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut PackObjectEntry {
        &mut self.entries[index]
    }

    pub fn index_of(&self, oid: &ObjectId) -> Option<usize> {
        self.by_oid.get(oid).copied()
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.by_oid.contains_key(oid)
    }

    /// Register a single object by OID, reading its type and size from
    /// `resolver`. Returns the object's index, inserting only on first
    /// sight — re-inserting an already-known OID is a no-op that returns
    /// the existing index.
    pub fn insert(
        &mut self,
        resolver: &dyn ObjectResolver,
        oid: ObjectId,
        name: Option<&[u8]>,
    ) -> Result<usize, PackError> {
        if let Some(&idx) = self.by_oid.get(&oid) {
            return Ok(idx);
        }

        let (obj_type, size) = resolver
            .read_header(&oid)?
            .ok_or_else(|| PackError::MissingBase(oid))?;

        let hash = name_hash(name.unwrap_or(&[]));
        let idx = self.entries.len();
        self.entries.push(PackObjectEntry::new(oid, obj_type, size, hash));
        self.by_oid.insert(oid, idx);
        Ok(idx)
    }

    /// Register a tree and, recursively, every entry it reaches, using a
    /// pre-order walk so each descendant is inserted under its path from
    /// `root_oid` (joined with `/`, matching git's own tree-walk naming).
    pub fn insert_tree(
        &mut self,
        resolver: &dyn ObjectResolver,
        root_oid: ObjectId,
        root_name: &[u8],
    ) -> Result<(), PackError> {
        self.insert(resolver, root_oid, Some(root_name))?;
        self.walk_tree(resolver, root_oid, root_name)
    }

    fn walk_tree(
        &mut self,
        resolver: &dyn ObjectResolver,
        tree_oid: ObjectId,
        path: &[u8],
    ) -> Result<(), PackError> {
        let packed = resolver
            .read_object(&tree_oid)?
            .ok_or(PackError::MissingBase(tree_oid))?;
        if packed.obj_type != ObjectType::Tree {
            return Ok(());
        }
        let tree = Tree::parse(&packed.data)?;

        for entry in tree.iter() {
            let mut child_path = Vec::with_capacity(path.len() + 1 + entry.name.len());
            child_path.extend_from_slice(path);
            child_path.push(b'/');
            child_path.extend_from_slice(&entry.name);

            self.insert(resolver, entry.oid, Some(&child_path))?;

            if entry.mode.is_tree() {
                self.walk_tree(resolver, entry.oid, &child_path)?;
            }
        }
        Ok(())
    }

    /// Link `child_idx` into `base_idx`'s child list, building the delta
    /// forest incrementally as the scheduler accepts deltas.
    pub fn attach_child(&mut self, base_idx: usize, child_idx: usize) {
        let old_head = self.entries[base_idx].first_child;
        self.entries[child_idx].next_sibling = old_head;
        self.entries[base_idx].first_child = Some(child_idx);
    }

    /// Mark every entry larger than `threshold` bytes as ineligible for
    /// delta search. Idempotent; safe to call again after more inserts.
    pub fn apply_big_file_threshold(&mut self, threshold: u64) {
        for entry in &mut self.entries {
            if entry.size > threshold {
                entry.no_try_delta = true;
            }
        }
    }

    /// Sum of cached delta payload bytes across all entries. Tracked
    /// lazily (rather than as a running counter field) since it's only
    /// needed at budget-check points, not on every mutation.
    pub fn delta_cache_size(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| e.delta_bytes.as_ref())
            .map(|b| b.len() as u64)
            .sum()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResolver {
        objects: std::collections::HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    }

    impl ObjectResolver for FakeResolver {
        fn read_object(
            &self,
            oid: &ObjectId,
        ) -> Result<Option<crate::PackedObject>, PackError> {
            Ok(self
                .objects
                .get(oid)
                .map(|(obj_type, data)| crate::PackedObject {
                    obj_type: *obj_type,
                    data: data.clone(),
                }))
        }

        fn read_header(
            &self,
            oid: &ObjectId,
        ) -> Result<Option<(ObjectType, u64)>, PackError> {
            Ok(self
                .objects
                .get(oid)
                .map(|(obj_type, data)| (*obj_type, data.len() as u64)))
        }
    }

    fn blob_oid(data: &[u8]) -> ObjectId {
        git_hash::hasher::Hasher::hash_object(git_hash::HashAlgorithm::Sha1, "blob", data)
            .unwrap()
    }

    #[test]
    fn name_hash_empty_is_zero() {
        assert_eq!(name_hash(b""), 0);
    }

    #[test]
    fn name_hash_skips_whitespace() {
        assert_eq!(name_hash(b"a b"), name_hash(b"ab"));
    }

    #[test]
    fn insert_is_idempotent() {
        let data = b"hello".to_vec();
        let oid = blob_oid(&data);
        let mut objects = std::collections::HashMap::new();
        objects.insert(oid, (ObjectType::Blob, data));
        let resolver = FakeResolver { objects };

        let mut reg = ObjectRegistry::new();
        let i1 = reg.insert(&resolver, oid, Some(b"a.txt")).unwrap();
        let i2 = reg.insert(&resolver, oid, Some(b"a.txt")).unwrap();
        assert_eq!(i1, i2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn insert_missing_object_errors() {
        let resolver = FakeResolver {
            objects: std::collections::HashMap::new(),
        };
        let mut reg = ObjectRegistry::new();
        let oid = blob_oid(b"missing");
        assert!(reg.insert(&resolver, oid, None).is_err());
    }
}
