//! Write-order planning.
//!
//! Decides the order objects are streamed out in. The only hard
//! constraint is that a delta's base must be written (and therefore have
//! a known offset) before the delta itself, so families built by the
//! delta scheduler are always walked root-first. Within that constraint,
//! objects are grouped the way a reader is likely to want them: commits
//! and tags first (untagged ones ahead of ref-tip tags), then trees,
//! then whatever blobs are left.

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::builder::registry::ObjectRegistry;

/// Add a single entry to the write order, without touching its delta
/// family. Mirrors the original's `add_to_write_order`: a no-op if the
/// entry has already been placed.
fn add_single(registry: &mut ObjectRegistry, idx: usize, out: &mut Vec<usize>) {
    if registry.get(idx).filled {
        return;
    }
    registry.get_mut(idx).filled = true;
    out.push(idx);
}

/// Walk an entry's delta descendants in pre-order, adding each to the
/// write order as it's reached. Used only once the whole delta family
/// needs to land together, contiguous in the stream.
fn add_descendants(registry: &mut ObjectRegistry, root: usize, out: &mut Vec<usize>) {
    add_single(registry, root, out);
    let mut sibling = registry.get(root).next_sibling;
    while let Some(s) = sibling {
        add_single(registry, s, out);
        sibling = registry.get(s).next_sibling;
    }

    let mut child = registry.get(root).first_child;
    while let Some(c) = child {
        add_descendants(registry, c, out);
        child = registry.get(c).next_sibling;
    }
}

/// Find the root of `idx`'s delta family (walking `delta_base` links to
/// the object that is stored whole, or is itself still un-resolved),
/// then add the whole family from there.
fn add_family(registry: &mut ObjectRegistry, idx: usize, out: &mut Vec<usize>) {
    let mut root = idx;
    while let Some(base) = registry.get(root).delta_base {
        root = base;
    }
    add_descendants(registry, root, out);
}

/// Compute the order pack entries should be written in.
///
/// `tag_targets` is the set of object ids any `refs/tags/*` ref points at
/// directly (not peeled — an annotated tag object stays a tag object
/// here, it is never resolved to the commit it tags).
///
/// Follows the original's five-pass `compute_write_order`: objects are
/// emitted in raw insertion order up to the first tagged tip
/// (`last_untagged`), then the tagged tips themselves, then — starting
/// back at `last_untagged` — commits and tags, then trees, then
/// whatever's left as whole delta families. With no tagged tips at all
/// (the common case for a full pack) this degenerates to plain
/// insertion order.
pub fn plan_write_order(registry: &mut ObjectRegistry, tag_targets: &[ObjectId]) -> Vec<usize> {
    let len = registry.len();

    for e in registry.entries_mut() {
        e.first_child = None;
        e.next_sibling = None;
        e.filled = false;
        e.tagged = false;
    }

    // Rebuild the delta forest from scratch. Walking registry indices in
    // reverse and pushing each child onto the front of its base's list
    // means the list ends up in ascending (original insertion) order.
    for idx in (0..len).rev() {
        if let Some(base) = registry.get(idx).delta_base {
            registry.attach_child(base, idx);
        }
    }

    for oid in tag_targets {
        if let Some(idx) = registry.index_of(oid) {
            registry.get_mut(idx).tagged = true;
        }
    }

    let mut order = Vec::with_capacity(len);

    // Insertion order until the first tagged tip.
    let mut last_untagged = len;
    for idx in 0..len {
        if registry.get(idx).tagged {
            last_untagged = idx;
            break;
        }
        add_single(registry, idx, &mut order);
    }

    // The tagged tips themselves.
    for idx in last_untagged..len {
        if registry.get(idx).tagged {
            add_single(registry, idx, &mut order);
        }
    }

    // From the cutoff onward: commits and tags, then trees, then the rest.
    for idx in last_untagged..len {
        if matches!(
            registry.get(idx).obj_type,
            ObjectType::Commit | ObjectType::Tag
        ) {
            add_single(registry, idx, &mut order);
        }
    }
    for idx in last_untagged..len {
        if registry.get(idx).obj_type == ObjectType::Tree {
            add_single(registry, idx, &mut order);
        }
    }
    for idx in last_untagged..len {
        if !registry.get(idx).filled {
            add_family(registry, idx, &mut order);
        }
    }

    assert_eq!(
        order.len(),
        len,
        "write-order planner dropped or duplicated an entry"
    );
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::ObjectResolver;
    use crate::PackError;
    use git_hash::HashAlgorithm;
    use std::collections::HashMap;

    struct FakeResolver {
        objects: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    }

    impl ObjectResolver for FakeResolver {
        fn read_object(
            &self,
            oid: &ObjectId,
        ) -> Result<Option<crate::PackedObject>, PackError> {
            Ok(self
                .objects
                .get(oid)
                .map(|(t, d)| crate::PackedObject { obj_type: *t, data: d.clone() }))
        }
        fn read_header(
            &self,
            oid: &ObjectId,
        ) -> Result<Option<(ObjectType, u64)>, PackError> {
            Ok(self.objects.get(oid).map(|(t, d)| (*t, d.len() as u64)))
        }
    }

    fn oid_of(obj_type: ObjectType, data: &[u8]) -> ObjectId {
        git_hash::hasher::Hasher::hash_object(
            HashAlgorithm::Sha1,
            std::str::from_utf8(obj_type.as_bytes()).unwrap(),
            data,
        )
        .unwrap()
    }

    #[test]
    fn base_precedes_its_delta_children_in_emitted_order() {
        let base_data = b"base content here".to_vec();
        let child_data = b"base content here, modified".to_vec();
        let base_oid = oid_of(ObjectType::Blob, &base_data);
        let child_oid = oid_of(ObjectType::Blob, &child_data);

        let mut objects = HashMap::new();
        objects.insert(base_oid, (ObjectType::Blob, base_data));
        objects.insert(child_oid, (ObjectType::Blob, child_data));
        let resolver = FakeResolver { objects };

        let mut registry = ObjectRegistry::new();
        let base_idx = registry.insert(&resolver, base_oid, None).unwrap();
        let child_idx = registry.insert(&resolver, child_oid, None).unwrap();
        registry.get_mut(child_idx).delta_base = Some(base_idx);

        let order = plan_write_order(&mut registry, &[]);
        let base_pos = order.iter().position(|&i| i == base_idx).unwrap();
        let child_pos = order.iter().position(|&i| i == child_idx).unwrap();
        assert!(base_pos < child_pos);
    }

    #[test]
    fn commits_and_tags_precede_trees_and_blobs() {
        // A tagged tip ahead of everything else forces `last_untagged` past
        // index 0, which is what makes the type-grouping passes (rather
        // than plain insertion order) decide the rest of the order.
        let tag_data = b"tagged tip".to_vec();
        let commit_data = b"tree deadbeef\n".to_vec();
        let tree_data = b"tree-bytes".to_vec();
        let blob_data = b"blob-bytes".to_vec();
        let tag_oid = oid_of(ObjectType::Commit, &tag_data);
        let commit_oid = oid_of(ObjectType::Commit, &commit_data);
        let tree_oid = oid_of(ObjectType::Tree, &tree_data);
        let blob_oid = oid_of(ObjectType::Blob, &blob_data);

        let mut objects = HashMap::new();
        objects.insert(tag_oid, (ObjectType::Commit, tag_data));
        objects.insert(blob_oid, (ObjectType::Blob, blob_data));
        objects.insert(tree_oid, (ObjectType::Tree, tree_data));
        objects.insert(commit_oid, (ObjectType::Commit, commit_data));
        let resolver = FakeResolver { objects };

        let mut registry = ObjectRegistry::new();
        // Insert in an order that would be wrong if the planner didn't reorder.
        registry.insert(&resolver, tag_oid, None).unwrap();
        let blob_idx = registry.insert(&resolver, blob_oid, None).unwrap();
        let tree_idx = registry.insert(&resolver, tree_oid, None).unwrap();
        let commit_idx = registry.insert(&resolver, commit_oid, None).unwrap();

        let order = plan_write_order(&mut registry, &[tag_oid]);
        let pos = |idx: usize| order.iter().position(|&i| i == idx).unwrap();
        assert!(pos(commit_idx) < pos(tree_idx));
        assert!(pos(tree_idx) < pos(blob_idx));
    }

    #[test]
    fn untagged_commits_precede_tagged_tips() {
        let a_data = b"commit a".to_vec();
        let b_data = b"commit b".to_vec();
        let a_oid = oid_of(ObjectType::Commit, &a_data);
        let b_oid = oid_of(ObjectType::Commit, &b_data);

        let mut objects = HashMap::new();
        objects.insert(a_oid, (ObjectType::Commit, a_data));
        objects.insert(b_oid, (ObjectType::Commit, b_data));
        let resolver = FakeResolver { objects };

        let mut registry = ObjectRegistry::new();
        let a_idx = registry.insert(&resolver, a_oid, None).unwrap();
        let b_idx = registry.insert(&resolver, b_oid, None).unwrap();

        // b is the target of a tag; a is not reachable from any tag.
        let order = plan_write_order(&mut registry, &[b_oid]);
        let pos = |idx: usize| order.iter().position(|&i| i == idx).unwrap();
        assert!(pos(a_idx) < pos(b_idx));
    }

    #[test]
    fn every_entry_is_emitted_exactly_once() {
        let mut objects = HashMap::new();
        let mut oids = Vec::new();
        for i in 0..20u8 {
            let data = vec![i; 64];
            let oid = oid_of(ObjectType::Blob, &data);
            objects.insert(oid, (ObjectType::Blob, data));
            oids.push(oid);
        }
        let resolver = FakeResolver { objects };
        let mut registry = ObjectRegistry::new();
        for oid in &oids {
            registry.insert(&resolver, *oid, None).unwrap();
        }

        let order = plan_write_order(&mut registry, &[]);
        assert_eq!(order.len(), registry.len());
        let mut seen = std::collections::HashSet::new();
        for idx in order {
            assert!(seen.insert(idx), "entry {idx} emitted twice");
        }
    }
}
