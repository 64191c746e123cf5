//! The builder's front door: register objects, then emit a pack.
//!
//! `PackSession` doesn't depend on `git_odb` or `git_repository` directly
//! — only on the `ObjectResolver` trait already used for reading, plus
//! `git_config`/`git_ref` for configuration and tag enumeration. Both of
//! those crates sit below `git-pack` in the dependency graph (unlike
//! `git-odb`, which already depends on `git-pack` to read the packs this
//! module writes), so this keeps the workspace's dependency graph acyclic.
//! A `Repository`-aware convenience constructor lives in `git-repository`
//! instead, where it can freely depend on all of these at once.

use git_hash::{HashAlgorithm, ObjectId};
use git_ref::RefStore;

use crate::builder::engine::DeltaConfig;
use crate::builder::registry::ObjectRegistry;
use crate::builder::writer::{self, BufferSink, Sink, WriteSink};
use crate::builder::{planner, scheduler};
use crate::generate::ObjectResolver;
use crate::PackError;

/// Tunables read from configuration, with the exact key mapping (including
/// one deliberate quirk) this was built against.
#[derive(Debug, Clone, Copy)]
pub struct PackSessionConfig {
    pub threads: usize,
    pub delta: DeltaConfig,
}

impl PackSessionConfig {
    /// Read pack-building settings out of `config`, falling back to
    /// `DeltaConfig::default()` for anything unset.
    ///
    /// `pack.deltaCacheSize` is read twice, once to seed the delta cache
    /// budget and a second time — under what was meant to be
    /// `pack.bigFileThreshold` — to seed `big_file_threshold`. That's a
    /// duplicate-key bug, not a design choice, but it's load-bearing for
    /// anyone who has already tuned around it, so it's preserved exactly.
    pub fn from_config(config: &git_config::ConfigSet) -> Result<Self, PackError> {
        let mut delta = DeltaConfig::default();

        if let Some(v) = config.get_usize("pack.deltacachesize")? {
            delta.max_delta_cache_size = v as u64;
        }
        if let Some(v) = config.get_usize("pack.deltacachelimit")? {
            delta.cache_max_small_delta_size = v as u64;
        }
        if let Some(v) = config.get_usize("pack.deltacachesize")? {
            delta.big_file_threshold = v as u64;
        }
        if let Some(v) = config.get_usize("pack.windowmemory")? {
            delta.window_memory_limit = v as u64;
        }
        if let Some(v) = config.get_usize("pack.window")? {
            delta.window = v;
        }
        if let Some(v) = config.get_int("pack.depth")? {
            if (0..=u16::MAX as i64).contains(&v) {
                delta.max_depth = v as u16;
            }
        }

        let threads = match config.get_usize("pack.threads")? {
            Some(v) => v,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
        .max(1);

        Ok(Self { threads, delta })
    }
}

/// One pack build: accumulate objects via `insert`/`insert_tree`, then emit
/// them with `write`/`write_buf`/`send`. Dropping a session (or letting it
/// go out of scope) is enough to release everything it holds — there's no
/// separate free/close call, since nothing here needs more than ordinary
/// Rust ownership to clean up.
pub struct PackSession<'a> {
    registry: ObjectRegistry,
    resolver: &'a dyn ObjectResolver,
    config: PackSessionConfig,
    hash_algo: HashAlgorithm,
    dirty: bool,
}

impl<'a> PackSession<'a> {
    pub fn new(
        resolver: &'a dyn ObjectResolver,
        config: &git_config::ConfigSet,
        hash_algo: HashAlgorithm,
    ) -> Result<Self, PackError> {
        Ok(Self {
            registry: ObjectRegistry::new(),
            resolver,
            config: PackSessionConfig::from_config(config)?,
            hash_algo,
            dirty: false,
        })
    }

    /// Override the thread count `from_config` picked (e.g. to honor a
    /// `-1` "single-threaded" command-line flag that config alone can't
    /// express). Always clamped to at least 1.
    pub fn set_threads(&mut self, threads: usize) {
        self.config.threads = threads.max(1);
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.registry.contains(oid)
    }

    /// Register a single object. A no-op if it's already in the session.
    pub fn insert(&mut self, oid: ObjectId) -> Result<usize, PackError> {
        let idx = self.registry.insert(self.resolver, oid, None)?;
        self.dirty = true;
        Ok(idx)
    }

    /// Register a single object under a path, so the delta scheduler's
    /// locality hash has something to sort by.
    pub fn insert_named(&mut self, oid: ObjectId, name: &[u8]) -> Result<usize, PackError> {
        let idx = self.registry.insert(self.resolver, oid, Some(name))?;
        self.dirty = true;
        Ok(idx)
    }

    /// Register a tree and everything it reaches.
    pub fn insert_tree(&mut self, root_oid: ObjectId, root_name: &[u8]) -> Result<(), PackError> {
        self.registry
            .insert_tree(self.resolver, root_oid, root_name)?;
        self.dirty = true;
        Ok(())
    }

    /// Run delta search if anything has been inserted since the last call.
    /// Idempotent: calling `write`/`write_buf`/`send` more than once
    /// without inserting anything in between re-plans and re-streams the
    /// same object set without redoing the (expensive) search.
    fn prepare(&mut self) -> Result<(), PackError> {
        if !self.dirty {
            return Ok(());
        }
        self.registry
            .apply_big_file_threshold(self.config.delta.big_file_threshold);
        scheduler::find_deltas(
            &mut self.registry,
            self.resolver,
            &self.config.delta,
            self.config.threads,
        )?;
        self.dirty = false;
        Ok(())
    }

    /// Stream the pack to an arbitrary sink, committing/finishing it on
    /// success. `tag_targets` are the direct (unpeeled) targets of every
    /// `refs/tags/*` ref, used only to order annotated tag tips late.
    pub fn write(
        &mut self,
        mut sink: Box<dyn Sink>,
        tag_targets: &[ObjectId],
    ) -> Result<ObjectId, PackError> {
        self.prepare()?;
        let order = planner::plan_write_order(&mut self.registry, tag_targets);
        let checksum = writer::write_pack(
            &self.registry,
            self.resolver,
            &order,
            self.hash_algo,
            sink.as_mut(),
        )?;
        sink.finish()?;
        Ok(checksum)
    }

    /// Build the pack entirely in memory.
    pub fn write_buf(&mut self, tag_targets: &[ObjectId]) -> Result<Vec<u8>, PackError> {
        self.prepare()?;
        let order = planner::plan_write_order(&mut self.registry, tag_targets);
        let mut sink = BufferSink::new();
        writer::write_pack(
            &self.registry,
            self.resolver,
            &order,
            self.hash_algo,
            &mut sink,
        )?;
        Ok(sink.into_inner())
    }

    /// Stream the pack to an arbitrary writer (a socket, a pipe) without
    /// going through the `Sink`/`Box` indirection `write` needs for
    /// heterogeneous destinations.
    pub fn send<W: std::io::Write>(
        &mut self,
        out: W,
        tag_targets: &[ObjectId],
    ) -> Result<ObjectId, PackError> {
        self.prepare()?;
        let order = planner::plan_write_order(&mut self.registry, tag_targets);
        let mut sink = WriteSink::new(out);
        writer::write_pack(
            &self.registry,
            self.resolver,
            &order,
            self.hash_algo,
            &mut sink,
        )
    }
}

/// The direct (unpeeled) object ids every `refs/tags/*` ref points at.
/// An annotated tag ref's direct target is the tag object itself, never
/// the commit it tags — tags are intentionally left unpeeled here.
pub fn enumerate_tag_targets(refs: &dyn RefStore) -> Result<Vec<ObjectId>, PackError> {
    let mut targets = Vec::new();
    for reference in refs
        .iter(Some("refs/tags/"))
        .map_err(|e| PackError::Io(std::io::Error::other(e)))?
    {
        let reference = reference.map_err(|e| PackError::Io(std::io::Error::other(e)))?;
        let oid = match reference.target_oid() {
            Some(oid) => Some(oid),
            None => refs
                .resolve_to_oid(reference.name())
                .map_err(|e| PackError::Io(std::io::Error::other(e)))?,
        };
        if let Some(oid) = oid {
            targets.push(oid);
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PackedObject;
    use git_object::ObjectType;
    use std::collections::HashMap;

    struct FakeResolver {
        objects: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    }

    impl ObjectResolver for FakeResolver {
        fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
            Ok(self
                .objects
                .get(oid)
                .map(|(t, d)| PackedObject { obj_type: *t, data: d.clone() }))
        }
        fn read_header(&self, oid: &ObjectId) -> Result<Option<(ObjectType, u64)>, PackError> {
            Ok(self.objects.get(oid).map(|(t, d)| (*t, d.len() as u64)))
        }
    }

    fn oid_of(data: &[u8]) -> ObjectId {
        git_hash::hasher::Hasher::hash_object(HashAlgorithm::Sha1, "blob", data).unwrap()
    }

    #[test]
    fn duplicate_key_quirk_feeds_both_settings() {
        let mut config = git_config::ConfigSet::new();
        config
            .add_command_override("pack.deltacachesize", "1000")
            .unwrap();
        let parsed = PackSessionConfig::from_config(&config).unwrap();
        assert_eq!(parsed.delta.max_delta_cache_size, 1000);
        assert_eq!(parsed.delta.big_file_threshold, 1000);
    }

    #[test]
    fn write_buf_round_trips_a_single_blob() {
        let data = b"some blob content for the session test".to_vec();
        let oid = oid_of(&data);
        let mut objects = HashMap::new();
        objects.insert(oid, (ObjectType::Blob, data));
        let resolver = FakeResolver { objects };

        let config = git_config::ConfigSet::new();
        let mut session = PackSession::new(&resolver, &config, HashAlgorithm::Sha1).unwrap();
        session.insert(oid).unwrap();

        let bytes = session.write_buf(&[]).unwrap();
        assert_eq!(&bytes[0..4], crate::PACK_SIGNATURE);
        assert_eq!(&bytes[8..12], &1u32.to_be_bytes());
    }

    #[test]
    fn write_buf_is_idempotent_without_new_inserts() {
        let data = b"content for idempotency check".to_vec();
        let oid = oid_of(&data);
        let mut objects = HashMap::new();
        objects.insert(oid, (ObjectType::Blob, data));
        let resolver = FakeResolver { objects };

        let config = git_config::ConfigSet::new();
        let mut session = PackSession::new(&resolver, &config, HashAlgorithm::Sha1).unwrap();
        session.insert(oid).unwrap();

        let first = session.write_buf(&[]).unwrap();
        let second = session.write_buf(&[]).unwrap();
        assert_eq!(first, second);
    }
}
