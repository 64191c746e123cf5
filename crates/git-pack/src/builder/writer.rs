//! Streaming pack writer.
//!
//! Takes a planned write order and streams the pack bytes straight to a
//! [`Sink`], hashing as it goes rather than buffering the whole pack to
//! recompute a checksum afterward — the same rolling-hash approach
//! `write::PackWriter` uses, but without needing a seekable file to fix
//! up the object count (the object count is already known up front here,
//! since the full set was registered before writing started).

use std::io::Write as _;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;

use crate::builder::registry::ObjectRegistry;
use crate::entry::encode_entry_header;
use crate::generate::ObjectResolver;
use crate::{PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

/// Destination for pack bytes. Implementations decide what "done" means:
/// an in-memory buffer has nothing to finalize, a file needs its lock
/// committed, a network socket might need a final flush.
pub trait Sink {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), PackError>;
    fn finish(self: Box<Self>) -> Result<(), PackError>;
}

/// Collects the pack into memory. Useful for tests and for transports
/// that want the whole pack before sending it.
pub struct BufferSink {
    buf: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for BufferSink {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), PackError> {
        Ok(())
    }
}

/// Writes a pack straight to `<path>.pack` via the repository's lock file
/// protocol: visible only once `finish()` commits, cleaned up automatically
/// if the writer is dropped (or the build fails) beforehand.
pub struct FileSink {
    lock: git_utils::lockfile::LockFile,
}

impl FileSink {
    pub fn create(target_path: impl AsRef<std::path::Path>) -> Result<Self, PackError> {
        let lock = git_utils::lockfile::LockFile::acquire(target_path)
            .map_err(|e| PackError::Io(std::io::Error::other(e)))?;
        Ok(Self { lock })
    }
}

impl Sink for FileSink {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.lock.write_all(data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), PackError> {
        self.lock
            .commit()
            .map_err(|e| PackError::Io(std::io::Error::other(e)))
    }
}

/// Wraps any `std::io::Write` — a socket, a pipe, whatever the network
/// layer hands us.
pub struct WriteSink<W: std::io::Write> {
    inner: W,
}

impl<W: std::io::Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: std::io::Write> Sink for WriteSink<W> {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.inner.write_all(data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), PackError> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Pending,
    Writing,
    Done,
}

struct PackStreamWriter<'a> {
    registry: &'a ObjectRegistry,
    resolver: &'a dyn ObjectResolver,
    hasher: Hasher,
    position: u64,
    state: Vec<WriteState>,
}

impl<'a> PackStreamWriter<'a> {
    fn emit(&mut self, data: &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        sink.write_bytes(data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }

    /// Write `idx` (and, recursively, its delta base first if it has one
    /// and hasn't been written yet). `Writing` re-encountered mid-recursion
    /// means the delta chain cycles back on itself — a corrupt registry,
    /// not something a well-formed build can produce, so it's reported as
    /// a fatal delta error rather than silently breaking the cycle.
    fn write_one(&mut self, idx: usize, sink: &mut dyn Sink) -> Result<(), PackError> {
        match self.state[idx] {
            WriteState::Done => return Ok(()),
            WriteState::Writing => {
                let oid = self.registry.get(idx).oid;
                return Err(PackError::InvalidDelta {
                    offset: self.position,
                    reason: format!("cyclic delta chain detected at {oid}"),
                });
            }
            WriteState::Pending => {}
        }
        self.state[idx] = WriteState::Writing;

        let oid = self.registry.get(idx).oid;
        let delta_base = self.registry.get(idx).delta_base;

        if let Some(base_idx) = delta_base {
            self.write_one(base_idx, sink)?;
        }

        let entry = self.registry.get(idx);
        let obj_type = entry.obj_type;
        let cached_delta = entry.delta_bytes.clone();
        // The header's size field is always the *uncompressed* length —
        // the delta instruction stream's length for a delta record, the
        // full object's length for a base record — never the length of
        // whatever bytes end up on the wire.
        let uncompressed_size = match delta_base {
            Some(_) => entry.delta_size,
            None => entry.size,
        };

        // `payload_compressed` is `None` when the bytes still need
        // deflating here; `Some` when the scheduler already cached them
        // deflated during the threaded search phase, so the write phase
        // only has to copy them onto the wire.
        let payload_compressed = match delta_base {
            Some(_) => cached_delta,
            None => None,
        };

        let header = match delta_base {
            Some(_) => encode_entry_header(7, uncompressed_size), // REF_DELTA
            None => {
                let type_num = match obj_type {
                    ObjectType::Commit => 1,
                    ObjectType::Tree => 2,
                    ObjectType::Blob => 3,
                    ObjectType::Tag => 4,
                };
                encode_entry_header(type_num, uncompressed_size)
            }
        };
        self.emit(&header, sink)?;

        if let Some(base_idx) = delta_base {
            let base_oid = self.registry.get(base_idx).oid;
            self.emit(base_oid.as_bytes(), sink)?;
        }

        match payload_compressed {
            Some(bytes) => self.emit(&bytes, sink)?,
            None => {
                let inflated = match delta_base {
                    Some(base_idx) => {
                        let base_oid = self.registry.get(base_idx).oid;
                        let base_obj = self
                            .resolver
                            .read_object(&base_oid)?
                            .ok_or(PackError::MissingBase(base_oid))?;
                        let target_obj = self
                            .resolver
                            .read_object(&oid)?
                            .ok_or(PackError::MissingBase(oid))?;
                        crate::delta::compute::compute_delta(&base_obj.data, &target_obj.data)
                    }
                    None => {
                        self.resolver
                            .read_object(&oid)?
                            .ok_or(PackError::MissingBase(oid))?
                            .data
                    }
                };

                let mut compressed = Vec::new();
                {
                    let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
                    encoder.write_all(&inflated)?;
                    encoder.finish()?;
                }
                self.emit(&compressed, sink)?;
            }
        }

        self.state[idx] = WriteState::Done;
        Ok(())
    }
}

/// Stream a full pack — header, every entry in `order`, trailing checksum
/// — to `sink`. Returns the pack's checksum; the caller still needs to
/// call `sink.finish()` to make the write durable/visible.
pub fn write_pack(
    registry: &ObjectRegistry,
    resolver: &dyn ObjectResolver,
    order: &[usize],
    hash_algo: HashAlgorithm,
    sink: &mut dyn Sink,
) -> Result<ObjectId, PackError> {
    let mut writer = PackStreamWriter {
        registry,
        resolver,
        hasher: Hasher::new(hash_algo),
        position: 0,
        state: vec![WriteState::Pending; registry.len()],
    };

    let mut header = [0u8; PACK_HEADER_SIZE];
    header[0..4].copy_from_slice(PACK_SIGNATURE);
    header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
    header[8..12].copy_from_slice(&(order.len() as u32).to_be_bytes());
    writer.emit(&header, sink)?;

    for &idx in order {
        writer.write_one(idx, sink)?;
    }

    let checksum = writer.hasher.finalize().map_err(PackError::Hash)?;
    sink.write_bytes(checksum.as_bytes())?;
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::planner::plan_write_order;
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

    fn oid_of(data: &[u8]) -> ObjectId {
        Hasher::hash_object(HashAlgorithm::Sha1, "blob", data).unwrap()
    }

    #[test]
    fn writes_header_and_trailer() {
        let data = b"hello, packed world".to_vec();
        let oid = oid_of(&data);
        let mut objects = HashMap::new();
        objects.insert(oid, (ObjectType::Blob, data));
        let resolver = FakeResolver { objects };

        let mut registry = ObjectRegistry::new();
        registry.insert(&resolver, oid, None).unwrap();
        let order = plan_write_order(&mut registry, &[]);

        let mut sink = BufferSink::new();
        let checksum = write_pack(&registry, &resolver, &order, HashAlgorithm::Sha1, &mut sink)
            .unwrap();

        let bytes = sink.into_inner();
        assert_eq!(&bytes[0..4], PACK_SIGNATURE);
        assert_eq!(&bytes[4..8], &PACK_VERSION.to_be_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - checksum.as_bytes().len()..], checksum.as_bytes());
    }

    #[test]
    fn cyclic_delta_links_are_rejected_not_looped() {
        let a_data = b"object a content, long enough".to_vec();
        let b_data = b"object b content, long enough".to_vec();
        let a_oid = oid_of(&a_data);
        let b_oid = oid_of(&b_data);

        let mut objects = HashMap::new();
        objects.insert(a_oid, (ObjectType::Blob, a_data));
        objects.insert(b_oid, (ObjectType::Blob, b_data));
        let resolver = FakeResolver { objects };

        let mut registry = ObjectRegistry::new();
        let a_idx = registry.insert(&resolver, a_oid, None).unwrap();
        let b_idx = registry.insert(&resolver, b_oid, None).unwrap();
        // Deliberately construct an impossible cycle the scheduler would
        // never produce, to exercise the writer's own guard.
        registry.get_mut(a_idx).delta_base = Some(b_idx);
        registry.get_mut(b_idx).delta_base = Some(a_idx);

        let mut sink = BufferSink::new();
        let result = write_pack(
            &registry,
            &resolver,
            &[a_idx, b_idx],
            HashAlgorithm::Sha1,
            &mut sink,
        );
        assert!(matches!(result, Err(PackError::InvalidDelta { .. })));
    }

    #[test]
    fn roundtrips_through_a_real_pack_file() {
        let dir = tempfile::tempdir().unwrap();
        let base_data = b"Hello, this is the base content for our delta test!".to_vec();
        let target_data =
            b"Hello, this is the modified content for our delta test, it's longer!".to_vec();
        let base_oid = oid_of(&base_data);
        let target_oid = oid_of(&target_data);

        let mut objects = HashMap::new();
        objects.insert(base_oid, (ObjectType::Blob, base_data.clone()));
        objects.insert(target_oid, (ObjectType::Blob, target_data.clone()));
        let resolver = FakeResolver { objects };

        let mut registry = ObjectRegistry::new();
        let base_idx = registry.insert(&resolver, base_oid, None).unwrap();
        let target_idx = registry.insert(&resolver, target_oid, None).unwrap();
        let delta = crate::delta::compute::compute_delta(&base_data, &target_data);
        registry.get_mut(target_idx).delta_base = Some(base_idx);
        registry.get_mut(target_idx).delta_size = delta.len() as u64;
        // The writer expects cached `delta_bytes` to already be deflated,
        // matching what the scheduler caches during the search phase.
        let mut compressed_delta = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed_delta, Compression::default());
            encoder.write_all(&delta).unwrap();
            encoder.finish().unwrap();
        }
        registry.get_mut(target_idx).delta_bytes = Some(compressed_delta);

        let order = plan_write_order(&mut registry, &[]);

        let path = dir.path().join("stream.pack");
        let mut sink = FileSink::create(&path).unwrap();
        write_pack(&registry, &resolver, &order, HashAlgorithm::Sha1, &mut sink).unwrap();
        Box::new(sink).finish().unwrap();

        let pack = crate::pack::PackFile::open(&path).unwrap();
        assert_eq!(pack.num_objects(), 2);
        let base_obj = pack.read_object(&base_oid).unwrap().unwrap();
        assert_eq!(base_obj.data, base_data);
        let target_obj = pack.read_object(&target_oid).unwrap().unwrap();
        assert_eq!(target_obj.data, target_data);
    }
}
