//! Parallel delta search.
//!
//! Sorts candidate objects so similar ones sit near each other, then slides
//! a small window over them looking for delta bases. Single-threaded, this
//! is one straight pass; with more than one thread, the sorted list is cut
//! into per-worker chunks and idle workers steal half of a busy peer's
//! remaining chunk, recursively, until the list is exhausted.

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::sync::{Condvar, Mutex};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_object::ObjectType;

use crate::builder::engine::{self, CandidateInfo, CurrentBest, DeltaConfig, TryDeltaOutcome};
use crate::builder::registry::{ObjectRegistry, PackObjectEntry};
use crate::delta::index::DeltaIndex;
use crate::generate::ObjectResolver;
use crate::PackError;

/// Objects smaller than this are never worth the overhead of delta search.
const MIN_DELTA_CANDIDATE_SIZE: u64 = 50;

fn type_rank(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    }
}

/// A candidate pulled out of the registry for the sort/search pass.
/// Mutated in place as deltas are chosen; `registry_idx` is the only link
/// back to the entry it came from, so `delta_base` here already refers to
/// a registry index rather than a position in this scratch list.
#[derive(Clone)]
struct ScratchEntry {
    registry_idx: usize,
    obj_type: ObjectType,
    size: u64,
    name_hash: u32,
    depth: u16,
    delta_base: Option<usize>,
    delta_size: u64,
    delta_bytes: Option<Vec<u8>>,
}

impl ScratchEntry {
    fn from_registry(idx: usize, e: &PackObjectEntry) -> Self {
        Self {
            registry_idx: idx,
            obj_type: e.obj_type,
            size: e.size,
            name_hash: e.name_hash,
            depth: e.depth,
            delta_base: None,
            delta_size: 0,
            delta_bytes: None,
        }
    }
}

fn build_candidates(registry: &ObjectRegistry) -> Vec<ScratchEntry> {
    let mut v: Vec<ScratchEntry> = registry
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.size >= MIN_DELTA_CANDIDATE_SIZE && !e.no_try_delta)
        .map(|(i, e)| ScratchEntry::from_registry(i, e))
        .collect();

    // Descending by (type, name_hash, size), ties broken by newest-first
    // (higher registry index = inserted more recently).
    v.sort_by(|a, b| {
        type_rank(b.obj_type)
            .cmp(&type_rank(a.obj_type))
            .then(b.name_hash.cmp(&a.name_hash))
            .then(b.size.cmp(&a.size))
            .then(b.registry_idx.cmp(&a.registry_idx))
    });
    v
}

/// Running total of cached delta bytes, shared across workers.
struct CacheState {
    size: u64,
}

/// Decide whether a freshly-accepted delta is worth caching and, if so,
/// deflate it right now rather than leaving that work for the write
/// phase — cheaper here since it happens off the hot single-threaded
/// write path, across however many search workers are running. Tracks
/// `delta_cache_size` by the compressed length, since that's what
/// actually sits in memory once cached (the acceptance decision itself
/// still goes by `delta_cacheable`'s uncompressed-length formula).
fn try_cache(
    cache: &Mutex<CacheState>,
    config: &DeltaConfig,
    src_size: u64,
    trg_size: u64,
    delta: &[u8],
) -> Result<Option<Vec<u8>>, PackError> {
    let delta_size = delta.len() as u64;
    let current = cache.lock().unwrap().size;
    if !engine::delta_cacheable(config, current, src_size, trg_size, delta_size) {
        return Ok(None);
    }

    let mut compressed = Vec::new();
    {
        let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
        encoder.write_all(delta)?;
        encoder.finish()?;
    }

    let mut guard = cache.lock().unwrap();
    guard.size += compressed.len() as u64;
    Ok(Some(compressed))
}

struct WindowSlot {
    entry: ScratchEntry,
    data: Vec<u8>,
    index: Option<DeltaIndex>,
    mem: u64,
}

/// Per-worker sliding window plus the bookkeeping a single worker needs to
/// run it: the forest formed purely by *this worker's* accepted deltas
/// (used only for the "don't bother, descendants would bust max_depth
/// anyway" pruning heuristic) and the list of entries evicted from the
/// window so far, which is this worker's contribution to the final result.
struct WindowState {
    slots: Vec<Option<WindowSlot>>,
    cursor: usize,
    count: usize,
    mem_usage: u64,
    children: HashMap<usize, Vec<usize>>,
    processed: Vec<ScratchEntry>,
}

impl WindowState {
    fn new(window: usize, capacity_hint: usize) -> Self {
        Self {
            slots: (0..window.max(1)).map(|_| None).collect(),
            cursor: 0,
            count: 0,
            mem_usage: 0,
            children: HashMap::new(),
            processed: Vec::with_capacity(capacity_hint),
        }
    }

    fn flush(mut self) -> Vec<ScratchEntry> {
        for slot in self.slots.drain(..).flatten() {
            self.processed.push(slot.entry);
        }
        self.processed
    }
}

fn max_subtree_depth(children: &HashMap<usize, Vec<usize>>, root: usize) -> u16 {
    match children.get(&root) {
        None => 0,
        Some(kids) => {
            1 + kids
                .iter()
                .map(|&k| max_subtree_depth(children, k))
                .max()
                .unwrap_or(0)
        }
    }
}

fn load_payload(
    resolver: &dyn ObjectResolver,
    registry: &ObjectRegistry,
    registry_idx: usize,
) -> Result<Vec<u8>, PackError> {
    let entry = registry.get(registry_idx);
    let obj = resolver
        .read_object(&entry.oid)?
        .ok_or_else(|| PackError::InvalidObject {
            oid: entry.oid,
            reason: "object vanished from the database during pack build".into(),
        })?;
    if obj.data.len() as u64 != entry.size {
        return Err(PackError::InvalidObject {
            oid: entry.oid,
            reason: format!(
                "size mismatch: registry says {}, object database says {}",
                entry.size,
                obj.data.len()
            ),
        });
    }
    Ok(obj.data)
}

/// Move the chosen base slot so it sits immediately before `cursor` —
/// the position that will be checked first the next time this worker
/// looks for a delta base, since it already proved useful once.
fn rotate_to_front(slots: &mut [Option<WindowSlot>], cursor: usize, best: usize) {
    if best == cursor {
        return;
    }
    let window = slots.len();
    let mut dist = (window + cursor - best) % window;
    let mut dst = best;
    let swap = slots[best].take();
    while dist > 0 {
        dist -= 1;
        let src = (dst + 1) % window;
        slots[dst] = slots[src].take();
        dst = src;
    }
    slots[dst] = swap;
}

fn process_one(
    state: &mut WindowState,
    mut n: ScratchEntry,
    registry: &ObjectRegistry,
    resolver: &dyn ObjectResolver,
    config: &DeltaConfig,
    cache: &Mutex<CacheState>,
) -> Result<(), PackError> {
    let window = state.slots.len();
    let cursor = state.cursor;

    if let Some(old) = state.slots[cursor].take() {
        state.mem_usage = state.mem_usage.saturating_sub(old.mem);
        state.count = state.count.saturating_sub(1);
        state.processed.push(old.entry);
    }

    if config.window_memory_limit > 0 {
        let mut j = (cursor + 1) % window;
        while state.mem_usage > config.window_memory_limit && state.count > 1 && j != cursor {
            if let Some(old) = state.slots[j].take() {
                state.mem_usage = state.mem_usage.saturating_sub(old.mem);
                state.count = state.count.saturating_sub(1);
                state.processed.push(old.entry);
            }
            j = (j + 1) % window;
        }
    }

    let prune = max_subtree_depth(&state.children, n.registry_idx);
    let effective_depth_budget = config.max_depth as i32 - prune as i32;

    if effective_depth_budget > 0 {
        let target_data = load_payload(resolver, registry, n.registry_idx)?;
        let target_info = CandidateInfo {
            obj_type: n.obj_type,
            size: n.size,
            depth: n.depth,
        };
        let mut current = CurrentBest {
            has_delta: n.delta_base.is_some(),
            delta_size: n.delta_size,
            depth: n.depth,
        };
        let mut chosen: Option<(usize, Vec<u8>, u16)> = None;

        'search: for j in (1..window).rev() {
            let sidx = (cursor + j) % window;
            let Some(slot) = state.slots[sidx].as_mut() else {
                break 'search;
            };
            if slot.index.is_none() {
                slot.index = Some(DeltaIndex::new(&slot.data));
            }
            let source_info = CandidateInfo {
                obj_type: slot.entry.obj_type,
                size: slot.entry.size,
                depth: slot.entry.depth,
            };
            match engine::try_delta(
                target_info,
                &target_data,
                current,
                source_info,
                &slot.data,
                slot.index.as_ref().unwrap(),
                config,
            ) {
                TryDeltaOutcome::TypeMismatch => break 'search,
                TryDeltaOutcome::NotBetter => continue,
                TryDeltaOutcome::Accepted { delta, new_depth } => {
                    current = CurrentBest {
                        has_delta: true,
                        delta_size: delta.len() as u64,
                        depth: new_depth,
                    };
                    chosen = Some((sidx, delta, new_depth));
                }
            }
        }

        if let Some((sidx, delta, new_depth)) = chosen {
            let base = &state.slots[sidx].as_ref().unwrap().entry;
            let base_registry_idx = base.registry_idx;
            let base_size = base.size;
            let delta_size = delta.len() as u64;

            n.delta_base = Some(base_registry_idx);
            n.delta_size = delta_size;
            n.depth = new_depth;
            state
                .children
                .entry(base_registry_idx)
                .or_default()
                .push(n.registry_idx);

            n.delta_bytes = try_cache(cache, config, base_size, n.size, &delta)?;

            if n.depth < config.max_depth {
                rotate_to_front(&mut state.slots, cursor, sidx);
            }
        }

        if n.depth >= config.max_depth && n.delta_base.is_some() {
            // This object can never again be useful as someone else's
            // base: no descendant could stay within max_depth. Drop it
            // from the window entirely rather than keeping a dead slot.
            state.processed.push(n);
            state.cursor = (cursor + 1) % window;
            return Ok(());
        }

        let mem = target_data.len() as u64;
        state.mem_usage += mem;
        state.slots[cursor] = Some(WindowSlot {
            entry: n,
            data: target_data,
            index: None,
            mem,
        });
        state.count += 1;
    } else {
        // Pruned without comparing: still occupies a slot so it remains
        // available as a future delta source.
        let target_data = load_payload(resolver, registry, n.registry_idx)?;
        let mem = target_data.len() as u64;
        state.mem_usage += mem;
        state.slots[cursor] = Some(WindowSlot {
            entry: n,
            data: target_data,
            index: None,
            mem,
        });
        state.count += 1;
    }

    state.cursor = (cursor + 1) % window;
    Ok(())
}

fn run_window(
    chunk: Vec<ScratchEntry>,
    registry: &ObjectRegistry,
    resolver: &dyn ObjectResolver,
    config: &DeltaConfig,
    cache: &Mutex<CacheState>,
) -> Result<Vec<ScratchEntry>, PackError> {
    let mut state = WindowState::new(config.window, chunk.len());
    for n in chunk {
        process_one(&mut state, n, registry, resolver, config, cache)?;
    }
    Ok(state.flush())
}

struct WorkerQueue {
    queue: VecDeque<ScratchEntry>,
    done: bool,
}

struct WorkerHandle {
    state: Mutex<WorkerQueue>,
    cv: Condvar,
}

struct Progress {
    idle: Vec<bool>,
    finished: usize,
}

/// Split `order` into up to `nr_threads` contiguous chunks, never
/// splitting a run of entries that share a (nonzero) name_hash, and
/// zeroing out chunks too small to be worth a thread (except the last).
fn partition(order: &[ScratchEntry], nr_threads: usize, window: usize) -> Vec<(usize, usize)> {
    let n = order.len();
    let mut bounds = Vec::with_capacity(nr_threads);
    let mut start = 0usize;
    for i in 0..nr_threads {
        let threads_left = nr_threads - i;
        let remaining = n - start;
        let mut len = remaining / threads_left;
        if len < 2 * window && i + 1 != nr_threads {
            len = 0;
        }
        bounds.push((start, start + len));
        start += len;
    }

    for i in 0..bounds.len().saturating_sub(1) {
        let mut end = bounds[i].1;
        while end > 0
            && end < n
            && order[end - 1].name_hash != 0
            && order[end - 1].name_hash == order[end].name_hash
        {
            end += 1;
        }
        bounds[i].1 = end;
        bounds[i + 1].0 = end;
    }

    bounds.into_iter().filter(|(s, e)| s < e).collect()
}

fn steal_half(queue: &mut VecDeque<ScratchEntry>) -> VecDeque<ScratchEntry> {
    let len = queue.len();
    let mut mid = len / 2;
    while mid < len {
        if queue[mid - 1].name_hash != 0 && queue[mid - 1].name_hash == queue[mid].name_hash {
            mid += 1;
        } else {
            break;
        }
    }
    if mid >= len {
        mid = len / 2;
    }
    queue.split_off(mid)
}

#[allow(clippy::too_many_arguments)]
fn run_parallel(
    order: Vec<ScratchEntry>,
    registry: &ObjectRegistry,
    resolver: &dyn ObjectResolver,
    config: &DeltaConfig,
    cache: &Mutex<CacheState>,
    nr_threads: usize,
) -> Result<Vec<ScratchEntry>, PackError> {
    let chunks = partition(&order, nr_threads, config.window);
    if chunks.len() <= 1 {
        return run_window(order, registry, resolver, config, cache);
    }

    let handles: Vec<WorkerHandle> = chunks
        .iter()
        .map(|&(s, e)| WorkerHandle {
            state: Mutex::new(WorkerQueue {
                queue: order[s..e].iter().cloned().collect(),
                done: false,
            }),
            cv: Condvar::new(),
        })
        .collect();
    let num_workers = handles.len();
    let progress = Mutex::new(Progress {
        idle: vec![false; num_workers],
        finished: 0,
    });
    let progress_cv = Condvar::new();

    let worker_fn = |wid: usize| -> Result<Vec<ScratchEntry>, PackError> {
        let mut win = WindowState::new(config.window, order.len() / num_workers + 1);
        loop {
            let item = {
                let mut st = handles[wid].state.lock().unwrap();
                loop {
                    if let Some(e) = st.queue.pop_front() {
                        break Some(e);
                    }
                    if st.done {
                        break None;
                    }
                    {
                        let mut p = progress.lock().unwrap();
                        p.idle[wid] = true;
                        progress_cv.notify_all();
                    }
                    st = handles[wid].cv.wait(st).unwrap();
                }
            };
            match item {
                None => break,
                Some(n) => {
                    if let Err(e) = process_one(&mut win, n, registry, resolver, config, cache) {
                        let mut st = handles[wid].state.lock().unwrap();
                        st.done = true;
                        drop(st);
                        let mut p = progress.lock().unwrap();
                        p.idle[wid] = false;
                        p.finished += 1;
                        progress_cv.notify_all();
                        return Err(e);
                    }
                }
            }
        }
        Ok(win.flush())
    };

    crossbeam::thread::scope(|scope| {
        let join_handles: Vec<_> = (0..num_workers)
            .map(|wid| scope.spawn(move |_| worker_fn(wid)))
            .collect();

        // Coordinator: runs on this (the scope-owning) thread.
        loop {
            let mut p = progress.lock().unwrap();
            while !p.idle.iter().any(|&x| x) && p.finished < num_workers {
                p = progress_cv.wait(p).unwrap();
            }
            if p.finished >= num_workers {
                break;
            }
            let idle_wid = match p.idle.iter().position(|&x| x) {
                Some(w) => w,
                None => continue,
            };
            drop(p);

            let mut victim: Option<(usize, usize)> = None;
            for w in 0..num_workers {
                if w == idle_wid {
                    continue;
                }
                let len = handles[w].state.lock().unwrap().queue.len();
                if len > 2 * config.window && victim.map_or(true, |(_, vl)| len > vl) {
                    victim = Some((w, len));
                }
            }

            match victim {
                None => {
                    let mut st = handles[idle_wid].state.lock().unwrap();
                    st.done = true;
                    handles[idle_wid].cv.notify_all();
                    drop(st);
                    let mut p = progress.lock().unwrap();
                    p.idle[idle_wid] = false;
                    p.finished += 1;
                    progress_cv.notify_all();
                }
                Some((vwid, _)) => {
                    let stolen = {
                        let mut vst = handles[vwid].state.lock().unwrap();
                        steal_half(&mut vst.queue)
                    };
                    let mut ist = handles[idle_wid].state.lock().unwrap();
                    ist.queue.extend(stolen);
                    drop(ist);
                    handles[idle_wid].cv.notify_all();
                    let mut p = progress.lock().unwrap();
                    p.idle[idle_wid] = false;
                }
            }
        }

        let mut all = Vec::with_capacity(order.len());
        for jh in join_handles {
            let result = jh.join().expect("delta worker panicked");
            all.extend(result?);
        }
        Ok(all)
    })
    .expect("delta worker thread panicked")
}

/// Run delta search over every eligible entry in `registry`, updating
/// `delta_base`/`delta_size`/`delta_bytes`/`depth` in place.
///
/// `nr_threads <= 1` runs a single pass over the whole sorted list with
/// no locking at all; otherwise the list is partitioned and worked on by
/// `nr_threads` workers with dynamic work-stealing between them.
pub fn find_deltas(
    registry: &mut ObjectRegistry,
    resolver: &dyn ObjectResolver,
    config: &DeltaConfig,
    nr_threads: usize,
) -> Result<(), PackError> {
    let candidates = build_candidates(registry);
    if candidates.is_empty() {
        return Ok(());
    }

    let cache = Mutex::new(CacheState {
        size: registry.delta_cache_size(),
    });

    let processed = if nr_threads <= 1 || candidates.len() < 2 * config.window.max(1) {
        run_window(candidates, registry, resolver, config, &cache)?
    } else {
        run_parallel(candidates, registry, resolver, config, &cache, nr_threads)?
    };

    for e in processed {
        if e.delta_base.is_some() {
            let entry = registry.get_mut(e.registry_idx);
            entry.delta_base = e.delta_base;
            entry.delta_size = e.delta_size;
            entry.delta_bytes = e.delta_bytes;
            entry.depth = e.depth;
        }
    }
    Ok(())
}
