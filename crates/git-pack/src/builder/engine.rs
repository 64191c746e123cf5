//! The per-comparison delta search heuristic.
//!
//! `try_delta` is called once per (target, candidate source) pair as the
//! scheduler slides its window. It never touches the registry directly —
//! callers own the entries and apply whatever `try_delta` decides.

use git_object::ObjectType;

use crate::delta::index::DeltaIndex;

/// Tunables read from configuration (see `builder::session`).
#[derive(Debug, Clone, Copy)]
pub struct DeltaConfig {
    pub max_depth: u16,
    pub window: usize,
    /// 0 means unlimited.
    pub max_delta_cache_size: u64,
    pub cache_max_small_delta_size: u64,
    pub big_file_threshold: u64,
    pub window_memory_limit: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            window: 11,
            max_delta_cache_size: 256 * 1024 * 1024,
            cache_max_small_delta_size: 1000,
            big_file_threshold: 512 * 1024 * 1024,
            window_memory_limit: 0,
        }
    }
}

/// Shape of the target/candidate being compared. Read-only snapshot so
/// `try_delta` never needs two live mutable borrows into the registry.
#[derive(Debug, Clone, Copy)]
pub struct CandidateInfo {
    pub obj_type: ObjectType,
    pub size: u64,
    pub depth: u16,
}

/// What the target currently has going for it, so `try_delta` can decide
/// whether the new candidate source beats it.
#[derive(Debug, Clone, Copy)]
pub struct CurrentBest {
    pub has_delta: bool,
    pub delta_size: u64,
    pub depth: u16,
}

pub enum TryDeltaOutcome {
    /// Source and target are different object types — the caller should
    /// stop scanning further candidates in this direction entirely.
    TypeMismatch,
    /// Not an improvement over the target's current best (or no
    /// candidate delta could be constructed).
    NotBetter,
    /// `source` is a better base. Carries the encoded delta plus the
    /// depth the target would have if this base is chosen.
    Accepted { delta: Vec<u8>, new_depth: u16 },
}

/// Compare one (target, source) pair and decide whether `source` should
/// become the target's delta base.
///
/// `source_data`/`source_index` are the already-loaded payload and block
/// index for the candidate source; `target_data` is the target's payload
/// (also already loaded by the caller, since both get mapped into the
/// window before comparisons start).
#[allow(clippy::too_many_arguments)]
pub fn try_delta(
    target: CandidateInfo,
    target_data: &[u8],
    current_best: CurrentBest,
    source: CandidateInfo,
    source_data: &[u8],
    source_index: &DeltaIndex,
    config: &DeltaConfig,
) -> TryDeltaOutcome {
    if target.obj_type != source.obj_type {
        return TryDeltaOutcome::TypeMismatch;
    }

    if source.depth >= config.max_depth {
        return TryDeltaOutcome::NotBetter;
    }

    let trg_size = target.size;
    let (base_max_size, ref_depth) = if !current_best.has_delta {
        ((trg_size / 2).saturating_sub(20), 1u16)
    } else {
        (current_best.delta_size, current_best.depth)
    };

    let max_size = (base_max_size as u128 * (config.max_depth - source.depth) as u128
        / (config.max_depth - ref_depth + 1) as u128) as u64;
    if max_size == 0 {
        return TryDeltaOutcome::NotBetter;
    }

    let src_size = source.size;
    let sizediff = if src_size < trg_size {
        trg_size - src_size
    } else {
        0
    };
    if sizediff >= max_size {
        return TryDeltaOutcome::NotBetter;
    }
    if trg_size < src_size / 32 {
        return TryDeltaOutcome::NotBetter;
    }

    let delta = match source_index.create_delta(source_data, target_data, max_size) {
        Some(d) => d,
        None => return TryDeltaOutcome::NotBetter,
    };
    let delta_size = delta.len() as u64;

    if current_best.has_delta
        && delta_size == current_best.delta_size
        && source.depth + 1 >= current_best.depth
    {
        // Prefer only shallower same-sized deltas.
        return TryDeltaOutcome::NotBetter;
    }

    TryDeltaOutcome::Accepted {
        delta,
        new_depth: source.depth + 1,
    }
}

/// Whether a freshly-accepted delta is worth holding onto in the
/// in-memory cache rather than recomputing it at write time.
///
/// A lone delta that by itself exceeds the whole budget is still allowed
/// through once, as long as the cache is currently empty — otherwise a
/// single oversized object would permanently starve caching for every
/// object behind it.
pub fn delta_cacheable(
    config: &DeltaConfig,
    current_cache_size: u64,
    src_size: u64,
    trg_size: u64,
    delta_size: u64,
) -> bool {
    if config.max_delta_cache_size != 0
        && current_cache_size + delta_size > config.max_delta_cache_size
        && current_cache_size != 0
    {
        return false;
    }
    if delta_size < config.cache_max_small_delta_size {
        return true;
    }
    (src_size >> 20) + (trg_size >> 21) > (delta_size >> 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(obj_type: ObjectType, size: u64, depth: u16) -> CandidateInfo {
        CandidateInfo {
            obj_type,
            size,
            depth,
        }
    }

    #[test]
    fn rejects_mismatched_types() {
        let config = DeltaConfig::default();
        let target_data = vec![0u8; 100];
        let source_data = vec![0u8; 100];
        let idx = DeltaIndex::new(&source_data);
        let outcome = try_delta(
            info(ObjectType::Blob, 100, 0),
            &target_data,
            CurrentBest {
                has_delta: false,
                delta_size: 0,
                depth: 0,
            },
            info(ObjectType::Tree, 100, 0),
            &source_data,
            &idx,
            &config,
        );
        assert!(matches!(outcome, TryDeltaOutcome::TypeMismatch));
    }

    #[test]
    fn rejects_source_at_max_depth() {
        let config = DeltaConfig {
            max_depth: 3,
            ..Default::default()
        };
        let target_data = vec![1u8; 100];
        let source_data = vec![1u8; 100];
        let idx = DeltaIndex::new(&source_data);
        let outcome = try_delta(
            info(ObjectType::Blob, 100, 0),
            &target_data,
            CurrentBest {
                has_delta: false,
                delta_size: 0,
                depth: 0,
            },
            info(ObjectType::Blob, 100, 3),
            &source_data,
            &idx,
            &config,
        );
        assert!(matches!(outcome, TryDeltaOutcome::NotBetter));
    }

    #[test]
    fn accepts_similar_object_as_delta_base() {
        let config = DeltaConfig::default();
        let source_data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut target_data = source_data.clone();
        target_data[10] = 0xFF;
        let idx = DeltaIndex::new(&source_data);

        let outcome = try_delta(
            info(ObjectType::Blob, target_data.len() as u64, 0),
            &target_data,
            CurrentBest {
                has_delta: false,
                delta_size: 0,
                depth: 0,
            },
            info(ObjectType::Blob, source_data.len() as u64, 0),
            &source_data,
            &idx,
            &config,
        );
        match outcome {
            TryDeltaOutcome::Accepted { delta, new_depth } => {
                assert_eq!(new_depth, 1);
                assert!(delta.len() < target_data.len());
            }
            _ => panic!("expected delta to be accepted"),
        }
    }

    #[test]
    fn small_delta_is_always_cacheable() {
        let config = DeltaConfig::default();
        assert!(delta_cacheable(&config, 0, 1000, 1000, 10));
    }

    #[test]
    fn cache_budget_rejects_when_full() {
        let config = DeltaConfig {
            max_delta_cache_size: 100,
            ..Default::default()
        };
        assert!(!delta_cacheable(&config, 90, 1000, 1000, 20));
    }
}
