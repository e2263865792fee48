// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests for offline-sync.
//!
//! Random operation sequences against the cache, and random or malformed
//! inputs against the decoders. Nothing may panic; limits must always hold.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

use offline_sync::crypto::{DeviceKey, RecordCipher};
use offline_sync::{ChangeEvent, MemoryCache, OwnerId, Record, RecordKey, SyncConfig};

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum CacheOp {
    Put { owner: u8, id: u8, size: usize },
    Get { owner: u8, id: u8 },
    Invalidate { owner: u8, id: u8 },
    InvalidateOwner { owner: u8 },
}

fn key(owner: u8, id: u8) -> RecordKey {
    RecordKey::new(OwnerId::new(format!("owner-{}", owner)), "doc", format!("d{}", id))
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => (0u8..3, 0u8..20, 0usize..400).prop_map(|(owner, id, size)| CacheOp::Put { owner, id, size }),
        3 => (0u8..3, 0u8..20).prop_map(|(owner, id)| CacheOp::Get { owner, id }),
        1 => (0u8..3, 0u8..20).prop_map(|(owner, id)| CacheOp::Invalidate { owner, id }),
        1 => (0u8..3).prop_map(|owner| CacheOp::InvalidateOwner { owner }),
    ]
}

// =============================================================================
// Cache invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Entry and byte limits hold after every operation.
    #[test]
    fn cache_never_exceeds_limits(
        max_entries in 1usize..12,
        max_bytes in 1usize..2000,
        fraction in 0.05f64..=1.0,
        ops in prop::collection::vec(cache_op_strategy(), 1..200),
    ) {
        let cache = MemoryCache::new(max_entries, max_bytes, fraction);
        let ttl = Duration::from_secs(60);

        for op in ops {
            match op {
                CacheOp::Put { owner, id, size } => {
                    let k = key(owner, id);
                    cache.put(k.clone(), Record::from_server(k, vec![0u8; size], 1), ttl);
                }
                CacheOp::Get { owner, id } => {
                    let _ = cache.get(&key(owner, id));
                }
                CacheOp::Invalidate { owner, id } => cache.invalidate(&key(owner, id)),
                CacheOp::InvalidateOwner { owner } => {
                    cache.invalidate_owner(&OwnerId::new(format!("owner-{}", owner)));
                }
            }
            let stats = cache.stats();
            prop_assert!(stats.entries <= max_entries, "entries {} > {}", stats.entries, max_entries);
            prop_assert!(stats.bytes <= max_bytes, "bytes {} > {}", stats.bytes, max_bytes);
        }
    }

    /// Whatever the cache returns is exactly what was last put for that key.
    #[test]
    fn cache_returns_latest_value(
        puts in prop::collection::vec((0u8..8, any::<u8>()), 1..60),
    ) {
        let cache = MemoryCache::new(64, 1 << 20, 0.1);
        let ttl = Duration::from_secs(60);
        let mut latest = std::collections::HashMap::new();

        for (id, byte) in puts {
            let k = key(0, id);
            cache.put(k.clone(), Record::from_server(k.clone(), vec![byte], 1), ttl);
            latest.insert(k, byte);
        }
        for (k, byte) in latest {
            let got = cache.get(&k);
            prop_assert_eq!(got.map(|r| r.payload), Some(vec![byte]));
        }
    }

    /// Invalidating one owner leaves the others untouched.
    #[test]
    fn cache_owner_invalidation_is_scoped(
        ids in prop::collection::hash_set(0u8..30, 1..20),
    ) {
        let cache = MemoryCache::new(256, 1 << 20, 0.1);
        let ttl = Duration::from_secs(60);
        for id in &ids {
            for owner in 0..2u8 {
                let k = key(owner, *id);
                cache.put(k.clone(), Record::from_server(k, vec![1], 1), ttl);
            }
        }

        let removed = cache.invalidate_owner(&OwnerId::new("owner-0"));
        prop_assert_eq!(removed, ids.len());
        let survivors: HashSet<u8> = ids.iter().copied().filter(|id| cache.contains(&key(1, *id))).collect();
        prop_assert_eq!(survivors.len(), ids.len());
        prop_assert!(ids.iter().all(|id| !cache.contains(&key(0, *id))));
    }
}

// =============================================================================
// Decoder robustness
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Random bytes never authenticate and never panic.
    #[test]
    fn cipher_rejects_random_blobs(blob in prop::collection::vec(any::<u8>(), 0..200)) {
        let cipher = RecordCipher::new(&DeviceKey::from_bytes([9u8; 32]));
        prop_assert!(cipher.open("owner/doc/d1", &blob).is_err());
    }

    /// A sealed blob opens only under its own storage id.
    #[test]
    fn cipher_binds_storage_id(
        payload in prop::collection::vec(any::<u8>(), 0..300),
        id in "[a-z]{1,12}",
    ) {
        let cipher = RecordCipher::new(&DeviceKey::from_bytes([5u8; 32]));
        let sealed = cipher.seal(&id, &payload).unwrap();
        prop_assert_eq!(cipher.open(&id, &sealed).unwrap(), payload);
        let other = format!("{}x", id);
        prop_assert!(cipher.open(&other, &sealed).is_err());
    }

    /// Arbitrary text as a push frame: decode error or a valid event.
    #[test]
    fn change_event_decode_never_panics(text in ".{0,200}") {
        let _ = serde_json::from_str::<ChangeEvent>(&text);
    }

    /// Arbitrary TOML and JSON configs: parse error, validation error, or a
    /// config that passes validation.
    #[test]
    fn config_parse_never_panics(
        threshold in any::<u32>(),
        multiplier in prop::num::f64::ANY,
        jitter in -2.0f64..2.0,
        fraction in -1.0f64..2.0,
    ) {
        let toml = format!(
            "circuit_failure_threshold = {}\nretry_jitter = {:?}\ncache_eviction_fraction = {:?}\n",
            threshold, jitter, fraction
        );
        if let Ok(config) = SyncConfig::from_toml_str(&toml) {
            prop_assert!(config.validate().is_ok());
        }

        let json = serde_json::json!({ "retry_multiplier": multiplier }).to_string();
        if let Ok(config) = SyncConfig::from_json_str(&json) {
            prop_assert!(config.retry_multiplier >= 1.0);
        }
    }
}
