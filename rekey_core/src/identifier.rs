//! Time-ordered identifier generation.
//!
//! Identifiers are RFC 9562 version 7 UUIDs: a 48-bit big-endian Unix
//! millisecond timestamp followed by version, variant and 74 random bits.
//! Byte-lexicographic order therefore follows chronological order for
//! identifiers created in distinct milliseconds. Identifiers sharing a
//! millisecond are ordered by their random bits, not by call order.

use chrono::{DateTime, Utc};
use rand::RngCore;
use uuid::{Builder, Uuid};

/// Produces new-format identifiers for backfilled rows.
pub trait IdentifierGenerator: Send + Sync {
    /// Generates an identifier whose sort position matches `seed`, or the
    /// current wall-clock time when no seed is given.
    fn generate(&self, seed: Option<DateTime<Utc>>) -> Uuid;
}

/// UUIDv7 generator backed by the thread-local CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeOrderedGenerator;

impl TimeOrderedGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        Self
    }
}

impl IdentifierGenerator for TimeOrderedGenerator {
    fn generate(&self, seed: Option<DateTime<Utc>>) -> Uuid {
        let at = seed.unwrap_or_else(Utc::now);
        let mut random = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut random);
        Builder::from_unix_timestamp_millis(unix_millis(at), &random).into_uuid()
    }
}

/// Milliseconds since the Unix epoch, clamped to the 48 bits a v7 UUID holds.
fn unix_millis(at: DateTime<Utc>) -> u64 {
    const MAX_MILLIS: u64 = (1 << 48) - 1;
    u64::try_from(at.timestamp_millis())
        .unwrap_or(0)
        .min(MAX_MILLIS)
}

/// Extracts the millisecond timestamp encoded in a v7 identifier.
pub fn timestamp_millis(id: &Uuid) -> u64 {
    let bytes = id.as_bytes();
    bytes[..6]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    #[test]
    fn seeded_identifiers_follow_seed_order() {
        let generator = TimeOrderedGenerator::new();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let ids: Vec<Uuid> = (0..50)
            .map(|i| generator.generate(Some(base + Duration::milliseconds(i * 7))))
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[0].as_bytes() < pair[1].as_bytes());
        }
    }

    #[test]
    fn identifiers_are_version_7() {
        let id = TimeOrderedGenerator.generate(None);
        assert_eq!(id.get_version_num(), 7);
        assert_eq!(id.get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn timestamp_round_trips_through_prefix() {
        let seed = Utc.with_ymd_and_hms(2023, 11, 5, 8, 30, 15).unwrap();
        let id = TimeOrderedGenerator.generate(Some(seed));
        assert_eq!(timestamp_millis(&id), seed.timestamp_millis() as u64);
    }

    #[test]
    fn pre_epoch_seed_clamps_to_zero() {
        let seed = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        let id = TimeOrderedGenerator.generate(Some(seed));
        assert_eq!(timestamp_millis(&id), 0);
    }

    #[test]
    fn same_millisecond_identifiers_are_distinct() {
        let seed = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ids: HashSet<Uuid> = (0..1000)
            .map(|_| TimeOrderedGenerator.generate(Some(seed)))
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn concurrent_generation_never_collides() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..500)
                        .map(|_| TimeOrderedGenerator.generate(None))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
    }
}
