//! Deterministic bucketing shared by every Eppo SDK.
//!
//! The exact hash input (`"{salt}-{subject_key}"`), the digest (MD5) and the way the digest is
//! reduced to a shard (first four bytes as a big-endian `u32`, modulo the shard count) must stay
//! bit-for-bit identical across languages.

/// Maps an arbitrary input to a shard in `0..total_shards`.
pub trait Sharder {
    /// Return the shard for `input`.
    fn get_shard(&self, input: &str, total_shards: u64) -> u64;
}

/// The default (and only production) sharder.
///
/// A `total_shards` of zero maps every input to shard 0, which no half-open range contains.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        u64::from(md5_u32(input))
            .checked_rem(total_shards)
            .unwrap_or(0)
    }
}

/// Interpret the first four bytes of the MD5 digest of `input` as a big-endian `u32`.
///
/// This is the same number as parsing the first 8 hex characters of the digest.
pub(crate) fn md5_u32(input: &str) -> u32 {
    let hash = md5::compute(input.as_bytes());
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Bucket `subject_key` under `salt` into `0..total_shards`.
///
/// ```
/// # use eppo_evaluator::bucket;
/// assert_eq!(bucket("x", "u1", 10_000), bucket("x", "u1", 10_000));
/// assert!(bucket("x", "u1", 10_000) < 10_000);
/// ```
pub fn bucket(salt: &str, subject_key: &str, total_shards: u64) -> u64 {
    bucket_with(&Md5Sharder, salt, subject_key, total_shards)
}

pub(crate) fn bucket_with(
    sharder: &impl Sharder,
    salt: &str,
    subject_key: &str,
    total_shards: u64,
) -> u64 {
    sharder.get_shard(&format!("{salt}-{subject_key}"), total_shards)
}

#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        self.0
            .get(input)
            .copied()
            .unwrap_or(0)
            .checked_rem(total_shards)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{bucket, md5_u32, Md5Sharder, Sharder};

    #[test]
    fn test_md5_sharder() {
        assert_eq!(Md5Sharder.get_shard("test-input", 10_000), 5619);
        assert_eq!(Md5Sharder.get_shard("alice", 10_000), 3170);
        assert_eq!(Md5Sharder.get_shard("bob", 10_000), 7420);
        assert_eq!(Md5Sharder.get_shard("charlie", 10_000), 7497);
    }

    #[test]
    fn zero_shards_does_not_panic() {
        assert_eq!(Md5Sharder.get_shard("alice", 0), 0);
        assert_eq!(bucket("salt", "alice", 0), 0);
    }

    #[test]
    fn md5_u32_matches_leading_hex() {
        // md5("alice") = 6384e2b2...
        assert_eq!(md5_u32("alice"), 0x6384e2b2);
        assert_eq!(md5_u32("test-input"), 3_052_925_619);
    }

    #[test]
    fn bucket_joins_salt_and_subject_with_dash() {
        assert_eq!(bucket("x", "u1", 10_000), 2711);
        assert_eq!(bucket("x", "u2", 10_000), 7136);
        assert_eq!(bucket("salt", "alice", 10_000), 3619);
    }

    #[test]
    fn bucket_is_stable_and_in_range() {
        for total in [1, 7, 100, 10_000] {
            for subject in ["a", "b", "subject-42", ""] {
                let first = bucket("salt", subject, total);
                assert!(first < total);
                assert_eq!(first, bucket("salt", subject, total));
            }
        }
    }
}
