//! Disk-backed skip lists addressed by byte offset.
//!
//! [`SkipList`] is the primary store of a shard: an index region of
//! variable-height nodes and a data region holding the key bytes.
//! [`RedoLog`] is the simpler single-file variant used while a shard splits.

pub mod layout;
pub mod redo_log;
pub mod store;

pub use redo_log::{RedoLog, RedoRecord};
pub use store::{CompactionPlan, Fragmentation, InsertOutcome, SkipList};

use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const MAX_LEVEL: usize = 64;
pub const MIN_KEY_LEN: usize = 1;
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

pub const META_SUFFIX: &str = ".meta";
pub const DATA_SUFFIX: &str = ".data";
pub const SPLIT_REDOLOG_SUFFIX: &str = ".sp.redolog";
pub const SPLIT_LEFT_SUFFIX: &str = ".sp.left";
pub const SPLIT_RIGHT_SUFFIX: &str = ".sp.right";

/// `prefix` with `suffix` appended to its last component.
pub fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKeySize {
            size: key.len(),
            min: MIN_KEY_LEN,
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

/// Geometric level draw: keep promoting while a `p`-biased coin lands heads.
pub fn random_level(rng: &mut StdRng, p: f32) -> usize {
    let mut level = 1;
    while level < MAX_LEVEL && rng.random::<f32>() < p {
        level += 1;
    }
    level
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    StdRng::seed_from_u64(seed.unwrap_or_else(rand::random))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_bounds() {
        assert!(validate_key(b"a").is_ok());
        assert!(validate_key(&vec![0u8; MAX_KEY_LEN]).is_ok());
        assert!(matches!(
            validate_key(b""),
            Err(Error::InvalidKeySize { size: 0, .. })
        ));
        assert!(validate_key(&vec![0u8; MAX_KEY_LEN + 1]).is_err());
    }

    #[test]
    fn test_random_level_distribution() {
        let mut rng = seeded_rng(Some(42));
        for _ in 0..1000 {
            assert_eq!(random_level(&mut rng, 0.0), 1);
        }

        let draws: Vec<usize> = (0..10_000).map(|_| random_level(&mut rng, 0.5)).collect();
        assert!(draws.iter().all(|l| (1..=MAX_LEVEL).contains(l)));
        let ones = draws.iter().filter(|&&l| l == 1).count();
        // Roughly half the draws stay at level 1
        assert!((4000..6000).contains(&ones), "{} draws at level 1", ones);
    }

    #[test]
    fn test_suffixed() {
        let prefix = Path::new("/tmp/db/shard-000001");
        assert_eq!(
            suffixed(prefix, SPLIT_LEFT_SUFFIX),
            PathBuf::from("/tmp/db/shard-000001.sp.left")
        );
        assert_eq!(
            suffixed(&suffixed(prefix, SPLIT_LEFT_SUFFIX), META_SUFFIX),
            PathBuf::from("/tmp/db/shard-000001.sp.left.meta")
        );
    }
}
