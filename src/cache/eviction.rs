//! File Eviction Policies
//!
//! Space is reclaimed a whole cache file at a time. When a reservation
//! does not fit, the cache asks its policy to order the evictable files;
//! files are taken from the front of that order until enough bytes are
//! freed.

use super::file::FileSummary;

/// Chooses which cache files to reclaim first
pub trait EvictionPolicy: Send + Sync {
    /// Short policy name for logs and stats
    fn name(&self) -> &str;

    /// Order `candidates` by eviction preference, most evictable first.
    ///
    /// Every candidate passed in is evictable.
    fn rank(&self, candidates: &mut [FileSummary]);

    /// Pick victims freeing at least `needed` bytes.
    ///
    /// Returns `None` when evicting every candidate would still not free
    /// enough, in which case nothing should be evicted.
    fn select_victims(&self, files: &[FileSummary], needed: u64) -> Option<Vec<u32>> {
        let mut candidates: Vec<FileSummary> =
            files.iter().copied().filter(|f| f.is_evictable()).collect();
        self.rank(&mut candidates);

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for file in candidates {
            if freed >= needed {
                break;
            }
            freed += file.size;
            victims.push(file.id);
        }
        (freed >= needed).then_some(victims)
    }
}

/// Evict failed files first, then the oldest (lowest id) files
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFileFirst;

impl EvictionPolicy for OldestFileFirst {
    fn name(&self) -> &str {
        "oldest-file-first"
    }

    fn rank(&self, candidates: &mut [FileSummary]) {
        candidates.sort_by_key(|f| (!f.failed, f.id));
    }
}

/// Evict failed files first, then the largest files
///
/// Frees space with the fewest deletions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFileFirst;

impl EvictionPolicy for LargestFileFirst {
    fn name(&self) -> &str {
        "largest-file-first"
    }

    fn rank(&self, candidates: &mut [FileSummary]) {
        candidates.sort_by_key(|f| (!f.failed, std::cmp::Reverse(f.size), f.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: u32, size: u64) -> FileSummary {
        FileSummary {
            id,
            size,
            sealed: true,
            failed: false,
            in_flight: 0,
        }
    }

    #[test]
    fn test_oldest_first_order() {
        let files = vec![summary(3, 100), summary(1, 100), summary(2, 100)];
        let victims = OldestFileFirst.select_victims(&files, 150).unwrap();
        assert_eq!(victims, vec![1, 2]);
    }

    #[test]
    fn test_failed_files_go_first() {
        let mut failed = summary(7, 100);
        failed.failed = true;
        let files = vec![summary(1, 100), failed];
        assert_eq!(OldestFileFirst.select_victims(&files, 1).unwrap(), vec![7]);
        assert_eq!(LargestFileFirst.select_victims(&files, 1).unwrap(), vec![7]);
    }

    #[test]
    fn test_skips_unevictable_files() {
        let mut open = summary(1, 1000);
        open.sealed = false;
        let mut busy = summary(2, 1000);
        busy.in_flight = 1;
        let files = vec![open, busy, summary(3, 10)];

        assert_eq!(OldestFileFirst.select_victims(&files, 10).unwrap(), vec![3]);
        assert!(OldestFileFirst.select_victims(&files, 11).is_none());
    }

    #[test]
    fn test_largest_first_needs_fewer_victims() {
        let files = vec![summary(1, 10), summary(2, 500), summary(3, 50)];
        assert_eq!(LargestFileFirst.select_victims(&files, 400).unwrap(), vec![2]);
        assert_eq!(OldestFileFirst.select_victims(&files, 400).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_nothing_needed_selects_nothing() {
        let files = vec![summary(1, 10)];
        assert_eq!(OldestFileFirst.select_victims(&files, 0).unwrap(), Vec::<u32>::new());
    }
}
