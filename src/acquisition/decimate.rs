//! Random frame decimation.

use std::path::PathBuf;

use rand::seq::index::sample;
use rand::Rng;
use tracing::{debug, warn};

/// Split `items` into `(kept, removed)` so that at most `target` items are
/// kept, chosen uniformly without replacement. A target of 0 keeps all.
/// Kept items stay in their original order.
pub fn decimate<T, R: Rng + ?Sized>(items: Vec<T>, target: usize, rng: &mut R) -> (Vec<T>, Vec<T>) {
    if target == 0 || items.len() <= target {
        return (items, Vec::new());
    }
    let mut keep = vec![false; items.len()];
    for index in sample(rng, items.len(), target) {
        keep[index] = true;
    }
    let mut kept = Vec::with_capacity(target);
    let mut removed = Vec::with_capacity(items.len() - target);
    for (item, keep) in items.into_iter().zip(keep) {
        if keep {
            kept.push(item);
        } else {
            removed.push(item);
        }
    }
    (kept, removed)
}

/// Decimate captured photos and delete the discarded files.
///
/// A file that cannot be deleted is logged and left behind; it is no longer
/// part of the returned set either way.
pub async fn decimate_files<R: Rng + ?Sized>(
    files: Vec<PathBuf>,
    target: usize,
    rng: &mut R,
) -> Vec<PathBuf> {
    let total = files.len();
    let (kept, removed) = decimate(files, target, rng);
    for path in &removed {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), "could not delete decimated frame: {e}");
        }
    }
    debug!(total, kept = kept.len(), removed = removed.len(), "frames decimated");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_decimate_240_to_100() {
        let mut rng = StdRng::seed_from_u64(7);
        let items: Vec<u32> = (0..240).collect();
        let (kept, removed) = decimate(items, 100, &mut rng);
        assert_eq!(kept.len(), 100);
        assert_eq!(removed.len(), 140);

        let unique: HashSet<_> = kept.iter().collect();
        assert_eq!(unique.len(), 100);
        assert!(kept.iter().all(|i| *i < 240));
        assert!(kept.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_zero_target_keeps_everything() {
        let mut rng = StdRng::seed_from_u64(1);
        let (kept, removed) = decimate(vec![1, 2, 3], 0, &mut rng);
        assert_eq!(kept, vec![1, 2, 3]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_under_target_is_untouched() {
        let mut rng = StdRng::seed_from_u64(1);
        let (kept, removed) = decimate(vec!["a", "b"], 5, &mut rng);
        assert_eq!(kept, vec!["a", "b"]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_same_seed_same_selection() {
        let items: Vec<u32> = (0..50).collect();
        let (a, _) = decimate(items.clone(), 10, &mut StdRng::seed_from_u64(42));
        let (b, _) = decimate(items, 10, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_decimate_files_deletes_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 0..6 {
            let path = dir.path().join(format!("capt{i}.jpg"));
            tokio::fs::write(&path, b"x").await.unwrap();
            files.push(path);
        }
        let kept = decimate_files(files.clone(), 2, &mut StdRng::seed_from_u64(3)).await;
        assert_eq!(kept.len(), 2);
        let remaining = files.iter().filter(|p| p.exists()).count();
        assert_eq!(remaining, 2);
        assert!(kept.iter().all(|p| p.exists()));
    }
}
