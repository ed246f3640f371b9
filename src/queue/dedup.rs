//! Identity hashing and duplicate detection at admission time.

use sha2::{Digest, Sha256};
use crate::core::ExistingMedia;

/// Identity digest of an upload. Not a content hash: two different files with
/// the same name and size in the same set collide on purpose.
pub fn file_hash(filename: &str, size: u64, context_id: &str, set_id: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update([0u8]);
    hasher.update(size.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(context_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(set_id.unwrap_or_default().as_bytes());

    hex::encode(hasher.finalize())
}

/// Stable key of a batch, independent of file order.
pub fn batch_key<'a>(
    files: impl IntoIterator<Item = (&'a str, u64)>,
    context_id: &str,
    set_id: Option<&str>,
) -> String {
    let mut identities: Vec<String> = files
        .into_iter()
        .map(|(filename, size)| file_hash(filename, size, context_id, set_id))
        .collect();
    identities.sort();

    let mut hasher = Sha256::new();
    for identity in &identities {
        hasher.update(identity.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Lowercased base name without extension, separators collapsed to one space.
pub fn normalize_filename(filename: &str) -> String {
    let trimmed = filename.trim();
    let stem = match trimmed.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => trimmed,
    };

    stem.to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sizes match when they differ by at most `tolerance` of the larger one.
pub fn sizes_match(a: u64, b: u64, tolerance: f64) -> bool {
    let larger = a.max(b);
    if larger == 0 {
        return true;
    }

    let diff = a.abs_diff(b) as f64;
    diff <= larger as f64 * tolerance.max(0.0)
}

/// Heuristic match against media the caller already has. Approximate by nature:
/// a renamed file slips through and two different shots with similar names and
/// sizes may be flagged.
pub fn find_existing<'a>(
    filename: &str,
    size: u64,
    existing: &'a [ExistingMedia],
    tolerance: f64,
) -> Option<&'a ExistingMedia> {
    let name = normalize_filename(filename);
    if name.is_empty() {
        return None;
    }

    existing
        .iter()
        .find(|media| sizes_match(size, media.size, tolerance) && normalize_filename(&media.filename) == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_hash_is_deterministic() {
        let hash = file_hash("a.jpg", 10, "col-1", Some("set-1"));

        assert_eq!(hash.len(), 64);
        assert_eq!(hash, file_hash("a.jpg", 10, "col-1", Some("set-1")));
        assert_ne!(hash, file_hash("a.jpg", 11, "col-1", Some("set-1")));
        assert_ne!(hash, file_hash("a.jpg", 10, "col-2", Some("set-1")));
        assert_ne!(hash, file_hash("a.jpg", 10, "col-1", None));
    }

    #[test]
    fn test_batch_key_ignores_order() {
        let first = batch_key([("a.jpg", 1), ("b.jpg", 2)], "col", None);
        let second = batch_key([("b.jpg", 2), ("a.jpg", 1)], "col", None);
        let other = batch_key([("a.jpg", 1)], "col", None);

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_normalize_filename() {
        assert_eq!(normalize_filename("IMG_0001.JPG"), "img 0001");
        assert_eq!(normalize_filename("img-0001.jpeg"), "img 0001");
        assert_eq!(normalize_filename("  Beach  Day.final.png "), "beach day.final");
        assert_eq!(normalize_filename(".hidden"), ".hidden");
    }

    #[test]
    fn test_find_existing_with_tolerance() {
        let existing = vec![
            ExistingMedia::new("IMG_0001.jpeg", 1_000_000),
            ExistingMedia::new("IMG_0002.jpeg", 2_000_000),
        ];

        let found = find_existing("img_0001.JPG", 1_009_000, &existing, 0.01);
        assert_eq!(found, Some(&existing[0]));

        assert!(find_existing("img_0001.JPG", 1_200_000, &existing, 0.01).is_none());
        assert!(find_existing("img_0003.jpg", 1_000_000, &existing, 0.01).is_none());
        assert!(find_existing("img_0001.JPG", 1_200_000, &existing, 0.5).is_some());
    }

    #[test]
    fn test_sizes_match() {
        assert!(sizes_match(0, 0, 0.01));
        assert!(sizes_match(100, 101, 0.01));
        assert!(!sizes_match(100, 102, 0.01));
    }
}
