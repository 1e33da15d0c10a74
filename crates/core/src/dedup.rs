use crate::chunking::RawChunk;
use crate::error::RagError;
use crate::models::{Chunk, DedupStrategy};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupStats {
    pub total_chunks: usize,
    pub unique_chunks: usize,
    pub dedup_percentage: f64,
}

impl DedupStats {
    pub fn new(total_chunks: usize, unique_chunks: usize) -> Self {
        let dedup_percentage = if total_chunks == 0 {
            0.0
        } else {
            let raw = (total_chunks - unique_chunks) as f64 / total_chunks as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        };

        Self {
            total_chunks,
            unique_chunks,
            dedup_percentage,
        }
    }
}

/// Case-folded, whitespace-collapsed form used for duplicate detection.
pub fn normalize_for_dedup(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_dedup(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Filters one document's chunks: drops chunks shorter than `min_length`, then duplicates
/// according to `strategy`. Fails with `EmptyContent` when nothing survives.
pub fn deduplicate(
    document_id: &str,
    chunks: Vec<RawChunk>,
    strategy: DedupStrategy,
    min_length: usize,
) -> Result<(Vec<Chunk>, DedupStats), RagError> {
    let total = chunks.len();
    let mut seen_hashes = HashSet::new();
    let mut recent: VecDeque<Vec<char>> = VecDeque::new();
    let mut accepted = Vec::new();

    for raw in chunks {
        let text = raw.text.trim();
        if text.chars().count() < min_length {
            continue;
        }

        let hash = content_hash(text);
        if !matches!(strategy, DedupStrategy::None) && seen_hashes.contains(&hash) {
            continue;
        }

        if let DedupStrategy::NearDuplicate { threshold, window } = strategy {
            let candidate = normalize_for_dedup(text).chars().collect::<Vec<_>>();
            if recent
                .iter()
                .any(|previous| is_similar_above(previous, &candidate, threshold))
            {
                continue;
            }
            recent.push_back(candidate);
            while recent.len() > window {
                recent.pop_front();
            }
        }

        seen_hashes.insert(hash.clone());
        accepted.push(Chunk {
            document_id: document_id.to_string(),
            page: raw.page,
            sequence: raw.sequence,
            content_hash: hash,
            text: text.to_string(),
        });
    }

    if accepted.is_empty() {
        return Err(RagError::EmptyContent(format!(
            "no chunks of at least {min_length} characters survived deduplication (started with {total})"
        )));
    }

    let stats = DedupStats::new(total, accepted.len());
    Ok((accepted, stats))
}

/// Whether `similarity_ratio(left, right) > threshold`. Two cheap upper bounds (length, then
/// shared character multiset) reject most pairs before the quadratic match.
pub fn is_similar_above(left: &[char], right: &[char], threshold: f64) -> bool {
    length_bound(left, right) > threshold
        && multiset_bound(left, right) > threshold
        && similarity_ratio(left, right) > threshold
}

fn ratio(matches: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        2.0 * matches as f64 / total as f64
    }
}

/// Ratio if every char of the shorter side matched.
fn length_bound(left: &[char], right: &[char]) -> f64 {
    ratio(left.len().min(right.len()), left.len() + right.len())
}

/// Ratio if every shared char matched regardless of order.
fn multiset_bound(left: &[char], right: &[char]) -> f64 {
    let mut available: HashMap<char, usize> = HashMap::new();
    for ch in left {
        *available.entry(*ch).or_default() += 1;
    }

    let shared = right
        .iter()
        .filter(|ch| match available.get_mut(*ch) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        })
        .count();
    ratio(shared, left.len() + right.len())
}

/// Ratcliff/Obershelp ratio `2 * matches / (len_a + len_b)` in `[0, 1]`.
pub fn similarity_ratio(left: &[char], right: &[char]) -> f64 {
    ratio(matching_chars(left, right), left.len() + right.len())
}

fn matching_chars(left: &[char], right: &[char]) -> usize {
    if left.is_empty() || right.is_empty() {
        return 0;
    }

    let (left_start, right_start, length) = longest_common_run(left, right);
    if length == 0 {
        return 0;
    }

    length
        + matching_chars(&left[..left_start], &right[..right_start])
        + matching_chars(&left[left_start + length..], &right[right_start + length..])
}

fn longest_common_run(left: &[char], right: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous = vec![0usize; right.len() + 1];
    let mut current = vec![0usize; right.len() + 1];

    for (i, left_char) in left.iter().enumerate() {
        for (j, right_char) in right.iter().enumerate() {
            current[j + 1] = if left_char == right_char {
                previous[j] + 1
            } else {
                0
            };
            if current[j + 1] > best.2 {
                best = (i + 1 - current[j + 1], j + 1 - current[j + 1], current[j + 1]);
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(sequence: u64, text: &str) -> RawChunk {
        RawChunk {
            page: 1,
            sequence,
            text: text.to_string(),
        }
    }

    fn long(text: &str) -> String {
        format!("{text} {}", "padding words to pass the length filter".repeat(2))
    }

    #[test]
    fn short_chunks_are_dropped() {
        let chunks = vec![raw(0, "too short"), raw(1, &long("kept"))];
        let (kept, stats) = deduplicate("doc", chunks, DedupStrategy::Exact, 50).expect("one survives");

        assert_eq!(kept.len(), 1);
        assert!(kept.iter().all(|chunk| chunk.text.chars().count() >= 50));
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.unique_chunks, 1);
    }

    #[test]
    fn exact_duplicates_ignore_case_and_spacing() {
        let text = long("Normal forms reduce redundancy.");
        let shouted = text.to_uppercase().replace(' ', "  ");
        let chunks = vec![raw(0, &text), raw(1, &shouted), raw(2, &long("Different"))];
        let (kept, stats) = deduplicate("doc", chunks, DedupStrategy::Exact, 50).expect("chunks survive");

        assert_eq!(kept.len(), 2);
        assert!(stats.unique_chunks < stats.total_chunks);
        assert_eq!(kept[1].sequence, 2);
    }

    #[test]
    fn dedup_percentage_is_rounded() {
        assert_eq!(DedupStats::new(10, 8).dedup_percentage, 20.0);
        assert_eq!(DedupStats::new(3, 2).dedup_percentage, 33.33);
        assert_eq!(DedupStats::new(0, 0).dedup_percentage, 0.0);
    }

    #[test]
    fn ten_chunks_with_two_duplicates() {
        let mut chunks = (0..8)
            .map(|index| raw(index, &long(&format!("unique body number {index}"))))
            .collect::<Vec<_>>();
        chunks.push(raw(8, &long("unique body number 1")));
        chunks.push(raw(9, &long("unique body number 5")));

        let (kept, stats) = deduplicate("doc", chunks, DedupStrategy::Exact, 50).expect("chunks survive");
        assert_eq!(kept.len(), 8);
        assert_eq!(stats.unique_chunks, 8);
        assert_eq!(stats.dedup_percentage, 20.0);
    }

    #[test]
    fn strategy_none_keeps_duplicates() {
        let text = long("repeat");
        let chunks = vec![raw(0, &text), raw(1, &text)];
        let (kept, _) = deduplicate("doc", chunks, DedupStrategy::None, 50).expect("chunks survive");
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn near_duplicates_within_window_are_dropped() {
        let base = long("The buffer pool caches disk pages in memory");
        let tweaked = base.replacen("caches", "cache", 1);
        let chunks = vec![raw(0, &base), raw(1, &tweaked), raw(2, &long("Write-ahead logging"))];
        let strategy = DedupStrategy::NearDuplicate {
            threshold: 0.9,
            window: 4,
        };

        let (kept, _) = deduplicate("doc", chunks, strategy, 50).expect("chunks survive");
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn near_duplicates_outside_window_survive() {
        let base = long("The buffer pool caches disk pages in memory");
        let tweaked = base.replacen("caches", "cache", 1);
        let chunks = vec![
            raw(0, &base),
            raw(1, &long("Zebra 1 quantum physics")),
            raw(2, &tweaked),
        ];
        let strategy = DedupStrategy::NearDuplicate {
            threshold: 0.99,
            window: 1,
        };

        let (kept, _) = deduplicate("doc", chunks, strategy, 50).expect("chunks survive");
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn nothing_surviving_is_empty_content() {
        let chunks = vec![raw(0, "tiny"), raw(1, "also tiny")];
        let result = deduplicate("doc", chunks, DedupStrategy::Exact, 50);
        assert!(matches!(result, Err(RagError::EmptyContent(_))));
    }

    #[test]
    fn similarity_ratio_bounds() {
        let a = "abcd".chars().collect::<Vec<_>>();
        let b = "bcde".chars().collect::<Vec<_>>();
        let empty: Vec<char> = Vec::new();

        assert_eq!(similarity_ratio(&a, &a), 1.0);
        assert_eq!(similarity_ratio(&a, &empty), 0.0);
        assert!((similarity_ratio(&a, &b) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn cheap_bounds_never_undercut_the_ratio() {
        let pairs = [
            ("normalization removes redundancy", "normalisation removes redundancy"),
            ("abcd", "dcba"),
            ("b-tree index pages", "hash index buckets"),
            ("short", "a much longer passage about transactions"),
        ];
        for (left, right) in pairs {
            let left = left.chars().collect::<Vec<_>>();
            let right = right.chars().collect::<Vec<_>>();
            let exact = similarity_ratio(&left, &right);
            assert!(length_bound(&left, &right) >= exact);
            assert!(multiset_bound(&left, &right) >= exact);
        }
    }

    #[test]
    fn similarity_threshold_check_matches_the_ratio() {
        let near = "normalization removes redundancy".chars().collect::<Vec<_>>();
        let variant = "normalisation removes redundancy".chars().collect::<Vec<_>>();
        let reversed = "ycnadnuder sevomer noitazilamron".chars().collect::<Vec<_>>();
        let short = "normal".chars().collect::<Vec<_>>();

        assert!(is_similar_above(&near, &variant, 0.9));
        assert!(!is_similar_above(&near, &short, 0.9));
        assert_eq!(
            is_similar_above(&near, &reversed, 0.5),
            similarity_ratio(&near, &reversed) > 0.5
        );
    }
}
