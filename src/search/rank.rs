//! Result ordering policies.

use std::cmp::Ordering;

use crate::model::Release;

/// How aggregated releases are ordered.
///
/// Sorting is stable: equal releases keep source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RankingPolicy {
    /// Keep the order sources were registered in.
    #[default]
    SourceOrder,
    /// Largest first; unknown sizes last.
    SizeDesc,
    /// Smallest first; unknown sizes last.
    SizeAsc,
    /// Most seeders first; releases without seeder counts last.
    SeedersDesc,
    /// Listed sources first, in list order; others after.
    SourcePriority(Vec<String>),
}

impl RankingPolicy {
    /// Sorts `releases` in place.
    pub fn rank(&self, releases: &mut [Release]) {
        match self {
            Self::SourceOrder => {}
            Self::SizeDesc => releases.sort_by(|a, b| known_first(a.size_bytes, b.size_bytes, true)),
            Self::SizeAsc => releases.sort_by(|a, b| known_first(a.size_bytes, b.size_bytes, false)),
            Self::SeedersDesc => releases.sort_by(|a, b| known_first(a.seeders, b.seeders, true)),
            Self::SourcePriority(order) => releases.sort_by_key(|r| {
                order
                    .iter()
                    .position(|name| *name == r.source)
                    .unwrap_or(order.len())
            }),
        }
    }
}

fn known_first<T: Ord>(a: Option<T>, b: Option<T>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if descending => b.cmp(&a),
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(source: &str, id: &str, size: Option<u64>, seeders: Option<u32>) -> Release {
        let mut release = Release::new(source, id, id);
        release.size_bytes = size;
        release.seeders = seeders;
        release
    }

    fn ids(releases: &[Release]) -> Vec<&str> {
        releases.iter().map(|r| r.source_id.as_str()).collect()
    }

    #[test]
    fn test_size_desc_ties_keep_source_order() {
        let mut releases = vec![
            release("a", "1", Some(10), None),
            release("b", "2", None, None),
            release("b", "3", Some(50), None),
            release("c", "4", Some(10), None),
        ];
        RankingPolicy::SizeDesc.rank(&mut releases);
        assert_eq!(ids(&releases), vec!["3", "1", "4", "2"]);

        RankingPolicy::SizeAsc.rank(&mut releases);
        assert_eq!(ids(&releases), vec!["1", "4", "3", "2"]);
    }

    #[test]
    fn test_seeders_desc_puts_unknown_last() {
        let mut releases = vec![
            release("t", "1", None, None),
            release("t", "2", None, Some(3)),
            release("t", "3", None, Some(40)),
        ];
        RankingPolicy::SeedersDesc.rank(&mut releases);
        assert_eq!(ids(&releases), vec!["3", "2", "1"]);
    }

    #[test]
    fn test_source_priority() {
        let mut releases = vec![
            release("x", "1", None, None),
            release("b", "2", None, None),
            release("a", "3", None, None),
            release("b", "4", None, None),
        ];
        RankingPolicy::SourcePriority(vec!["a".into(), "b".into()]).rank(&mut releases);
        assert_eq!(ids(&releases), vec!["3", "2", "4", "1"]);
    }
}
