//! Internal names: SQL-safe identifiers derived from an aggregation's path.
//!
//! Paths are joined with `__`, so a user name that itself contains `__` can
//! produce the same candidate as a deeper path (`["a__b"]` and `["a", "b"]`).
//! The registry hands out `_2`, `_3`, ... suffixes to keep the mapping
//! injective within a request.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NameKind {
    Metric,
    Bucket,
    Hits,
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    by_name: HashMap<String, Vec<String>>,
    by_path: HashMap<(NameKind, Vec<String>), String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `metric__<path>`; column aliases append `_col_<i>`.
    pub fn metric(&mut self, path: &[String]) -> String {
        self.assign(NameKind::Metric, path)
    }

    /// `aggr__<path>__`; column aliases append `key_<i>`, `count`, ...
    pub fn bucket(&mut self, path: &[String]) -> String {
        self.assign(NameKind::Bucket, path)
    }

    /// `top_hits__<path>`, for metrics answered per document.
    pub fn hits(&mut self, path: &[String]) -> String {
        self.assign(NameKind::Hits, path)
    }

    fn assign(&mut self, kind: NameKind, path: &[String]) -> String {
        let key = (kind, path.to_vec());
        if let Some(name) = self.by_path.get(&key) {
            return name.clone();
        }

        let joined = path.join("__");
        let mut attempt = 1usize;
        let name = loop {
            let suffix = if attempt == 1 {
                String::new()
            } else {
                format!("_{attempt}")
            };
            let candidate = match kind {
                NameKind::Metric => format!("metric__{joined}{suffix}"),
                NameKind::Bucket => format!("aggr__{joined}{suffix}__"),
                NameKind::Hits => format!("top_hits__{joined}{suffix}"),
            };
            if !self.by_name.contains_key(&candidate) {
                break candidate;
            }
            attempt += 1;
        };

        self.by_name.insert(name.clone(), path.to_vec());
        self.by_path.insert(key, name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn plain_paths_keep_their_candidate() {
        let mut names = NameRegistry::new();
        assert_eq!(names.bucket(&path(&["0"])), "aggr__0__");
        assert_eq!(names.metric(&path(&["0", "1"])), "metric__0__1");
        assert_eq!(names.hits(&path(&["0", "2"])), "top_hits__0__2");
    }

    #[test]
    fn separator_inside_a_name_does_not_collide() {
        let mut names = NameRegistry::new();
        let nested = names.bucket(&path(&["a", "b"]));
        let flat = names.bucket(&path(&["a__b"]));
        assert_eq!(nested, "aggr__a__b__");
        assert_eq!(flat, "aggr__a__b_2__");

        let nested = names.metric(&path(&["x", "y"]));
        let flat = names.metric(&path(&["x__y"]));
        assert_ne!(nested, flat);
    }

    #[test]
    fn suffix_candidates_are_not_reused() {
        let mut names = NameRegistry::new();
        let first = names.bucket(&path(&["a", "b"]));
        let second = names.bucket(&path(&["a__b"]));
        let third = names.bucket(&path(&["a", "b_2"]));
        let all: HashSet<&String> = [&first, &second, &third].into_iter().collect();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn same_path_gets_the_same_name() {
        let mut names = NameRegistry::new();
        let first = names.metric(&path(&["m"]));
        let again = names.metric(&path(&["m"]));
        assert_eq!(first, again);
    }

    #[test]
    fn adversarial_paths_stay_injective() {
        let paths = [
            path(&["a"]),
            path(&["a", ""]),
            path(&["a__"]),
            path(&["", "a"]),
            path(&["__a"]),
            path(&["a", "b", "c"]),
            path(&["a__b", "c"]),
            path(&["a", "b__c"]),
            path(&["a__b__c"]),
            path(&["a_2"]),
            path(&["a", "_2"]),
        ];
        let mut names = NameRegistry::new();
        let metrics: HashSet<String> = paths.iter().map(|p| names.metric(p)).collect();
        let buckets: HashSet<String> = paths.iter().map(|p| names.bucket(p)).collect();
        assert_eq!(metrics.len(), paths.len());
        assert_eq!(buckets.len(), paths.len());
    }
}
