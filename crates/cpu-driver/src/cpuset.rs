//! Immutable sets of logical CPU IDs

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

#[derive(Debug, thiserror::Error)]
#[error("invalid CPU list `{input}`: {source}")]
pub struct CpuSetParseError {
    input: String,
    #[source]
    source: cpulist::Error,
}

/// An immutable set of CPU IDs.
///
/// All set algebra returns a new set. The canonical string form is the Linux
/// cpulist format (`0-3,8`), with the empty set rendering as an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet {
    cpus: BTreeSet<u32>,
}

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        self.cpus.union(&other.cpus).copied().collect()
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        self.cpus.intersection(&other.cpus).copied().collect()
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        self.cpus.difference(&other.cpus).copied().collect()
    }

    pub fn size(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    /// Lowest CPU ID in the set.
    pub fn first(&self) -> Option<u32> {
        self.cpus.first().copied()
    }

    /// CPU IDs in ascending order.
    pub fn list(&self) -> Vec<u32> {
        self.cpus.iter().copied().collect()
    }

    /// CPU IDs in no particular order; callers must not rely on any ordering.
    pub fn unsorted_list(&self) -> Vec<u32> {
        self.list()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpus.iter().copied()
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[u32; N]> for CpuSet {
    fn from(cpus: [u32; N]) -> Self {
        cpus.into_iter().collect()
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&cpulist::emit(self.iter()))
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::new());
        }
        cpulist::parse(s)
            .map(|cpus| cpus.into_iter().collect())
            .map_err(|source| CpuSetParseError {
                input: s.to_string(),
                source,
            })
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn set_algebra() {
        let a = CpuSet::from([0, 1, 2, 3]);
        let b = CpuSet::from([2, 3, 4]);

        assert_eq!(a.union(&b), CpuSet::from([0, 1, 2, 3, 4]));
        assert_eq!(a.intersection(&b), CpuSet::from([2, 3]));
        assert_eq!(a.difference(&b), CpuSet::from([0, 1]));
        assert_eq!(a.size(), 4);
        assert!(CpuSet::from([2, 3]).is_subset_of(&a));
        assert!(!b.is_subset_of(&a));
        assert_eq!(b.first(), Some(2));
    }

    #[test]
    fn canonical_string_form() {
        assert_eq!(CpuSet::from([0, 1, 2, 3, 8]).to_string(), "0-3,8");
        assert_eq!(CpuSet::from([5]).to_string(), "5");
        assert_eq!(CpuSet::new().to_string(), "");
    }

    #[test]
    fn parses_cpulist_strings() {
        let set: CpuSet = "0-2,7,10-11".parse().unwrap();
        assert_eq!(set.list(), vec![0, 1, 2, 7, 10, 11]);
        assert!("".parse::<CpuSet>().unwrap().is_empty());
        assert!("0-x".parse::<CpuSet>().is_err());
    }

    #[test]
    fn list_is_sorted() {
        let set: CpuSet = [9, 1, 5].into_iter().collect();
        assert_eq!(set.list(), vec![1, 5, 9]);
        let mut unsorted = set.unsorted_list();
        unsorted.sort_unstable();
        assert_eq!(unsorted, set.list());
    }
}
