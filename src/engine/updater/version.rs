//! Version Ordering
//!
//! Total order over dot-separated version strings. Numeric segments compare
//! numerically, missing segments count as zero, and anything that does not
//! parse sorts below every well-formed version. A letter suffix on the last
//! core segment (`1.0.0rc1`) is read as a pre-release of that core.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Numeric(u64),
    Alpha(String),
}

impl Segment {
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        if raw.chars().all(|c| c.is_ascii_digit()) {
            raw.parse().ok().map(Segment::Numeric)
        } else {
            Some(Segment::Alpha(raw.to_string()))
        }
    }

    fn compare_to(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Numeric(a), Segment::Numeric(b)) => a.cmp(b),
            (Segment::Numeric(_), Segment::Alpha(_)) => Ordering::Less,
            (Segment::Alpha(_), Segment::Numeric(_)) => Ordering::Greater,
            (Segment::Alpha(a), Segment::Alpha(b)) => a.cmp(b),
        }
    }
}

/// Split a core segment into its number and any trailing letter suffix.
fn split_core_segment(raw: &str) -> Option<(u64, Option<&str>)> {
    let digits = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    if digits == 0 {
        return None;
    }
    let number = raw[..digits].parse().ok()?;
    let suffix = &raw[digits..];
    if suffix.is_empty() {
        Some((number, None))
    } else if suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some((number, Some(suffix)))
    } else {
        None
    }
}

/// A parsed version string.
#[derive(Debug, Clone)]
pub struct Version {
    core: Vec<u64>,
    pre: Vec<Segment>,
}

impl Version {
    /// Parse a version string, returning `None` when it is malformed.
    ///
    /// Accepts an optional leading `v`, a dotted numeric core, an optional
    /// `-pre` suffix and ignores `+build` metadata. Only the last core
    /// segment may carry letters, which then lead the pre-release.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core_raw, pre_raw) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let parts: Vec<&str> = core_raw.split('.').collect();
        let mut core = Vec::with_capacity(parts.len());
        let mut pre = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let (number, suffix) = split_core_segment(part)?;
            core.push(number);
            if let Some(suffix) = suffix {
                if i + 1 != parts.len() {
                    return None;
                }
                pre.push(Segment::parse(suffix)?);
            }
        }
        if let Some(pre_raw) = pre_raw {
            for part in pre_raw.split('.') {
                pre.push(Segment::parse(part)?);
            }
        }

        Some(Self { core, pre })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.core.len().max(other.core.len());
        for i in 0..len {
            let a = self.core.get(i).copied().unwrap_or(0);
            let b = other.core.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }

        // A pre-release sorts before the release it precedes.
        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                for (a, b) in self.pre.iter().zip(other.pre.iter()) {
                    match a.compare_to(b) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                self.pre.len().cmp(&other.pre.len())
            }
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality follows the ordering, so "2.0" == "2.0.0".
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

/// Compare two version strings.
///
/// Malformed strings are lower than any valid version; two malformed strings
/// fall back to plain string order so the ordering stays total.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Whether `candidate` is strictly newer than `current`.
///
/// A malformed candidate is never newer.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    is_valid(candidate) && compare(candidate, current) == Ordering::Greater
}

/// Whether a string is a syntactically valid version.
pub fn is_valid(raw: &str) -> bool {
    Version::parse(raw).is_some()
}

/// Sort versions highest first.
pub fn sort_descending(versions: &mut [String]) {
    versions.sort_by(|a, b| compare(b, a));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_compare_numerically() {
        assert_eq!(compare("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare("2.0.5", "2.1.0"), Ordering::Less);
        assert_eq!(compare("0.2.0", "0.10.0"), Ordering::Less);
    }

    #[test]
    fn test_missing_segments_are_zero() {
        assert_eq!(compare("2.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare("2", "2.0.1"), Ordering::Less);
        assert_eq!(compare("v1.2", "1.2.0"), Ordering::Equal);
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        assert_eq!(compare("1.0.0-beta.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare("1.0.0-beta.2", "1.0.0-beta.1"), Ordering::Greater);
        assert_eq!(compare("1.0.0-alpha", "1.0.0-beta"), Ordering::Less);
        assert_eq!(compare("1.0.0+build7", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_malformed_sorts_lowest() {
        assert_eq!(compare("", "0.0.1"), Ordering::Less);
        assert_eq!(compare("1..2", "0.0.1"), Ordering::Less);
        assert_eq!(compare("0.0.1", "not a version"), Ordering::Greater);
        assert_eq!(compare("x/y", "x/y"), Ordering::Equal);
        assert!(!is_valid(".tmp"));
        assert!(is_valid("1.0.0rc1"));
        assert!(!is_valid("1.0.x"));
        assert!(!is_valid("1.0beta.2"));
    }

    #[test]
    fn test_letter_suffix_is_a_prerelease() {
        assert_eq!(compare("2.0.0beta", "2.0.1"), Ordering::Less);
        assert_eq!(compare("2.0.0beta", "2.0.0"), Ordering::Less);
        assert_eq!(compare("1.0.0rc1", "1.0.0-rc1"), Ordering::Equal);
        assert_eq!(compare("1.0.0rc2", "1.0.0rc1"), Ordering::Greater);
        assert!(!is_newer("1.0.x", "1.0.999"));
        assert!(!is_newer("2.0.0beta", "2.0.1"));
    }

    #[test]
    fn test_equality_agrees_with_ordering() {
        let short = Version::parse("2.0").unwrap();
        let long = Version::parse("v2.0.0+build3").unwrap();
        assert_eq!(short, long);
        assert_eq!(short.cmp(&long), Ordering::Equal);
        assert_ne!(short, Version::parse("2.0.0-rc.1").unwrap());
    }

    #[test]
    fn test_is_newer_requires_strictly_greater() {
        assert!(is_newer("2.1.0", "2.0.5"));
        assert!(!is_newer("2.0.5", "2.0.5"));
        assert!(!is_newer("2.0.4", "2.0.5"));
        assert!(!is_newer("garbage!", ""));
        assert!(is_newer("0.0.1", ""));
    }

    #[test]
    fn test_sort_descending() {
        let mut versions = vec![
            "0.1.0".to_string(),
            "bogus dir".to_string(),
            "0.10.0".to_string(),
            "0.2.0".to_string(),
        ];
        sort_descending(&mut versions);
        assert_eq!(versions, vec!["0.10.0", "0.2.0", "0.1.0", "bogus dir"]);
    }
}
