// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! The field-offset oracle. Struct-field offsets in the target's linked
//! libraries move between releases; every kernel-side read of such a field
//! goes through this index at the exact version the target was built with.
//!
//! The index is produced offline by `gotel-offsetgen`, serialized as a
//! single JSON document and embedded in the shipped binary. It is parsed
//! once at startup and never mutated; lookups allocate nothing.

use std::{collections::HashMap, str::FromStr};

use semver::{Prerelease, Version};
use serde::{Deserialize, Serialize};

use crate::errors::GotelError;

/// Version-indexed map from `(struct, field)` to byte offset.
///
/// Keys of `data` are `"<package-path>.<StructName>"`, e.g. `"runtime.g"`
/// or `"net/http.Request"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffsetIndex {
    pub data: HashMap<String, FieldMap>,
}

pub type FieldMap = HashMap<String, Vec<Variant>>;

/// A contiguous version range within which a field's offsets form a
/// newest-first list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub versions: VersionRange,
    pub offsets: Vec<OffsetEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub oldest: Version,
    pub newest: Version,
}

impl VersionRange {
    pub fn contains(&self, v: &Version) -> bool {
        *v >= self.oldest && *v <= self.newest
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEntry {
    pub offset: u64,
    pub since: Version,
}

impl OffsetIndex {
    /// Parses and validates an index document.
    pub fn parse(document: &str) -> Result<Self, GotelError> {
        let index: OffsetIndex = serde_json::from_str(document)
            .map_err(|e| GotelError::Error(format!("malformed offset index: {e}")))?;
        index.validate()?;
        Ok(index)
    }

    /// The index bundled into the binary at compile time.
    pub fn bundled() -> Result<Self, GotelError> {
        Self::parse(include_str!("../assets/offset_results.json"))
    }

    /// Looks up the offset of `strct.field` at `version`.
    ///
    /// Selection: the first Variant whose `[oldest, newest]` range contains
    /// `version`, then within it the first (newest-first) entry with
    /// `since <= version`. A version outside every range, or inside a gap
    /// between Variants, yields `None`.
    pub fn lookup(&self, strct: &str, field: &str, version: &Version) -> Option<u64> {
        let variants = self.data.get(strct)?.get(field)?;
        let variant = variants.iter().find(|v| v.versions.contains(version))?;
        variant
            .offsets
            .iter()
            .find(|entry| entry.since <= *version)
            .map(|entry| entry.offset)
    }

    /// Like [`lookup`](Self::lookup) but misses are an error naming the
    /// field, for probes that cannot run without it.
    pub fn must_lookup(
        &self,
        strct: &str,
        field: &str,
        version: &Version,
    ) -> Result<u64, GotelError> {
        self.lookup(strct, field, version)
            .ok_or_else(|| GotelError::OffsetMissing {
                strct: strct.to_string(),
                field: field.to_string(),
                version: version.clone(),
            })
    }

    fn validate(&self) -> Result<(), GotelError> {
        for (strct, fields) in &self.data {
            for (field, variants) in fields {
                for variant in variants {
                    if variant.versions.oldest > variant.versions.newest {
                        return Err(GotelError::Error(format!(
                            "offset index {strct}.{field}: inverted version range"
                        )));
                    }
                    let newest_first = variant
                        .offsets
                        .windows(2)
                        .all(|w| w[0].since > w[1].since);
                    if variant.offsets.is_empty() || !newest_first {
                        return Err(GotelError::Error(format!(
                            "offset index {strct}.{field}: offsets must be non-empty and newest-first"
                        )));
                    }
                }
                for (i, a) in variants.iter().enumerate() {
                    for b in &variants[i + 1..] {
                        if a.versions.contains(&b.versions.oldest)
                            || a.versions.contains(&b.versions.newest)
                            || b.versions.contains(&a.versions.oldest)
                        {
                            return Err(GotelError::Error(format!(
                                "offset index {strct}.{field}: overlapping variant ranges"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Normalizes the version spellings found in Go binaries to semver.
///
/// Accepts `go1.21.3`, `v1.2.3`, `1.21` (missing patch), and pre-release
/// stamps such as `go1.22rc1`.
pub fn parse_go_version(s: &str) -> Result<Version, GotelError> {
    let s = s.trim();
    let s = s.strip_prefix("go").or_else(|| s.strip_prefix('v')).unwrap_or(s);

    // Split a trailing pre-release tag (rc1, beta2) off the numeric triple.
    let (numeric, pre) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], Some(&s[i..])),
        None => (s, None),
    };
    let numeric = numeric.trim_end_matches(['.', '-']);

    let mut parts = numeric.split('.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    let patch = match parts.next() {
        Some(p) => p.parse().ok(),
        None => Some(0),
    };
    let (Some(major), Some(minor), Some(patch)) = (major, minor, patch) else {
        return Err(GotelError::Error(format!("unparseable version \"{s}\"")));
    };

    let mut version = Version::new(major, minor, patch);
    if let Some(pre) = pre {
        version.pre = Prerelease::from_str(pre)
            .map_err(|e| GotelError::Error(format!("bad pre-release in \"{s}\": {e}")))?;
    }
    Ok(version)
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    /// Index with struct "S", field "f", one variant covering
    /// [1.7.0, 1.10.0] with four since markers.
    fn sample_index() -> OffsetIndex {
        let doc = r#"
        {
          "data": {
            "S": {
              "f": [
                {
                  "versions": { "oldest": "1.7.0", "newest": "1.10.0" },
                  "offsets": [
                    { "offset": 7, "since": "1.9.0" },
                    { "offset": 6, "since": "1.8.2" },
                    { "offset": 4, "since": "1.8.0" },
                    { "offset": 2, "since": "1.7.0" }
                  ]
                }
              ]
            }
          }
        }"#;
        OffsetIndex::parse(doc).unwrap()
    }

    #[test]
    fn test_lookup_exact_boundaries() {
        let index = sample_index();
        assert_eq!(index.lookup("S", "f", &v("1.7.0")), Some(2));
        assert_eq!(index.lookup("S", "f", &v("1.8.1")), Some(4));
        assert_eq!(index.lookup("S", "f", &v("1.8.2")), Some(6));
        assert_eq!(index.lookup("S", "f", &v("1.10.0")), Some(7));
        assert_eq!(index.lookup("S", "f", &v("1.10.1")), None);
        assert_eq!(index.lookup("S", "f", &v("1.6.9")), None);
    }

    #[test]
    fn test_lookup_unknown_struct_or_field() {
        let index = sample_index();
        assert_eq!(index.lookup("T", "f", &v("1.8.0")), None);
        assert_eq!(index.lookup("S", "g", &v("1.8.0")), None);
    }

    #[test]
    fn test_lookup_gap_between_variants() {
        let doc = r#"
        {
          "data": {
            "S": {
              "f": [
                { "versions": { "oldest": "1.0.0", "newest": "1.1.0" },
                  "offsets": [ { "offset": 10, "since": "1.0.0" } ] },
                { "versions": { "oldest": "1.3.0", "newest": "1.4.0" },
                  "offsets": [ { "offset": 16, "since": "1.3.0" } ] }
              ]
            }
          }
        }"#;
        let index = OffsetIndex::parse(doc).unwrap();
        assert_eq!(index.lookup("S", "f", &v("1.1.0")), Some(10));
        assert_eq!(index.lookup("S", "f", &v("1.2.0")), None);
        assert_eq!(index.lookup("S", "f", &v("1.3.0")), Some(16));
    }

    #[test]
    fn test_round_trip_preserves_lookups() {
        let index = sample_index();
        let doc = serde_json::to_string(&index).unwrap();
        let reparsed = OffsetIndex::parse(&doc).unwrap();
        for sample in ["1.7.0", "1.8.1", "1.8.2", "1.9.5", "1.10.0", "1.6.9", "2.0.0"] {
            assert_eq!(
                index.lookup("S", "f", &v(sample)),
                reparsed.lookup("S", "f", &v(sample)),
                "diverged at {sample}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_overlapping_ranges() {
        let doc = r#"
        {
          "data": {
            "S": {
              "f": [
                { "versions": { "oldest": "1.0.0", "newest": "1.2.0" },
                  "offsets": [ { "offset": 1, "since": "1.0.0" } ] },
                { "versions": { "oldest": "1.1.0", "newest": "1.3.0" },
                  "offsets": [ { "offset": 2, "since": "1.1.0" } ] }
              ]
            }
          }
        }"#;
        assert!(OffsetIndex::parse(doc).is_err());
    }

    #[test]
    fn test_validate_rejects_oldest_first_offsets() {
        let doc = r#"
        {
          "data": {
            "S": {
              "f": [
                { "versions": { "oldest": "1.0.0", "newest": "1.2.0" },
                  "offsets": [
                    { "offset": 1, "since": "1.0.0" },
                    { "offset": 2, "since": "1.1.0" }
                  ] }
              ]
            }
          }
        }"#;
        assert!(OffsetIndex::parse(doc).is_err());
    }

    #[test]
    fn test_bundled_index_parses() {
        let index = OffsetIndex::bundled().unwrap();
        assert!(
            index
                .lookup("runtime.g", "goid", &v("1.21.0"))
                .is_some()
        );
    }

    #[test]
    fn test_parse_go_version_spellings() {
        assert_eq!(parse_go_version("go1.21.3").unwrap(), v("1.21.3"));
        assert_eq!(parse_go_version("1.21").unwrap(), v("1.21.0"));
        assert_eq!(parse_go_version("v1.2.3").unwrap(), v("1.2.3"));
        let rc = parse_go_version("go1.22rc1").unwrap();
        assert_eq!((rc.major, rc.minor, rc.patch), (1, 22, 0));
        assert!(rc < v("1.22.0"));
        assert!(parse_go_version("devel").is_err());
    }
}
