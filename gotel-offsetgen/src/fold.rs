// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Gap-and-fold: collapses the raw (version, offset) samples of one field
//! into the Variants the runtime index ships. A run of versions with
//! known offsets forms one Variant (equal consecutive offsets collapse
//! into a single `since` marker); a version with no offset closes the
//! Variant, and the next known offset opens a new one.

use std::collections::{BTreeMap, HashMap};

use gotel::offsets::{OffsetEntry, OffsetIndex, Variant, VersionRange};
use semver::Version;

use crate::manifest::WantedField;

/// Samples for one field, ordered by ascending version.
pub fn collapse(samples: &BTreeMap<Version, Option<u64>>) -> Vec<Variant> {
    let mut variants = Vec::new();
    let mut current: Option<Variant> = None;

    for (version, sample) in samples {
        match (sample, current.as_mut()) {
            (Some(offset), Some(variant)) => {
                variant.versions.newest = version.clone();
                let last = variant
                    .offsets
                    .last()
                    .map(|entry| entry.offset);
                if last != Some(*offset) {
                    variant.offsets.push(OffsetEntry {
                        offset: *offset,
                        since: version.clone(),
                    });
                }
            }
            (Some(offset), None) => {
                current = Some(Variant {
                    versions: VersionRange {
                        oldest: version.clone(),
                        newest: version.clone(),
                    },
                    offsets: vec![OffsetEntry {
                        offset: *offset,
                        since: version.clone(),
                    }],
                });
            }
            (None, Some(_)) => {
                if let Some(variant) = current.take() {
                    variants.push(variant);
                }
            }
            (None, None) => {}
        }
    }
    if let Some(variant) = current.take() {
        variants.push(variant);
    }

    // Offsets are accumulated oldest-first; the index stores newest-first.
    for variant in &mut variants {
        variant.offsets.reverse();
    }
    variants
}

/// Folds every field's samples into the serializable index document.
pub fn build_index(
    samples: &HashMap<WantedField, BTreeMap<Version, Option<u64>>>,
) -> OffsetIndex {
    let mut index = OffsetIndex::default();
    for (field, field_samples) in samples {
        let variants = collapse(field_samples);
        if variants.is_empty() {
            continue;
        }
        index
            .data
            .entry(field.struct_key())
            .or_default()
            .insert(field.field.clone(), variants);
    }
    index
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn samples(entries: &[(&str, Option<u64>)]) -> BTreeMap<Version, Option<u64>> {
        entries.iter().map(|(s, o)| (v(s), *o)).collect()
    }

    #[test]
    fn test_equal_consecutive_offsets_collapse() {
        // Builds at 1.0.0..1.4.0 report 10, 10, 16, 16, 16.
        let samples = samples(&[
            ("1.0.0", Some(10)),
            ("1.1.0", Some(10)),
            ("1.2.0", Some(16)),
            ("1.3.0", Some(16)),
            ("1.4.0", Some(16)),
        ]);
        let variants = collapse(&samples);
        assert_eq!(variants.len(), 1);
        let variant = &variants[0];
        assert_eq!(variant.versions.oldest, v("1.0.0"));
        assert_eq!(variant.versions.newest, v("1.4.0"));
        assert_eq!(
            variant.offsets,
            vec![
                OffsetEntry { offset: 16, since: v("1.2.0") },
                OffsetEntry { offset: 10, since: v("1.0.0") },
            ]
        );
    }

    #[test]
    fn test_constant_offset_yields_single_since() {
        let samples = samples(&[
            ("1.0.0", Some(7)),
            ("1.1.0", Some(7)),
            ("1.2.0", Some(7)),
            ("1.3.0", Some(7)),
        ]);
        let variants = collapse(&samples);
        assert_eq!(variants.len(), 1);
        assert_eq!(
            variants[0].offsets,
            vec![OffsetEntry { offset: 7, since: v("1.0.0") }]
        );
    }

    #[test]
    fn test_gap_splits_variants() {
        let samples = samples(&[
            ("1.0.0", Some(10)),
            ("1.1.0", Some(10)),
            ("1.2.0", None),
            ("1.3.0", Some(12)),
            ("1.4.0", Some(12)),
        ]);
        let variants = collapse(&samples);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].versions.oldest, v("1.0.0"));
        assert_eq!(variants[0].versions.newest, v("1.1.0"));
        assert_eq!(variants[1].versions.oldest, v("1.3.0"));
        assert_eq!(variants[1].versions.newest, v("1.4.0"));
        // Ranges are disjoint and exclude the gap.
        assert!(variants[0].versions.newest < variants[1].versions.oldest);
    }

    #[test]
    fn test_all_absent_yields_no_variants() {
        let samples = samples(&[("1.0.0", None), ("1.1.0", None)]);
        assert!(collapse(&samples).is_empty());
    }

    #[test]
    fn test_built_index_round_trips_through_the_runtime_parser() {
        let field = WantedField::new("net/http", "Request", "Method");
        let mut all = HashMap::new();
        all.insert(
            field,
            samples(&[
                ("1.0.0", Some(10)),
                ("1.1.0", Some(10)),
                ("1.2.0", None),
                ("1.3.0", Some(12)),
            ]),
        );
        let index = build_index(&all);
        let document = serde_json::to_string(&index).unwrap();
        let parsed = OffsetIndex::parse(&document).unwrap();

        assert_eq!(parsed.lookup("net/http.Request", "Method", &v("1.0.5")), Some(10));
        assert_eq!(parsed.lookup("net/http.Request", "Method", &v("1.2.0")), None);
        assert_eq!(parsed.lookup("net/http.Request", "Method", &v("1.3.0")), Some(12));
    }
}
