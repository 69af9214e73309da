//! Tests for the coverage model, merge rules and classification.

#![allow(clippy::float_cmp, clippy::redundant_clone)]

use std::fs;

use proptest::prelude::*;

use super::*;
use crate::report::Verdict;
use crate::snippet::{RoutineRef, Snippet};

fn file_with(full: &[u32], partial: &[u32], not: &[u32]) -> CoverageInfo {
    let mut info = CoverageInfo::new();
    info.insert_file(
        "src/lib.rs",
        FileCoverage {
            full: full.iter().copied().collect(),
            partial: partial.iter().copied().collect(),
            not: not.iter().copied().collect(),
        },
    );
    info
}

// ============================================================================
// Line status ordering
// ============================================================================

mod line_status_tests {
    use super::*;

    #[test]
    fn test_total_order() {
        assert!(LineStatus::Empty < LineStatus::NotCovered);
        assert!(LineStatus::NotCovered < LineStatus::PartlyCovered);
        assert!(LineStatus::PartlyCovered < LineStatus::FullyCovered);
    }

    #[test]
    fn test_from_probes() {
        assert_eq!(LineStatus::from_probes(0, 0), LineStatus::Empty);
        assert_eq!(LineStatus::from_probes(0, 2), LineStatus::NotCovered);
        assert_eq!(LineStatus::from_probes(1, 2), LineStatus::PartlyCovered);
        assert_eq!(LineStatus::from_probes(2, 2), LineStatus::FullyCovered);
    }

    #[test]
    fn test_record_never_lowers() {
        let mut info = CoverageInfo::new();
        info.record("f", 7, LineStatus::FullyCovered);
        info.record("f", 7, LineStatus::NotCovered);
        info.record("f", 7, LineStatus::PartlyCovered);
        assert_eq!(info.status("f", 7), LineStatus::FullyCovered);
        assert!(info.is_disjoint());
    }

    #[test]
    fn test_empty_lines_never_enter_sets() {
        let mut info = CoverageInfo::new();
        info.record("f", 1, LineStatus::Empty);
        assert!(info.is_empty());
    }
}

// ============================================================================
// Merge
// ============================================================================

mod merge_tests {
    use super::*;

    /// Full {1,2,3} merged with partial {3,4} keeps line 3 only as full
    #[test]
    fn test_full_beats_partial_overlap() {
        let first = file_with(&[1, 2, 3], &[], &[]);
        let second = file_with(&[], &[3, 4], &[]);
        let merged = first.merged(&second);
        let file = merged.file("src/lib.rs").unwrap();
        assert_eq!(file.full.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(file.partial.iter().copied().collect::<Vec<_>>(), vec![4]);
        assert!(file.not.is_empty());
    }

    #[test]
    fn test_partial_beats_not_covered() {
        let merged = file_with(&[], &[], &[5, 6]).merged(&file_with(&[], &[6], &[]));
        assert_eq!(merged.status("src/lib.rs", 5), LineStatus::NotCovered);
        assert_eq!(merged.status("src/lib.rs", 6), LineStatus::PartlyCovered);
    }

    #[test]
    fn test_merge_keeps_other_files() {
        let mut other = CoverageInfo::new();
        other.record("src/other.rs", 1, LineStatus::NotCovered);
        let merged = file_with(&[1], &[], &[]).merged(&other);
        assert_eq!(merged.files().count(), 2);
    }

    fn arb_coverage() -> impl Strategy<Value = CoverageInfo> {
        let file = prop::sample::select(vec!["a.rs", "b.rs", "c.rs"]);
        let status = prop::sample::select(vec![
            LineStatus::NotCovered,
            LineStatus::PartlyCovered,
            LineStatus::FullyCovered,
        ]);
        prop::collection::vec((file, 1u32..40, status), 0..60).prop_map(|entries| {
            let mut info = CoverageInfo::new();
            for (file, line, status) in entries {
                info.record(file, line, status);
            }
            info
        })
    }

    fn arb_raw_file() -> impl Strategy<Value = FileCoverage> {
        let lines = || prop::collection::btree_set(1u32..30, 0..20);
        (lines(), lines(), lines()).prop_map(|(full, partial, not)| FileCoverage { full, partial, not })
    }

    proptest! {
        #[test]
        fn prop_merge_is_disjoint(a in arb_coverage(), b in arb_coverage(), c in arb_coverage()) {
            let merged = a.merged(&b).merged(&c);
            prop_assert!(merged.is_disjoint());
        }

        #[test]
        fn prop_merge_is_commutative(a in arb_coverage(), b in arb_coverage()) {
            prop_assert_eq!(a.clone().merged(&b), b.merged(&a));
        }

        #[test]
        fn prop_merge_is_associative(a in arb_coverage(), b in arb_coverage(), c in arb_coverage()) {
            let left = a.clone().merged(&b).merged(&c);
            let right = a.merged(&b.merged(&c));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_fully_covered_dominates(a in arb_coverage(), b in arb_coverage()) {
            let merged = a.clone().merged(&b);
            for (file, coverage) in a.files().chain(b.files()) {
                for line in &coverage.full {
                    prop_assert_eq!(merged.status(file, *line), LineStatus::FullyCovered);
                }
            }
        }

        #[test]
        fn prop_merge_takes_maximum(a in arb_coverage(), b in arb_coverage(), line in 1u32..40) {
            let merged = a.clone().merged(&b);
            for file in ["a.rs", "b.rs", "c.rs"] {
                let expected = a.status(file, line).max(b.status(file, line));
                prop_assert_eq!(merged.status(file, line), expected);
            }
        }

        #[test]
        fn prop_inserting_raw_sets_cleans(raw in arb_raw_file()) {
            let mut info = CoverageInfo::new();
            info.insert_file("x.rs", raw.clone());
            prop_assert!(info.is_disjoint());
            for line in &raw.full {
                prop_assert_eq!(info.status("x.rs", *line), LineStatus::FullyCovered);
            }
        }

        #[test]
        fn prop_wire_round_trip(a in arb_coverage()) {
            let json = serde_json::to_string(&a).unwrap();
            let back: CoverageInfo = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, a);
        }
    }
}

// ============================================================================
// Verdict tolerance
// ============================================================================

mod verdict_tests {
    use super::*;

    #[test]
    fn test_within_tolerance_is_covered() {
        assert_eq!(verdict_for(99.95, 100.0), Verdict::Covered);
    }

    #[test]
    fn test_outside_tolerance_is_not_covered() {
        assert_eq!(verdict_for(99.8, 100.0), Verdict::NotCovered);
    }

    #[test]
    fn test_exact_and_above() {
        assert_eq!(verdict_for(50.0, 50.0), Verdict::Covered);
        assert_eq!(verdict_for(80.0, 50.0), Verdict::Covered);
        assert_eq!(verdict_for(0.0, 0.0), Verdict::Covered);
    }
}

// ============================================================================
// Classification
// ============================================================================

mod classify_tests {
    use super::*;

    /// `compute` spans lines 3..=12, `helper` lines 14..=16
    const LIB: &str = "pub struct Calc;\n\
impl Calc {\n\
    pub fn compute(x: i64) -> i64 {\n\
        let mut y = x;\n\
        if y > 10 {\n\
            y -= 10;\n\
        }\n\
        if y < 0 {\n\
            y = -y;\n\
        }\n\
        helper(y)\n\
    }\n\
}\n\
fn helper(v: i64) -> i64 {\n\
    v * 2\n\
}\n";

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), LIB).unwrap();
        dir
    }

    fn snippet(required: f64) -> Snippet {
        Snippet::new("calc", "src/lib.rs", RoutineRef::method("Calc", "compute")).with_required_coverage(required)
    }

    /// `compute` spans lines 3..=12; probe ten of them, cover six
    fn six_of_ten() -> CoverageInfo {
        let mut info = CoverageInfo::new();
        for line in [3, 4, 5, 8, 11, 12] {
            info.record("src/lib.rs", line, LineStatus::FullyCovered);
        }
        for line in [6, 7, 9, 10] {
            info.record("src/lib.rs", line, LineStatus::NotCovered);
        }
        info.record("src/lib.rs", 15, LineStatus::NotCovered);
        info
    }

    #[test]
    fn test_six_of_ten_meets_fifty_percent() {
        let dir = project();
        let classifier = CoverageClassifier::new(dir.path());
        let result = classifier.classify(&snippet(50.0), &six_of_ten()).unwrap();
        assert_eq!(result.lines_to_cover, 10);
        assert_eq!(result.lines_covered, 6);
        assert_eq!(result.achieved, 60.0);
        assert_eq!(result.verdict, Verdict::Covered);
    }

    #[test]
    fn test_short_of_requirement() {
        let dir = project();
        let classifier = CoverageClassifier::new(dir.path());
        let result = classifier.classify(&snippet(80.0), &six_of_ten()).unwrap();
        assert_eq!(result.verdict, Verdict::NotCovered);
    }

    #[test]
    fn test_partial_lines_count_as_covered() {
        let dir = project();
        let mut info = six_of_ten();
        info.record("src/lib.rs", 6, LineStatus::PartlyCovered);
        let result = CoverageClassifier::new(dir.path()).classify(&snippet(50.0), &info).unwrap();
        assert_eq!(result.lines_covered, 7);
    }

    #[test]
    fn test_included_helper_counts() {
        let dir = project();
        let snippet = snippet(50.0).with_include(RoutineRef::function("helper"));
        let result = CoverageClassifier::new(dir.path()).classify(&snippet, &six_of_ten()).unwrap();
        assert_eq!(result.lines_to_cover, 11);
        assert_eq!(result.lines_covered, 6);
        assert_eq!(result.ranges["src/lib.rs"].len(), 2);
    }

    #[test]
    fn test_overlapping_ranges_count_lines_once() {
        let dir = project();
        let snippet = snippet(50.0).with_include(RoutineRef::method("Calc", "compute"));
        let result = CoverageClassifier::new(dir.path()).classify(&snippet, &six_of_ten()).unwrap();
        assert_eq!(result.lines_to_cover, 10);
    }

    #[test]
    fn test_include_searched_in_probed_files_when_absent_from_primary() {
        let dir = project();
        fs::write(dir.path().join("src/fmt.rs"), "fn format_total(v: i64) -> String {\n    v.to_string()\n}\n").unwrap();
        let mut info = six_of_ten();
        info.record("src/fmt.rs", 2, LineStatus::FullyCovered);
        info.record("src/gone.rs", 1, LineStatus::NotCovered);
        let snippet = snippet(50.0).with_include(RoutineRef::function("format_total"));
        let result = CoverageClassifier::new(dir.path()).classify(&snippet, &info).unwrap();
        assert_eq!(result.lines_to_cover, 11);
        assert_eq!(result.lines_covered, 7);
        assert!(result.ranges.contains_key("src/fmt.rs"));
        assert!(!result.ranges.contains_key("src/gone.rs"));
    }

    #[test]
    fn test_include_resolves_to_first_defining_file() {
        let dir = project();
        fs::write(
            dir.path().join("src/other.rs"),
            "fn helper() {\n    let a = 1;\n    let b = 2;\n    let _ = a + b;\n}\n",
        )
        .unwrap();
        let mut info = six_of_ten();
        info.record("src/lib.rs", 15, LineStatus::FullyCovered);
        for line in 2..=4 {
            info.record("src/other.rs", line, LineStatus::NotCovered);
        }
        let snippet = snippet(100.0).with_include(RoutineRef::function("helper"));

        let result = CoverageClassifier::new(dir.path()).classify(&snippet, &info).unwrap();

        assert_eq!(result.lines_to_cover, 11);
        assert_eq!(result.lines_covered, 7);
        assert!(!result.ranges.contains_key("src/other.rs"));
    }

    #[test]
    fn test_no_probed_lines_is_an_error() {
        let dir = project();
        let err = CoverageClassifier::new(dir.path())
            .classify(&snippet(50.0), &CoverageInfo::new())
            .unwrap_err();
        assert!(matches!(err, ClassifyError::NoLinesToCover { .. }));
    }

    #[test]
    fn test_missing_primary_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoverageClassifier::new(dir.path())
            .classify(&snippet(50.0), &six_of_ten())
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Read { .. }));
    }

    #[test]
    fn test_ranges_memoized_across_calls() {
        let dir = project();
        let classifier = CoverageClassifier::new(dir.path());
        classifier.classify(&snippet(50.0), &six_of_ten()).unwrap();
        classifier.classify(&snippet(90.0), &six_of_ten()).unwrap();
        assert_eq!(classifier.index().parse_count(), 1);
    }

    #[test]
    fn test_merge_order_does_not_change_percentage() {
        let dir = project();
        let classifier = CoverageClassifier::new(dir.path());
        let mut first = CoverageInfo::new();
        first.record("src/lib.rs", 3, LineStatus::FullyCovered);
        first.record("src/lib.rs", 4, LineStatus::NotCovered);
        let mut second = CoverageInfo::new();
        second.record("src/lib.rs", 4, LineStatus::PartlyCovered);
        second.record("src/lib.rs", 5, LineStatus::NotCovered);

        let ab = classifier.classify(&snippet(50.0), &first.clone().merged(&second)).unwrap();
        let ba = classifier.classify(&snippet(50.0), &second.merged(&first)).unwrap();
        assert_eq!(ab.achieved, ba.achieved);
        assert_eq!(ab.lines_covered, 2);
        assert_eq!(ab.lines_to_cover, 3);
    }
}
