use super::array::{format_array_arg, parse_array_arg, ArrayError};
use std::collections::BTreeSet;

fn set(indices: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
    indices.into_iter().collect()
}

#[test]
pub fn format_collapses_long_runs() {
    assert_eq!(format_array_arg(&set(1..=10)), "1-10");
    assert_eq!(format_array_arg(&set(0..=4)), "0-4");
}

#[test]
pub fn format_keeps_short_runs_apart() {
    // a run of two is left as two comma items on purpose
    assert_eq!(format_array_arg(&set([4, 5])), "4,5");
    assert_eq!(format_array_arg(&set([1, 2, 3, 5, 7])), "1,2,3,5,7");
    assert_eq!(format_array_arg(&set([7])), "7");
    assert_eq!(format_array_arg(&set([])), "");
}

#[test]
pub fn format_mixes_runs_and_singles() {
    assert_eq!(format_array_arg(&set([0, 1, 2, 3, 7, 9, 10])), "0-3,7,9,10");
    assert_eq!(format_array_arg(&set([2, 3, 4, 8, 9, 10])), "2-4,8-10");
}

#[test]
pub fn parse_expands_ranges_and_steps() {
    assert_eq!(parse_array_arg("1-10").unwrap(), set(1..=10));
    assert_eq!(parse_array_arg("0-9:2").unwrap(), set([0, 2, 4, 6, 8]));
    assert_eq!(parse_array_arg("3").unwrap(), set([3]));
    assert_eq!(parse_array_arg("1,2,3,5,7").unwrap(), set([1, 2, 3, 5, 7]));
}

#[test]
pub fn parse_unions_overlapping_tokens() {
    assert_eq!(parse_array_arg("1-3,2-4").unwrap(), set([1, 2, 3, 4]));
    assert_eq!(parse_array_arg("5,5,5").unwrap(), set([5]));
}

#[test]
pub fn parse_tolerates_descending_ranges() {
    // sbatch treats 5-3 as an empty selection, so do we
    assert_eq!(parse_array_arg("5-3").unwrap(), set([]));
    assert_eq!(parse_array_arg("5-3,1").unwrap(), set([1]));
}

#[test]
pub fn parse_rejects_malformed_tokens() {
    assert_eq!(
        parse_array_arg("a"),
        Err(ArrayError::InvalidIndex("a".to_owned()))
    );
    assert_eq!(
        parse_array_arg("1-"),
        Err(ArrayError::InvalidRange("1-".to_owned()))
    );
    assert_eq!(
        parse_array_arg("-3"),
        Err(ArrayError::InvalidRange("-3".to_owned()))
    );
    assert_eq!(
        parse_array_arg("1-5:x"),
        Err(ArrayError::InvalidRange("1-5:x".to_owned()))
    );
    assert_eq!(
        parse_array_arg("1-5:0"),
        Err(ArrayError::ZeroStep("1-5:0".to_owned()))
    );
    assert!(parse_array_arg("").is_err());
}

#[test]
pub fn round_trips() {
    let samples = [
        set([0]),
        set([4, 5]),
        set([1, 2, 3, 5, 7]),
        set(1..=10),
        set([0, 1, 2, 3, 7, 9, 10, 64, 65, 66]),
        set((0..=30).step_by(3)),
    ];

    for sample in samples {
        assert_eq!(
            parse_array_arg(&format_array_arg(&sample)).unwrap(),
            sample,
            "round trip failed for {sample:?}"
        );
    }
}
