//! Input splitting and bin packing.
//!
//! Files are carved into byte-range splits no larger than the configured split
//! size, and splits are then packed into bins that each become one map task.

use serde::{Deserialize, Serialize};

use crate::fs::FileInfo;

/// A byte range of a single input file, inclusive on both ends. Splits fully
/// cover their file with no gaps or overlaps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSplit {
    pub filename: String,

    #[serde(rename = "startOffset")]
    pub start_offset: u64,

    #[serde(rename = "endOffset")]
    pub end_offset: u64,
}

impl InputSplit {
    pub fn size(&self) -> u64 {
        self.end_offset - self.start_offset + 1
    }
}

/// Carves a file into splits of at most `max_split_size` bytes, the last one
/// absorbing the remainder. An empty file yields no splits.
pub(crate) fn split_input_file(file: &FileInfo, max_split_size: u64) -> Vec<InputSplit> {
    let mut splits = Vec::new();

    let mut start_offset = 0;
    while start_offset < file.size {
        let end_offset = (start_offset + max_split_size - 1).min(file.size - 1);
        splits.push(InputSplit {
            filename: file.name.clone(),
            start_offset,
            end_offset,
        });
        start_offset += max_split_size;
    }

    splits
}

/// Packs splits into bins with a naive next-fit pass over the insertion
/// order. The combined size of each bin stays within `max_bin_size`, except
/// that a split already larger than the cap occupies a bin alone.
pub(crate) fn pack_input_splits(splits: Vec<InputSplit>, max_bin_size: u64) -> Vec<Vec<InputSplit>> {
    if splits.is_empty() {
        return Vec::new();
    }

    let mut bins: Vec<Vec<InputSplit>> = vec![Vec::new()];
    let mut current_size = 0;

    for split in splits {
        if current_size + split.size() <= max_bin_size {
            current_size += split.size();
            bins.last_mut().unwrap().push(split);
        } else {
            current_size = split.size();
            bins.push(vec![split]);
        }
    }

    bins
}

/// Number of intermediate bins for a job, derived once from the total input
/// size. Over-provisioned by 1.25x to bound the memory a single reduce task
/// buffers while grouping.
pub(crate) fn intermediate_bins(total_input_bytes: u64, reduce_bin_size: u64) -> u64 {
    let bins = ((total_input_bytes as f64 / reduce_bin_size as f64) * 1.25).ceil() as u64;
    bins.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_of_size(size: u64) -> InputSplit {
        InputSplit {
            filename: "input".to_string(),
            start_offset: 0,
            end_offset: size - 1,
        }
    }

    #[test]
    fn split_size_is_inclusive() {
        let cases = [(0, 9, 10), (100, 999, 900), (1000, 1000, 1)];
        for (start_offset, end_offset, expected) in cases {
            let split = InputSplit {
                filename: "input".to_string(),
                start_offset,
                end_offset,
            };
            assert_eq!(split.size(), expected);
        }
    }

    #[test]
    fn splits_cover_the_file() {
        let cases: [(u64, u64, Vec<(u64, u64)>); 3] = [
            (3, 3, vec![(0, 2)]),
            (10, 3, vec![(0, 2), (3, 5), (6, 8), (9, 9)]),
            (5, 10, vec![(0, 4)]),
        ];

        for (file_size, max_split_size, expected) in cases {
            let file = FileInfo {
                name: "input".to_string(),
                size: file_size,
            };
            let splits = split_input_file(&file, max_split_size);

            assert_eq!(splits.len(), expected.len(), "{splits:?}");
            for (split, (start, end)) in splits.iter().zip(expected) {
                assert_eq!(split.start_offset, start);
                assert_eq!(split.end_offset, end);
            }
        }
    }

    #[test]
    fn empty_file_yields_no_splits() {
        let file = FileInfo {
            name: "input".to_string(),
            size: 0,
        };
        assert!(split_input_file(&file, 100).is_empty());
    }

    #[test]
    fn next_fit_packs_every_split_once() {
        let cases: [(Vec<u64>, u64); 3] = [
            (vec![], 0),
            (vec![1, 2, 3], 3),
            (vec![3, 3, 1, 2, 3], 3),
        ];

        for (sizes, max_bin_size) in cases {
            let splits: Vec<_> = sizes.iter().copied().map(split_of_size).collect();
            let bins = pack_input_splits(splits, max_bin_size);

            let mut splits_seen = 0;
            for bin in &bins {
                let bin_size: u64 = bin.iter().map(InputSplit::size).sum();
                splits_seen += bin.len();
                assert!(bin_size <= max_bin_size);
            }
            assert_eq!(splits_seen, sizes.len());
        }
    }

    #[test]
    fn next_fit_never_reopens_earlier_bins() {
        // Next-fit only ever considers the current bin: the first 1-sized
        // split opens a new bin rather than backfilling an earlier one, and
        // the following 2-sized split joins it.
        let splits: Vec<_> = [3, 3, 1, 2, 3].into_iter().map(split_of_size).collect();
        let bins = pack_input_splits(splits, 3);

        let bin_sizes: Vec<u64> = bins
            .iter()
            .map(|bin| bin.iter().map(InputSplit::size).sum())
            .collect();
        assert_eq!(bin_sizes, vec![3, 3, 3, 3]);
    }

    #[test]
    fn oversized_split_gets_its_own_bin() {
        let splits: Vec<_> = [2, 10, 2].into_iter().map(split_of_size).collect();
        let bins = pack_input_splits(splits, 3);

        assert_eq!(bins.len(), 3);
        assert_eq!(bins[1].len(), 1);
        assert_eq!(bins[1][0].size(), 10);
    }

    #[test]
    fn empty_input_yields_no_bins() {
        assert!(pack_input_splits(Vec::new(), 100).is_empty());
    }

    #[test]
    fn bin_count_is_overprovisioned_and_at_least_one() {
        assert_eq!(intermediate_bins(0, 512), 1);
        assert_eq!(intermediate_bins(512, 512), 2);
        assert_eq!(intermediate_bins(100, 1000), 1);
        assert_eq!(intermediate_bins(4000, 1000), 5);
    }
}
