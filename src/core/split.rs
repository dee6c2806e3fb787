//! Stratified, cluster-aware partitioning into train/val/test/holdout.
//!
//! Splitting runs in two phases. A holdout set is carved out first, walking
//! `(dataset, class)` groups from smallest to largest so rare combinations
//! are represented. The rest is then split per class, moving whole
//! similarity clusters so that look-alike images never straddle two splits.

use crate::core::cluster::{ClusterAssignment, NOISE};
use crate::core::record::ImageRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

/// Share of each `(dataset, class)` group moved into the holdout pool,
/// expressed as a divisor (`ceil(size / 10)`).
const HOLDOUT_GROUP_DIVISOR: usize = 10;

/// Classes smaller than this go entirely to train.
pub const MIN_STRATIFIED_CLASS_SIZE: usize = 3;

/// Absorbs float noise such as `0.29 * 100 = 28.999999999999996`.
const FLOOR_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
    Holdout,
}

impl Split {
    pub const ALL: [Split; 4] = [Split::Train, Split::Val, Split::Test, Split::Holdout];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
            Split::Holdout => "holdout",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target fractions for each split. They do not need to sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
    pub holdout: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.15,
            test: 0.15,
            holdout: 0.1,
        }
    }
}

impl SplitRatios {
    /// Train/val/test rescaled to sum to one, or `None` when their sum is
    /// zero, negative or not finite.
    pub fn normalized(&self) -> Option<(f64, f64, f64)> {
        let total = self.train + self.val + self.test;
        if !total.is_finite() || total <= 0.0 {
            return None;
        }
        Some((self.train / total, self.val / total, self.test / total))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub train: Vec<ImageRecord>,
    pub val: Vec<ImageRecord>,
    pub test: Vec<ImageRecord>,
    pub holdout: Vec<ImageRecord>,
}

impl SplitAssignment {
    pub fn get(&self, split: Split) -> &[ImageRecord] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
            Split::Holdout => &self.holdout,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Split, &[ImageRecord])> {
        Split::ALL.into_iter().map(move |s| (s, self.get(s)))
    }

    pub fn len(&self) -> usize {
        self.iter().map(|(_, records)| records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> BTreeMap<Split, usize> {
        self.iter().map(|(s, records)| (s, records.len())).collect()
    }

    /// Split holding `path`, if any.
    pub fn split_of(&self, path: &str) -> Option<Split> {
        self.iter()
            .find(|(_, records)| records.iter().any(|r| r.path == path))
            .map(|(s, _)| s)
    }

    /// Paths that appear in more than one split.
    pub fn overlapping_paths(&self) -> Vec<String> {
        let mut seen: HashMap<&str, Split> = HashMap::new();
        let mut overlapping = BTreeSet::new();
        for (split, records) in self.iter() {
            for record in records {
                if let Some(&first) = seen.get(record.path.as_str()) {
                    if first != split {
                        overlapping.insert(record.path.clone());
                    }
                } else {
                    seen.insert(&record.path, split);
                }
            }
        }
        overlapping.into_iter().collect()
    }
}

/// A similarity cluster whose members ended up in more than one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLeak {
    pub cluster_id: i32,
    pub splits: Vec<Split>,
}

/// Report every non-noise cluster spread over several splits. The holdout
/// carve-out and per-class stratification do not look across groups, so a
/// cluster mixing datasets or classes can leak.
pub fn find_cluster_leaks(
    assignment: &SplitAssignment,
    clusters: &ClusterAssignment,
) -> Vec<ClusterLeak> {
    let mut spread: BTreeMap<i32, BTreeSet<Split>> = BTreeMap::new();
    for (split, records) in assignment.iter() {
        for record in records {
            match clusters.get(&record.path) {
                Some(&id) if id != NOISE => {
                    spread.entry(id).or_default().insert(split);
                }
                _ => {}
            }
        }
    }

    spread
        .into_iter()
        .filter(|(_, splits)| splits.len() > 1)
        .map(|(cluster_id, splits)| ClusterLeak {
            cluster_id,
            splits: splits.into_iter().collect(),
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct DatasetSplitter {
    pub ratios: SplitRatios,
}

impl DatasetSplitter {
    pub fn new(ratios: SplitRatios) -> Self {
        Self { ratios }
    }

    pub fn create_splits(
        &self,
        records: Vec<ImageRecord>,
        clusters: &ClusterAssignment,
    ) -> SplitAssignment {
        let (holdout, remaining) = self.carve_holdout(records);
        let (train, val, test) = self.split_remaining(remaining, clusters);

        let assignment = SplitAssignment {
            train,
            val,
            test,
            holdout,
        };
        log::info!(
            "Train: {}, Val: {}, Test: {}, Holdout: {}",
            assignment.train.len(),
            assignment.val.len(),
            assignment.test.len(),
            assignment.holdout.len()
        );
        assignment
    }

    fn carve_holdout(&self, records: Vec<ImageRecord>) -> (Vec<ImageRecord>, Vec<ImageRecord>) {
        let total = records.len();
        let target = floor_count(total, self.ratios.holdout);

        let mut groups = group_in_order(records, |r| {
            (r.dataset_source.clone(), r.canonical_class.clone())
        });
        // Stable: equal-sized groups keep first-occurrence order.
        groups.sort_by_key(|(_, members)| members.len());

        let mut holdout = Vec::new();
        let mut remaining = Vec::with_capacity(total);
        for ((dataset, class), mut members) in groups {
            if (holdout.len() as i64) < target {
                let take = members.len().div_ceil(HOLDOUT_GROUP_DIVISOR).max(1);
                log::debug!("Holdout takes {} from {}/{}", take, dataset, class);
                let rest = members.split_off(take.min(members.len()));
                holdout.extend(members);
                remaining.extend(rest);
            } else {
                remaining.extend(members);
            }
        }
        (holdout, remaining)
    }

    fn split_remaining(
        &self,
        records: Vec<ImageRecord>,
        clusters: &ClusterAssignment,
    ) -> (Vec<ImageRecord>, Vec<ImageRecord>, Vec<ImageRecord>) {
        let mut train = Vec::new();
        let mut val = Vec::new();
        let mut test = Vec::new();

        let Some((adj_train, adj_val, _)) = self.ratios.normalized() else {
            log::warn!(
                "Train/val/test ratios sum to zero; assigning {} record(s) to train",
                records.len()
            );
            train = records;
            return (train, val, test);
        };

        for (class, members) in group_in_order(records, |r| r.canonical_class.clone()) {
            if members.len() < MIN_STRATIFIED_CLASS_SIZE {
                log::debug!("Class {} too small to stratify ({})", class, members.len());
                train.extend(members);
                continue;
            }

            let n_train = floor_count(members.len(), adj_train);
            let n_val = floor_count(members.len(), adj_val);

            // Noise records share one unit per class; records with no
            // cluster entry each stand alone.
            let indexed: Vec<(usize, ImageRecord)> = members.into_iter().enumerate().collect();
            let units = group_in_order(indexed, |(i, r)| match clusters.get(&r.path) {
                Some(&id) => ClusterKey::Cluster(id),
                None => ClusterKey::Single(*i),
            });

            let (mut class_train, mut class_val, mut class_test) = (0i64, 0i64, 0i64);
            for (_, unit) in units {
                let size = unit.len() as i64;
                let records = unit.into_iter().map(|(_, r)| r);
                if class_train < n_train {
                    class_train += size;
                    train.extend(records);
                } else if class_val < n_val {
                    class_val += size;
                    val.extend(records);
                } else {
                    class_test += size;
                    test.extend(records);
                }
            }
            log::debug!(
                "Class {}: {} train, {} val, {} test",
                class,
                class_train,
                class_val,
                class_test
            );
        }

        (train, val, test)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ClusterKey {
    Cluster(i32),
    Single(usize),
}

/// `floor(size * ratio)`, never negative. Non-finite ratios count as zero.
fn floor_count(size: usize, ratio: f64) -> i64 {
    let value = size as f64 * ratio;
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value + FLOOR_TOLERANCE).floor() as i64
}

/// Group items by key, keeping groups in order of first occurrence and
/// members in input order.
fn group_in_order<T, K, F>(items: Vec<T>, key: F) -> Vec<(K, Vec<T>)>
where
    K: Eq + Hash + Clone,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for item in items {
        let k = key(&item);
        match index.get(&k) {
            Some(&g) => groups[g].1.push(item),
            None => {
                index.insert(k.clone(), groups.len());
                groups.push((k, vec![item]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::PerceptualHash;
    use crate::core::record::ContentHash;

    fn record(path: &str, class: &str, dataset: &str) -> ImageRecord {
        ImageRecord::new(
            path,
            class,
            dataset,
            ContentHash::from(path),
            PerceptualHash::Unknown,
            50.0,
        )
    }

    fn class_records(class: &str, dataset: &str, n: usize) -> Vec<ImageRecord> {
        (0..n)
            .map(|i| record(&format!("{}/{}/{}", dataset, class, i), class, dataset))
            .collect()
    }

    fn ratios(train: f64, val: f64, test: f64, holdout: f64) -> SplitRatios {
        SplitRatios {
            train,
            val,
            test,
            holdout,
        }
    }

    fn assert_partition(input: &[ImageRecord], output: &SplitAssignment) {
        assert_eq!(output.len(), input.len());
        assert!(output.overlapping_paths().is_empty());
        let mut expected: Vec<&str> = input.iter().map(|r| r.path.as_str()).collect();
        let mut actual: Vec<&str> = output
            .iter()
            .flat_map(|(_, records)| records.iter().map(|r| r.path.as_str()))
            .collect();
        expected.sort();
        actual.sort();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_empty_input_yields_empty_splits() {
        let splits =
            DatasetSplitter::default().create_splits(Vec::new(), &ClusterAssignment::new());
        assert!(splits.is_empty());
        for (_, records) in splits.iter() {
            assert!(records.is_empty());
        }
    }

    #[test]
    fn test_singleton_clusters_follow_ratio_exactly() {
        let records = class_records("rust", "ds1", 100);
        let splitter = DatasetSplitter::new(ratios(0.7, 0.15, 0.15, 0.0));
        let splits = splitter.create_splits(records.clone(), &ClusterAssignment::new());

        assert_eq!(splits.train.len(), 70);
        assert_eq!(splits.val.len(), 15);
        assert_eq!(splits.test.len(), 15);
        assert!(splits.holdout.is_empty());
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_unnormalized_ratios_are_rescaled() {
        let records = class_records("rust", "ds1", 20);
        let splitter = DatasetSplitter::new(ratios(2.0, 1.0, 1.0, 0.0));
        let splits = splitter.create_splits(records, &ClusterAssignment::new());
        assert_eq!(splits.train.len(), 10);
        assert_eq!(splits.val.len(), 5);
        assert_eq!(splits.test.len(), 5);
    }

    #[test]
    fn test_small_classes_go_to_train() {
        let mut records = class_records("rare", "ds1", 2);
        records.extend(class_records("common", "ds1", 10));
        let splitter = DatasetSplitter::new(ratios(0.5, 0.25, 0.25, 0.0));
        let splits = splitter.create_splits(records.clone(), &ClusterAssignment::new());

        for r in records.iter().filter(|r| r.canonical_class == "rare") {
            assert_eq!(splits.split_of(&r.path), Some(Split::Train));
        }
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_clusters_move_as_a_unit() {
        let records = class_records("blight", "ds1", 10);
        let mut clusters = ClusterAssignment::new();
        // Six images of one physical leaf, three noise points, one unhashed.
        for r in &records[..6] {
            clusters.insert(r.path.clone(), 0);
        }
        for r in &records[6..9] {
            clusters.insert(r.path.clone(), NOISE);
        }

        let splitter = DatasetSplitter::new(ratios(0.5, 0.2, 0.3, 0.0));
        let splits = splitter.create_splits(records.clone(), &clusters);

        // The whole cluster lands in train, overshooting the 5-record target,
        // and the three noise points travel together into val.
        assert_eq!(splits.train.len(), 6);
        assert_eq!(splits.val.len(), 3);
        assert_eq!(splits.test.len(), 1);
        assert_eq!(splits.split_of(&records[9].path), Some(Split::Test));
        assert!(find_cluster_leaks(&splits, &clusters).is_empty());
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_noise_of_a_class_moves_together() {
        let records = class_records("scab", "ds1", 10);
        let clusters: ClusterAssignment =
            records.iter().map(|r| (r.path.clone(), NOISE)).collect();

        let splitter = DatasetSplitter::new(ratios(0.7, 0.15, 0.15, 0.0));
        let splits = splitter.create_splits(records.clone(), &clusters);

        assert_eq!(splits.train.len(), 10);
        assert!(splits.val.is_empty());
        assert!(splits.test.is_empty());
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_cluster_members_never_straddle_splits() {
        let mut records = Vec::new();
        let mut clusters = ClusterAssignment::new();
        for class in ["healthy", "rust", "scab"] {
            let batch = class_records(class, "ds1", 37);
            for (i, r) in batch.iter().enumerate() {
                let id = match class {
                    "healthy" => 0,
                    "rust" => 100,
                    _ => 200,
                } + (i / 4) as i32;
                clusters.insert(r.path.clone(), id);
            }
            records.extend(batch);
        }

        let splitter = DatasetSplitter::new(ratios(0.7, 0.15, 0.15, 0.0));
        let splits = splitter.create_splits(records.clone(), &clusters);

        assert!(find_cluster_leaks(&splits, &clusters).is_empty());
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_holdout_prefers_rare_groups() {
        let mut records = class_records("healthy", "big", 80);
        records.extend(class_records("rust", "field", 5));
        records.extend(class_records("scab", "lab", 15));
        let splitter = DatasetSplitter::new(ratios(0.7, 0.15, 0.15, 0.1));
        let splits = splitter.create_splits(records.clone(), &ClusterAssignment::new());

        // Target 10: 1 from the 5-group, 2 from the 15-group, 8 from the 80-group.
        assert_eq!(splits.holdout.len(), 11);
        assert_eq!(splits.holdout[0].canonical_class, "rust");
        assert_eq!(splits.holdout[1].canonical_class, "scab");
        assert_eq!(splits.holdout[2].canonical_class, "scab");
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_holdout_size_tracks_ratio() {
        let mut records = Vec::new();
        for i in 0..15 {
            let size = 3 + i % 8;
            records.extend(class_records(&format!("class{}", i), "ds", size));
            records.extend(class_records(&format!("class{}", i), "other", size));
        }
        let total = records.len();
        let holdout_ratio = 0.1;
        let splitter = DatasetSplitter::new(ratios(0.7, 0.15, 0.15, holdout_ratio));
        let splits = splitter.create_splits(records.clone(), &ClusterAssignment::new());

        let expected = (holdout_ratio * total as f64).round() as i64;
        assert!((splits.holdout.len() as i64 - expected).abs() <= 1);
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_zero_ratio_sum_sends_everything_to_train() {
        let records = class_records("rust", "ds1", 12);
        let splitter = DatasetSplitter::new(ratios(0.0, 0.0, 0.0, 0.0));
        let splits = splitter.create_splits(records.clone(), &ClusterAssignment::new());
        assert_eq!(splits.train.len(), 12);
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_negative_ratios_do_not_panic() {
        let records = class_records("rust", "ds1", 12);
        let splitter = DatasetSplitter::new(ratios(-1.0, 2.0, 1.0, -0.5));
        let splits = splitter.create_splits(records.clone(), &ClusterAssignment::new());
        assert!(splits.holdout.is_empty());
        assert_partition(&records, &splits);
    }

    #[test]
    fn test_leak_audit_reports_spread_clusters() {
        let records = class_records("rust", "ds1", 3);
        let assignment = SplitAssignment {
            train: vec![records[0].clone()],
            test: vec![records[1].clone(), records[2].clone()],
            ..Default::default()
        };
        let mut clusters = ClusterAssignment::new();
        clusters.insert(records[0].path.clone(), 4);
        clusters.insert(records[1].path.clone(), 4);
        clusters.insert(records[2].path.clone(), NOISE);

        let leaks = find_cluster_leaks(&assignment, &clusters);
        assert_eq!(
            leaks,
            vec![ClusterLeak {
                cluster_id: 4,
                splits: vec![Split::Train, Split::Test],
            }]
        );
    }

    #[test]
    fn test_floor_count_tolerates_float_noise() {
        assert_eq!(floor_count(100, 0.7), 70);
        // 100 * 0.29 is 28.999999999999996 in f64.
        assert_eq!(floor_count(100, 0.29), 29);
        assert_eq!(floor_count(10, 0.1), 1);
        assert_eq!(floor_count(10, -0.3), 0);
        assert_eq!(floor_count(10, f64::NAN), 0);
    }
}
