use crate::config::MergerConfig;
use crate::core::cluster::{cluster_count, ClusterAssignment, SimilarityClusterer, NOISE};
use crate::core::duplicate::{DeduplicationEngine, Deduplicated, ProvenanceEntry};
use crate::core::record::ImageRecord;
use crate::core::split::{find_cluster_leaks, DatasetSplitter, Split, SplitAssignment};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitCount {
    pub count: usize,
    pub percentage: f64,
}

/// Headline numbers for one run, ready for a reporting collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub generated_at: String,
    pub input_records: usize,
    pub unique_records: usize,
    pub exact_duplicates_removed: usize,
    pub near_duplicates_removed: usize,
    pub clusters: usize,
    pub noise_points: usize,
    pub unclustered_records: usize,
    pub cluster_leaks: usize,
    pub splits: BTreeMap<Split, SplitCount>,
    pub classes: BTreeMap<String, usize>,
    pub datasets: BTreeMap<String, usize>,
    pub average_quality: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub summary: RunSummary,
    pub provenance: Vec<ProvenanceEntry>,
    pub clusters: ClusterAssignment,
    pub splits: SplitAssignment,
}

impl PipelineReport {
    /// The deduplicated record set, in split order.
    pub fn unique_records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.splits.iter().flat_map(|(_, records)| records.iter())
    }
}

/// Runs dedup, clustering and splitting back to back. Each stage sees the
/// fully materialised output of the previous one; nothing is kept between
/// runs apart from the configuration.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub config: MergerConfig,
}

impl Pipeline {
    pub fn new(config: MergerConfig) -> Self {
        Self { config }
    }

    pub fn deduplicator(&self) -> DeduplicationEngine {
        DeduplicationEngine::new(self.config.perceptual_threshold)
            .with_unknown_policy(self.config.unknown_hash_policy)
    }

    pub fn clusterer(&self) -> SimilarityClusterer {
        SimilarityClusterer::new(self.config.cluster_eps, self.config.cluster_min_samples)
    }

    pub fn splitter(&self) -> DatasetSplitter {
        DatasetSplitter::new(self.config.ratios)
    }

    pub fn run(&self, records: Vec<ImageRecord>) -> PipelineReport {
        let input_records = records.len();
        log::info!("Starting merge of {} record(s)", input_records);

        let deduplicated = self.deduplicator().find_duplicates(records);
        let clusters = self.clusterer().cluster(&deduplicated.unique);

        let summary_base = SummaryBase::collect(&deduplicated, &clusters);
        let Deduplicated { unique, provenance } = deduplicated;
        let splits = self.splitter().create_splits(unique, &clusters);

        let leaks = find_cluster_leaks(&splits, &clusters);
        for leak in &leaks {
            log::warn!(
                "Cluster {} spans splits {:?}",
                leak.cluster_id,
                leak.splits.iter().map(Split::as_str).collect::<Vec<_>>()
            );
        }

        let summary = summary_base.finish(input_records, &splits, leaks.len());
        PipelineReport {
            summary,
            provenance,
            clusters,
            splits,
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(MergerConfig::default())
    }
}

struct SummaryBase {
    unique_records: usize,
    exact_duplicates_removed: usize,
    near_duplicates_removed: usize,
    clusters: usize,
    noise_points: usize,
    unclustered_records: usize,
    classes: BTreeMap<String, usize>,
    datasets: BTreeMap<String, usize>,
    average_quality: f64,
}

impl SummaryBase {
    fn collect(deduplicated: &Deduplicated, clusters: &ClusterAssignment) -> Self {
        let unique = &deduplicated.unique;
        let mut classes = BTreeMap::new();
        let mut datasets = BTreeMap::new();
        for record in unique {
            *classes.entry(record.canonical_class.clone()).or_insert(0) += 1;
            *datasets.entry(record.dataset_source.clone()).or_insert(0) += 1;
        }

        let average_quality = if unique.is_empty() {
            0.0
        } else {
            unique.iter().map(|r| r.quality_score).sum::<f64>() / unique.len() as f64
        };

        Self {
            unique_records: unique.len(),
            exact_duplicates_removed: deduplicated.exact_duplicates_removed(),
            near_duplicates_removed: deduplicated.near_duplicates_removed(),
            clusters: cluster_count(clusters),
            noise_points: clusters.values().filter(|&&l| l == NOISE).count(),
            unclustered_records: unique.len() - clusters.len().min(unique.len()),
            classes,
            datasets,
            average_quality,
        }
    }

    fn finish(self, input_records: usize, splits: &SplitAssignment, leaks: usize) -> RunSummary {
        let total = splits.len();
        let splits = splits
            .counts()
            .into_iter()
            .map(|(split, count)| {
                let percentage = if total > 0 {
                    count as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                (split, SplitCount { count, percentage })
            })
            .collect();

        RunSummary {
            generated_at: Utc::now().to_rfc3339(),
            input_records,
            unique_records: self.unique_records,
            exact_duplicates_removed: self.exact_duplicates_removed,
            near_duplicates_removed: self.near_duplicates_removed,
            clusters: self.clusters,
            noise_points: self.noise_points,
            unclustered_records: self.unclustered_records,
            cluster_leaks: leaks,
            splits,
            classes: self.classes,
            datasets: self.datasets,
            average_quality: self.average_quality,
        }
    }
}
