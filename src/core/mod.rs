pub mod cluster;
pub mod duplicate;
pub mod hash;
pub mod pipeline;
pub mod record;
pub mod split;

pub use cluster::{ClusterAssignment, SimilarityClusterer, NOISE};
pub use duplicate::{
    Deduplicated, DeduplicationEngine, ProvenanceEntry, ProvenanceReason, UnknownHashPolicy,
};
pub use hash::PerceptualHash;
pub use pipeline::{Pipeline, PipelineReport, RunSummary};
pub use record::{AnalysisCache, AnalysisOutcome, ContentHash, ImageAnalysis, ImageRecord};
pub use split::{find_cluster_leaks, DatasetSplitter, Split, SplitAssignment, SplitRatios};
