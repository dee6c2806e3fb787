// Duplicate detection across source collections:
// - exact duplicates share a content hash
// - near duplicates have perceptual hashes within a hamming threshold
// Each group keeps its highest quality member and every input record gets
// one provenance entry explaining the decision.

use crate::core::hash::{PerceptualHash, MISMATCHED_WIDTH_DISTANCE};
use crate::core::record::{ContentHash, ImageRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_PERCEPTUAL_THRESHOLD: u32 = 5;

/// How records whose hashes could not be computed take part in grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownHashPolicy {
    /// Failed hashes compare equal to each other, so all of them collapse
    /// into a single survivor.
    #[default]
    Collapse,
    /// Failed hashes never match anything; those records are always kept.
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvenanceReason {
    Unique,
    BestQuality,
    DuplicateOf(String),
    NearDuplicateOf(String),
    HashUnavailable,
}

impl fmt::Display for ProvenanceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvenanceReason::Unique => write!(f, "unique"),
            ProvenanceReason::BestQuality => write!(f, "best_quality"),
            ProvenanceReason::DuplicateOf(id) => write!(f, "duplicate_of_{}", id),
            ProvenanceReason::NearDuplicateOf(id) => write!(f, "near_duplicate_of_{}", id),
            ProvenanceReason::HashUnavailable => write!(f, "hash_unavailable"),
        }
    }
}

impl From<String> for ProvenanceReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "unique" => ProvenanceReason::Unique,
            "best_quality" => ProvenanceReason::BestQuality,
            "hash_unavailable" => ProvenanceReason::HashUnavailable,
            s if s.starts_with("near_duplicate_of_") => ProvenanceReason::NearDuplicateOf(
                s.strip_prefix("near_duplicate_of_").unwrap_or("").to_string(),
            ),
            s if s.starts_with("duplicate_of_") => ProvenanceReason::DuplicateOf(
                s.strip_prefix("duplicate_of_").unwrap_or("").to_string(),
            ),
            _ => ProvenanceReason::Unique,
        }
    }
}

impl From<ProvenanceReason> for String {
    fn from(reason: ProvenanceReason) -> Self {
        reason.to_string()
    }
}

/// Audit record for one input image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub source_record_id: String,
    pub dataset_source: String,
    pub content_hash: ContentHash,
    pub perceptual_hash: PerceptualHash,
    pub kept: bool,
    pub reason: ProvenanceReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deduplicated {
    pub unique: Vec<ImageRecord>,
    pub provenance: Vec<ProvenanceEntry>,
}

impl Deduplicated {
    pub fn exact_duplicates_removed(&self) -> usize {
        self.provenance
            .iter()
            .filter(|p| matches!(p.reason, ProvenanceReason::DuplicateOf(_)))
            .count()
    }

    pub fn near_duplicates_removed(&self) -> usize {
        self.provenance
            .iter()
            .filter(|p| matches!(p.reason, ProvenanceReason::NearDuplicateOf(_)))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct DeduplicationEngine {
    pub perceptual_threshold: u32,
    pub unknown_policy: UnknownHashPolicy,
}

impl DeduplicationEngine {
    pub fn new(perceptual_threshold: u32) -> Self {
        Self {
            perceptual_threshold,
            unknown_policy: UnknownHashPolicy::default(),
        }
    }

    pub fn with_unknown_policy(mut self, policy: UnknownHashPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    /// Collapse exact and near duplicates, keeping the best record of each
    /// group. Returns the survivors in visit order together with one
    /// provenance entry per input record, in input order.
    ///
    /// The near-duplicate pass compares every survivor against every other
    /// unvisited survivor, so it is quadratic in the survivor count.
    pub fn find_duplicates(&self, records: Vec<ImageRecord>) -> Deduplicated {
        let mut decisions: Vec<Option<(bool, ProvenanceReason)>> = vec![None; records.len()];

        let survivors = self.resolve_exact(&records, &mut decisions);
        let unique_indices = self.resolve_perceptual(&records, &survivors, &mut decisions);

        let provenance: Vec<ProvenanceEntry> = records
            .iter()
            .zip(decisions)
            .map(|(record, decision)| {
                let (kept, reason) = decision.unwrap_or((true, ProvenanceReason::Unique));
                ProvenanceEntry {
                    source_record_id: record.path.clone(),
                    dataset_source: record.dataset_source.clone(),
                    content_hash: record.content_hash.clone(),
                    perceptual_hash: record.perceptual_hash.clone(),
                    kept,
                    reason,
                }
            })
            .collect();

        let mut slots: Vec<Option<ImageRecord>> = records.into_iter().map(Some).collect();
        let unique: Vec<ImageRecord> = unique_indices
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        let result = Deduplicated { unique, provenance };
        log::info!(
            "Deduplication kept {} of {} records ({} exact, {} near duplicates removed)",
            result.unique.len(),
            result.provenance.len(),
            result.exact_duplicates_removed(),
            result.near_duplicates_removed()
        );
        result
    }

    /// Group by content hash in first-occurrence order and keep the best of
    /// each group. Returns survivor indices and whether each takes part in
    /// the perceptual pass.
    fn resolve_exact(
        &self,
        records: &[ImageRecord],
        decisions: &mut [Option<(bool, ProvenanceReason)>],
    ) -> Vec<(usize, bool)> {
        enum Slot {
            Group(usize),
            Excluded(usize),
        }

        let mut slots: Vec<Slot> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_index: HashMap<&ContentHash, usize> = HashMap::new();
        let mut unknown_count = 0usize;

        for (i, record) in records.iter().enumerate() {
            if !record.content_hash.is_known() {
                unknown_count += 1;
                if self.unknown_policy == UnknownHashPolicy::Exclude {
                    slots.push(Slot::Excluded(i));
                    continue;
                }
            }
            match group_index.get(&record.content_hash) {
                Some(&g) => groups[g].push(i),
                None => {
                    group_index.insert(&record.content_hash, groups.len());
                    slots.push(Slot::Group(groups.len()));
                    groups.push(vec![i]);
                }
            }
        }

        if unknown_count > 0 {
            log::warn!(
                "{} record(s) have no content hash ({:?} policy)",
                unknown_count,
                self.unknown_policy
            );
        }

        let mut survivors = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Excluded(i) => {
                    decisions[i] = Some((true, ProvenanceReason::HashUnavailable));
                    survivors.push((i, false));
                }
                Slot::Group(g) => {
                    let members = &groups[g];
                    if members.len() == 1 {
                        decisions[members[0]] = Some((true, ProvenanceReason::Unique));
                        survivors.push((members[0], true));
                        continue;
                    }

                    let best = best_quality(records, members);
                    log::debug!(
                        "Exact group {} keeps {} over {} duplicate(s)",
                        records[best].content_hash,
                        records[best].path,
                        members.len() - 1
                    );
                    for &m in members {
                        decisions[m] = if m == best {
                            Some((true, ProvenanceReason::BestQuality))
                        } else {
                            Some((
                                false,
                                ProvenanceReason::DuplicateOf(records[best].path.clone()),
                            ))
                        };
                    }
                    survivors.push((best, true));
                }
            }
        }
        survivors
    }

    /// Visit survivors in order; each unvisited one collects every other
    /// unvisited survivor within the threshold of itself. Membership is not
    /// closed transitively: a record near a member but not near the visiting
    /// record starts its own group later.
    fn resolve_perceptual(
        &self,
        records: &[ImageRecord],
        survivors: &[(usize, bool)],
        decisions: &mut [Option<(bool, ProvenanceReason)>],
    ) -> Vec<usize> {
        let mut processed = vec![false; survivors.len()];
        let mut unique = Vec::with_capacity(survivors.len());

        for (s, &(i, eligible)) in survivors.iter().enumerate() {
            if processed[s] {
                continue;
            }
            if !eligible {
                processed[s] = true;
                unique.push(i);
                continue;
            }

            let mut similar = vec![s];
            for (t, &(j, other_eligible)) in survivors.iter().enumerate() {
                if t == s || processed[t] || !other_eligible {
                    continue;
                }
                if self.is_near(&records[i].perceptual_hash, &records[j].perceptual_hash) {
                    similar.push(t);
                }
            }

            if similar.len() == 1 {
                processed[s] = true;
                unique.push(i);
                continue;
            }

            let members: Vec<usize> = similar.iter().map(|&t| survivors[t].0).collect();
            let best = best_quality(records, &members);
            log::debug!(
                "Near-duplicate group led by {} keeps {} ({} member(s))",
                records[i].path,
                records[best].path,
                members.len()
            );
            for &t in &similar {
                processed[t] = true;
            }
            for &m in &members {
                if m != best {
                    decisions[m] = Some((
                        false,
                        ProvenanceReason::NearDuplicateOf(records[best].path.clone()),
                    ));
                }
            }
            unique.push(best);
        }
        unique
    }

    fn is_near(&self, a: &PerceptualHash, b: &PerceptualHash) -> bool {
        if !a.is_known() && !b.is_known() {
            return self.unknown_policy == UnknownHashPolicy::Collapse;
        }
        let distance = a.hamming_distance(b);
        distance != MISMATCHED_WIDTH_DISTANCE && distance <= self.perceptual_threshold
    }
}

impl Default for DeduplicationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PERCEPTUAL_THRESHOLD)
    }
}

/// Highest quality member; the earliest one wins ties.
fn best_quality(records: &[ImageRecord], members: &[usize]) -> usize {
    let mut best = members[0];
    for &m in &members[1..] {
        if records[m].quality_score > records[best].quality_score {
            best = m;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, content: &str, phash: u64, quality: f64) -> ImageRecord {
        ImageRecord::new(
            path,
            "healthy",
            "ds1",
            ContentHash::from(content),
            PerceptualHash::from_u64(phash, 64),
            quality,
        )
    }

    fn kept_paths(result: &Deduplicated) -> Vec<&str> {
        result.unique.iter().map(|r| r.path.as_str()).collect()
    }

    #[test]
    fn test_exact_duplicates_keep_best_quality() {
        // Eight distinct images, two of which were harvested twice.
        let mut records = Vec::new();
        for k in 0..8u64 {
            records.push(record(
                &format!("img_{}", k),
                &format!("c{}", k),
                0xffu64 << (8 * k),
                50.0,
            ));
        }
        records[0].quality_score = 80.0;
        records[1].quality_score = 50.0;
        records.push(record("img_0_copy", "c0", 0xff, 60.0));
        records.push(record("img_1_copy", "c1", 0xff << 8, 90.0));

        let result = DeduplicationEngine::default().find_duplicates(records);

        assert_eq!(result.unique.len(), 8);
        assert_eq!(result.provenance.len(), 10);

        let dropped: Vec<&str> = result
            .provenance
            .iter()
            .filter(|p| !p.kept)
            .map(|p| p.source_record_id.as_str())
            .collect();
        assert_eq!(dropped, vec!["img_1", "img_0_copy"]);

        assert_eq!(
            result.provenance[8].reason,
            ProvenanceReason::DuplicateOf("img_0".to_string())
        );
        assert_eq!(result.provenance[9].reason, ProvenanceReason::BestQuality);
        assert_eq!(result.provenance[2].reason, ProvenanceReason::Unique);
        assert_eq!(result.exact_duplicates_removed(), 2);
    }

    #[test]
    fn test_quality_ties_keep_first_seen() {
        let records = vec![
            record("first", "same", 1, 70.0),
            record("second", "same", 1, 70.0),
        ];
        let result = DeduplicationEngine::default().find_duplicates(records);
        assert_eq!(kept_paths(&result), vec!["first"]);
    }

    #[test]
    fn test_near_duplicates_merge_within_threshold() {
        let records = vec![
            ImageRecord::new("a", "x", "ds", "ca".into(), "0000".into(), 10.0),
            ImageRecord::new("b", "x", "ds", "cb".into(), "0003".into(), 20.0),
            ImageRecord::new("c", "x", "ds", "cc".into(), "1111".into(), 30.0),
        ];
        let result = DeduplicationEngine::new(3).find_duplicates(records);

        assert_eq!(kept_paths(&result), vec!["b", "c"]);
        assert_eq!(
            result.provenance[0].reason,
            ProvenanceReason::NearDuplicateOf("b".to_string())
        );
        assert!(!result.provenance[0].kept);
        assert_eq!(result.near_duplicates_removed(), 1);
    }

    #[test]
    fn test_near_duplicate_grouping_is_not_transitive() {
        // a~b and b~c but a and c are 4 bits apart: visiting a only pulls in b.
        let records = vec![
            ImageRecord::new("a", "x", "ds", "ca".into(), "00".into(), 90.0),
            ImageRecord::new("b", "x", "ds", "cb".into(), "03".into(), 10.0),
            ImageRecord::new("c", "x", "ds", "cc".into(), "0f".into(), 10.0),
        ];
        let result = DeduplicationEngine::new(2).find_duplicates(records);
        assert_eq!(kept_paths(&result), vec!["a", "c"]);
    }

    #[test]
    fn test_mismatched_widths_never_match() {
        let records = vec![
            ImageRecord::new("a", "x", "ds", "ca".into(), "00".into(), 10.0),
            ImageRecord::new("b", "x", "ds", "cb".into(), "0000".into(), 20.0),
        ];
        let result = DeduplicationEngine::new(64).find_duplicates(records);
        assert_eq!(result.unique.len(), 2);
    }

    #[test]
    fn test_unknown_hashes_collapse_by_default() {
        let records = vec![
            ImageRecord::new("a", "x", "ds", ContentHash::Unknown, PerceptualHash::Unknown, 1.0),
            ImageRecord::new("b", "y", "ds", ContentHash::Unknown, PerceptualHash::Unknown, 5.0),
            record("c", "cc", 0, 3.0),
        ];
        let result = DeduplicationEngine::default().find_duplicates(records);

        assert_eq!(kept_paths(&result), vec!["b", "c"]);
        assert_eq!(
            result.provenance[0].reason,
            ProvenanceReason::DuplicateOf("b".to_string())
        );
    }

    #[test]
    fn test_unknown_hashes_excluded_when_configured() {
        let records = vec![
            ImageRecord::new("a", "x", "ds", ContentHash::Unknown, PerceptualHash::Unknown, 1.0),
            ImageRecord::new("b", "y", "ds", ContentHash::Unknown, PerceptualHash::Unknown, 5.0),
            ImageRecord::new("c", "y", "ds", "cc".into(), PerceptualHash::Unknown, 5.0),
            ImageRecord::new("d", "y", "ds", "cd".into(), PerceptualHash::Unknown, 5.0),
        ];
        let result = DeduplicationEngine::default()
            .with_unknown_policy(UnknownHashPolicy::Exclude)
            .find_duplicates(records);

        assert_eq!(kept_paths(&result), vec!["a", "b", "c", "d"]);
        assert_eq!(result.provenance[0].reason, ProvenanceReason::HashUnavailable);
        assert_eq!(result.provenance[2].reason, ProvenanceReason::Unique);
    }

    #[test]
    fn test_provenance_counts_match_output() {
        let mut records = Vec::new();
        for i in 0..60u64 {
            // Every third record repeats content; perceptual hashes cluster in fours.
            let content = format!("content_{}", i / 3 * 3 + (i % 3 == 1) as u64);
            let phash = (i / 4) * 0x0101_0101 + (i % 4);
            records.push(record(&format!("p{}", i), &content, phash, (i * 7 % 13) as f64));
        }
        let total = records.len();
        let result = DeduplicationEngine::default().find_duplicates(records);

        assert_eq!(result.provenance.len(), total);
        let kept = result.provenance.iter().filter(|p| p.kept).count();
        assert_eq!(kept, result.unique.len());
    }

    #[test]
    fn test_rerun_on_unique_output_is_stable() {
        // Pseudo-random hashes; visiting best-first makes every group leader
        // its own representative.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut records = Vec::new();
        for i in 0..120u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let phash = if i % 5 == 0 { clustered_hash(i) } else { state };
            let content = format!("h{}", state % 97);
            records.push(record(&format!("r{}", i), &content, phash, 1000.0 - i as f64));
        }

        let engine = DeduplicationEngine::default();
        let first = engine.find_duplicates(records);
        for threshold in 1..=DEFAULT_PERCEPTUAL_THRESHOLD {
            let again = DeduplicationEngine::new(threshold).find_duplicates(first.unique.clone());
            assert_eq!(again.unique, first.unique);
            assert!(again.provenance.iter().all(|p| p.kept));
        }
    }

    fn clustered_hash(i: u64) -> u64 {
        0xabcd_0000_0000_0000 | (i & 0x3)
    }

    #[test]
    fn test_reason_strings() {
        let reason = ProvenanceReason::DuplicateOf("ds1/a.jpg".to_string());
        assert_eq!(reason.to_string(), "duplicate_of_ds1/a.jpg");
        assert_eq!(ProvenanceReason::from(reason.to_string()), reason);

        let near = ProvenanceReason::NearDuplicateOf("b.jpg".to_string());
        assert_eq!(ProvenanceReason::from(near.to_string()), near);
    }

    #[test]
    fn test_empty_input() {
        let result = DeduplicationEngine::default().find_duplicates(Vec::new());
        assert!(result.unique.is_empty());
        assert!(result.provenance.is_empty());
    }
}
