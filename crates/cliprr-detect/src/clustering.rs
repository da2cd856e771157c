//! Pure clustering core: common-fingerprint selection, temporal clustering,
//! labeling, and confidence.

use std::collections::{BTreeMap, BTreeSet};

use cliprr_models::{EpisodeFingerprint, Interval, SegmentCluster};

/// Tuning knobs for a season detection run.
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Fraction of episodes a fingerprint must appear in to count as common
    pub threshold_percent: f64,
    /// Max gap between neighboring offsets inside one cluster, in seconds
    pub time_threshold_sec: f64,
    /// Padding subtracted from a segment start, in seconds
    pub margin_sec: f64,
    /// Window length added past the last offset, in seconds
    pub window_sec: f64,
    /// Fraction of episodes a cluster must cover to survive
    pub min_episode_coverage: f64,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            threshold_percent: 0.5,
            time_threshold_sec: 15.0,
            margin_sec: 5.0,
            window_sec: 10.0,
            min_episode_coverage: 0.7,
        }
    }
}

/// Labeled output of the clustering core.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonClusters {
    pub clusters: Vec<SegmentCluster>,
    pub intro: Option<Interval>,
    pub credits: Option<Interval>,
    pub stingers: Vec<Interval>,
    pub confidence: f64,
    pub total_episodes: usize,
}

impl SeasonClusters {
    pub fn has_detection(&self) -> bool {
        self.intro.is_some() || self.credits.is_some() || !self.stingers.is_empty()
    }

    fn empty(total_episodes: usize) -> Self {
        Self {
            clusters: Vec::new(),
            intro: None,
            credits: None,
            stingers: Vec::new(),
            confidence: 0.0,
            total_episodes,
        }
    }
}

/// One fingerprint occurrence, flattened for clustering.
#[derive(Debug, Clone, PartialEq)]
struct Occurrence {
    offset: f64,
    episode_file_id: i64,
}

/// Cluster a season's fingerprint rows into labeled segments.
///
/// Deterministic for identical inputs: the fingerprint map is ordered,
/// occurrences sort by (offset, episode file id), and every float reduction
/// runs in that order.
pub fn cluster_season(episodes: &[EpisodeFingerprint], options: &DetectorOptions) -> SeasonClusters {
    let distinct: BTreeSet<i64> = episodes.iter().map(|e| e.episode_file_id).collect();
    let total_episodes = distinct.len();
    if total_episodes == 0 {
        return SeasonClusters::empty(0);
    }

    // Ranges must stay valid for every contributing episode.
    let file_duration = episodes
        .iter()
        .map(|e| e.file_duration)
        .filter(|d| *d > 0.0)
        .fold(f64::INFINITY, f64::min);
    let file_duration = if file_duration.is_finite() {
        file_duration
    } else {
        0.0
    };

    // fingerprint -> occurrences across episodes
    let mut map: BTreeMap<&str, Vec<Occurrence>> = BTreeMap::new();
    for episode in episodes {
        for entry in &episode.fingerprint_data {
            map.entry(entry.fingerprint.as_str()).or_default().push(Occurrence {
                offset: entry.offset_seconds,
                episode_file_id: episode.episode_file_id,
            });
        }
    }

    // Keep fingerprints seen in enough distinct episodes.
    let needed = (total_episodes as f64 * options.threshold_percent).ceil() as usize;
    let mut occurrences: Vec<Occurrence> = Vec::new();
    for occs in map.values() {
        let seen: BTreeSet<i64> = occs.iter().map(|o| o.episode_file_id).collect();
        if seen.len() >= needed.max(1) {
            occurrences.extend(occs.iter().cloned());
        }
    }

    if occurrences.is_empty() {
        return SeasonClusters::empty(total_episodes);
    }

    occurrences.sort_by(|a, b| {
        a.offset
            .total_cmp(&b.offset)
            .then(a.episode_file_id.cmp(&b.episode_file_id))
    });

    // Greedy temporal clustering on the sorted offsets.
    let mut groups: Vec<Vec<Occurrence>> = Vec::new();
    for occ in occurrences {
        let joins_current = groups
            .last()
            .and_then(|group| group.last())
            .is_some_and(|prev| (occ.offset - prev.offset).abs() <= options.time_threshold_sec);
        if joins_current {
            if let Some(group) = groups.last_mut() {
                group.push(occ);
            }
        } else {
            groups.push(vec![occ]);
        }
    }

    // Per-cluster segments, then the coverage filter.
    let coverage_needed =
        ((total_episodes as f64 * options.min_episode_coverage).ceil() as usize).max(1);
    let mut clusters: Vec<SegmentCluster> = Vec::new();
    for group in &groups {
        let offsets: Vec<f64> = group.iter().map(|o| o.offset).collect();
        let first = offsets.iter().cloned().fold(f64::INFINITY, f64::min);
        let last = offsets.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let episode_count = group
            .iter()
            .map(|o| o.episode_file_id)
            .collect::<BTreeSet<_>>()
            .len();

        if episode_count < coverage_needed {
            continue;
        }

        clusters.push(SegmentCluster {
            start: (first - options.margin_sec).max(0.0),
            end: (last + options.margin_sec + options.window_sec).min(file_duration),
            median_time: median(&offsets),
            episode_count,
        });
    }

    clusters.sort_by(|a, b| a.start.total_cmp(&b.start));

    if clusters.is_empty() {
        return SeasonClusters::empty(total_episodes);
    }

    // Positional labeling.
    let mut intro = None;
    let mut credits = None;
    let mut stingers = Vec::new();

    if clusters.len() == 1 {
        let c = &clusters[0];
        let interval = Interval::new(c.start, c.end);
        if c.median_time < 0.10 * file_duration {
            intro = Some(interval);
        } else if c.median_time > 0.80 * file_duration {
            credits = Some(interval);
        } else {
            intro = Some(interval);
        }
    } else {
        let last = clusters.len() - 1;
        intro = Some(Interval::new(clusters[0].start, clusters[0].end));
        credits = Some(Interval::new(clusters[last].start, clusters[last].end));
        for c in &clusters[1..last] {
            stingers.push(Interval::new(c.start, c.end));
        }
    }

    let confidence = confidence(&clusters, total_episodes);

    SeasonClusters {
        clusters,
        intro,
        credits,
        stingers,
        confidence,
        total_episodes,
    }
}

/// `clamp(coverage*0.6 + segment bonus + episode bonus, 0, 1)`, rounded to
/// two decimals.
fn confidence(clusters: &[SegmentCluster], total_episodes: usize) -> f64 {
    if clusters.is_empty() || total_episodes == 0 {
        return 0.0;
    }
    let covered: usize = clusters.iter().map(|c| c.episode_count).sum();
    let coverage = covered as f64 / (clusters.len() * total_episodes) as f64;
    let segment_bonus = (0.1 * clusters.len() as f64).min(0.2);
    let episode_bonus = (total_episodes as f64 / 10.0).min(0.2);
    let raw = (coverage * 0.6 + segment_bonus + episode_bonus).clamp(0.0, 1.0);
    (raw * 100.0).round() / 100.0
}

fn median(sorted_offsets: &[f64]) -> f64 {
    let mut offsets = sorted_offsets.to_vec();
    offsets.sort_by(f64::total_cmp);
    let n = offsets.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        offsets[n / 2]
    } else {
        (offsets[n / 2 - 1] + offsets[n / 2]) / 2.0
    }
}

/// Preservation policy: keep the stored result when the new run would
/// degrade it.
pub fn should_preserve_existing(
    existing_confidence: f64,
    existing_has_detection: bool,
    new_confidence: f64,
    new_has_detection: bool,
) -> bool {
    if existing_confidence > 0.8 && new_confidence < 0.3 {
        return true;
    }
    if existing_has_detection && !new_has_detection {
        return true;
    }
    new_confidence - existing_confidence <= 0.2
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliprr_models::FingerprintEntry;

    /// Build an episode with the given (offset, fingerprint) windows.
    fn episode(file_id: i64, duration: f64, entries: &[(f64, &str)]) -> EpisodeFingerprint {
        EpisodeFingerprint::new(
            1,
            1,
            file_id,
            file_id,
            entries
                .iter()
                .map(|(offset, fp)| FingerprintEntry {
                    offset_seconds: *offset,
                    fingerprint: (*fp).to_string(),
                })
                .collect(),
            duration,
            0,
        )
    }

    /// Six 1800 s episodes sharing an intro at offsets 5..35.
    fn six_episode_season() -> Vec<EpisodeFingerprint> {
        (1..=6)
            .map(|i| {
                episode(
                    i,
                    1800.0,
                    &[
                        (5.0, "intro-a"),
                        (15.0, "intro-b"),
                        (25.0, "intro-c"),
                        (35.0, "intro-d"),
                        // per-episode noise
                        (600.0, &format!("noise-{i}")[..]),
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn common_intro_cluster_is_detected() {
        let season = six_episode_season();
        let result = cluster_season(&season, &DetectorOptions::default());

        let intro = result.intro.expect("intro detected");
        assert_eq!(intro.start, 0.0);
        assert_eq!(intro.end, 50.0);
        assert!(result.credits.is_none());
        assert!(result.stingers.is_empty());

        // coverage 1.0 -> 0.6, one segment -> 0.1, six episodes -> 0.2
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert!((0.70..=0.90).contains(&result.confidence));
    }

    #[test]
    fn output_is_deterministic() {
        let season = six_episode_season();
        let a = cluster_season(&season, &DetectorOptions::default());
        let mut reversed = season.clone();
        reversed.reverse();
        let b = cluster_season(&reversed, &DetectorOptions::default());
        assert_eq!(a, b);
    }

    #[test]
    fn rare_fingerprints_are_dropped() {
        let mut season = six_episode_season();
        // A fingerprint shared by only two of six episodes misses
        // ceil(6 * 0.5) = 3 and must not form a cluster.
        for ep in season.iter_mut().take(2) {
            ep.fingerprint_data.push(FingerprintEntry {
                offset_seconds: 900.0,
                fingerprint: "rare".into(),
            });
        }
        let result = cluster_season(&season, &DetectorOptions::default());
        assert_eq!(result.clusters.len(), 1);
        assert!(result.stingers.is_empty());
    }

    #[test]
    fn low_coverage_clusters_are_filtered() {
        let mut season = six_episode_season();
        // Common enough to pass selection (3 episodes) but below
        // ceil(6 * 0.7) = 5 episode coverage.
        for ep in season.iter_mut().take(3) {
            ep.fingerprint_data.push(FingerprintEntry {
                offset_seconds: 900.0,
                fingerprint: "mid".into(),
            });
        }
        let result = cluster_season(&season, &DetectorOptions::default());
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.intro.unwrap().end, 50.0);
    }

    #[test]
    fn single_late_cluster_labels_credits() {
        let season: Vec<_> = (1..=6)
            .map(|i| {
                episode(
                    i,
                    1800.0,
                    &[(1700.0, "cred-a"), (1710.0, "cred-b"), (1720.0, "cred-c")],
                )
            })
            .collect();
        let result = cluster_season(&season, &DetectorOptions::default());
        assert!(result.intro.is_none());
        let credits = result.credits.expect("credits detected");
        assert_eq!(credits.start, 1695.0);
        assert_eq!(credits.end, 1735.0);
    }

    #[test]
    fn single_middle_cluster_defaults_to_intro() {
        let season: Vec<_> = (1..=6)
            .map(|i| episode(i, 1800.0, &[(900.0, "mid-a"), (910.0, "mid-b")]))
            .collect();
        let result = cluster_season(&season, &DetectorOptions::default());
        assert!(result.intro.is_some());
        assert!(result.credits.is_none());
    }

    #[test]
    fn intro_precedes_credits_with_two_clusters() {
        let season: Vec<_> = (1..=6)
            .map(|i| {
                episode(
                    i,
                    1800.0,
                    &[
                        (5.0, "intro-a"),
                        (15.0, "intro-b"),
                        (1700.0, "cred-a"),
                        (1710.0, "cred-b"),
                    ],
                )
            })
            .collect();
        let result = cluster_season(&season, &DetectorOptions::default());
        let intro = result.intro.unwrap();
        let credits = result.credits.unwrap();
        assert!(intro.end <= credits.start);
    }

    #[test]
    fn three_clusters_yield_a_stinger() {
        let season: Vec<_> = (1..=6)
            .map(|i| {
                episode(
                    i,
                    1800.0,
                    &[
                        (5.0, "intro-a"),
                        (900.0, "sting-a"),
                        (1700.0, "cred-a"),
                    ],
                )
            })
            .collect();
        let result = cluster_season(&season, &DetectorOptions::default());
        assert_eq!(result.clusters.len(), 3);
        assert_eq!(result.stingers.len(), 1);
        assert!(result.stingers[0].start > result.intro.unwrap().end);
        assert!(result.stingers[0].end < result.credits.unwrap().start);
    }

    #[test]
    fn strong_coverage_implies_confident_result() {
        // avg coverage >= 0.9 must produce confidence >= 0.60.
        let season = six_episode_season();
        let result = cluster_season(&season, &DetectorOptions::default());
        let covered: usize = result.clusters.iter().map(|c| c.episode_count).sum();
        let avg = covered as f64 / (result.clusters.len() * result.total_episodes) as f64;
        assert!(avg >= 0.9);
        assert!(result.confidence >= 0.60);
    }

    #[test]
    fn empty_input_yields_no_detection() {
        let result = cluster_season(&[], &DetectorOptions::default());
        assert!(!result.has_detection());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn segment_end_clamps_to_duration() {
        let season: Vec<_> = (1..=6)
            .map(|i| episode(i, 1740.0, &[(1730.0, "tail-a"), (1735.0, "tail-b")]))
            .collect();
        let result = cluster_season(&season, &DetectorOptions::default());
        let credits = result.credits.unwrap();
        assert_eq!(credits.end, 1740.0);
    }

    #[test]
    fn preservation_policy_rules() {
        // (a) strong existing vs weak new
        assert!(should_preserve_existing(0.85, true, 0.2, true));
        // (b) existing had detection, new has none
        assert!(should_preserve_existing(0.5, true, 0.9, false));
        // (c) marginal improvement
        assert!(should_preserve_existing(0.5, true, 0.65, true));
        // noop rerun (R3)
        assert!(should_preserve_existing(0.9, true, 0.9, true));
        // clear improvement overwrites
        assert!(!should_preserve_existing(0.4, true, 0.9, true));
        // first real detection overwrites an empty row
        assert!(!should_preserve_existing(0.0, false, 0.8, true));
    }
}
