use crate::models::StudyRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One study session as seen by the pattern summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySession {
    pub subject: String,
    /// Minutes.
    pub duration: i64,
    pub score: Option<f64>,
    /// Time slot label, e.g. `"21:00"`.
    pub time: Option<String>,
    pub concept: Option<String>,
}

impl From<&StudyRecord> for StudySession {
    fn from(record: &StudyRecord) -> Self {
        Self {
            subject: record.subject.clone(),
            duration: record.study_time,
            score: record.score,
            time: Some(record.created_at.format("%H:00").to_string()),
            concept: record.concept.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakPerformance {
    pub peak_time: String,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakPoint {
    pub concept: String,
    pub average_score: f64,
    pub frequency: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningPatternSummary {
    pub total_study_time: i64,
    pub subject_distribution: BTreeMap<String, i64>,
    pub peak_performance_time: Option<PeakPerformance>,
    pub weak_points: Vec<WeakPoint>,
}

impl LearningPatternSummary {
    pub fn is_empty(&self) -> bool {
        self.subject_distribution.is_empty()
    }
}

/// Stateless summaries over raw study sessions.
pub struct DataProcessor;

impl DataProcessor {
    pub fn analyze_learning_patterns(sessions: &[StudySession]) -> LearningPatternSummary {
        if sessions.is_empty() {
            return LearningPatternSummary::default();
        }

        let mut subject_distribution = BTreeMap::new();
        for session in sessions {
            let total = subject_distribution
                .entry(session.subject.clone())
                .or_insert(0i64);
            *total = total.saturating_add(session.duration);
        }

        LearningPatternSummary {
            total_study_time: sessions
                .iter()
                .fold(0i64, |acc, s| acc.saturating_add(s.duration)),
            subject_distribution,
            peak_performance_time: Self::find_peak_performance_time(sessions),
            weak_points: Self::identify_weak_points(sessions),
        }
    }

    /// Time slot with the highest mean score; the earliest slot wins ties.
    fn find_peak_performance_time(sessions: &[StudySession]) -> Option<PeakPerformance> {
        let mut by_slot: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for session in sessions {
            if let (Some(time), Some(score)) = (session.time.as_deref(), session.score) {
                let slot = by_slot.entry(time).or_insert((0.0, 0));
                slot.0 += score;
                slot.1 += 1;
            }
        }

        let mut peak: Option<PeakPerformance> = None;
        for (time, (sum, count)) in by_slot {
            let average = sum / count as f64;
            if peak.as_ref().map_or(true, |p| average > p.average_score) {
                peak = Some(PeakPerformance {
                    peak_time: time.to_string(),
                    average_score: average,
                });
            }
        }
        peak
    }

    /// Concepts of the sessions scoring below the overall mean.
    fn identify_weak_points(sessions: &[StudySession]) -> Vec<WeakPoint> {
        let scores: Vec<f64> = sessions.iter().filter_map(|s| s.score).collect();
        if scores.is_empty() {
            return Vec::new();
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;

        let mut by_concept: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for session in sessions {
            if let (Some(concept), Some(score)) = (session.concept.as_deref(), session.score) {
                if score < mean {
                    let entry = by_concept.entry(concept).or_insert((0.0, 0));
                    entry.0 += score;
                    entry.1 += 1;
                }
            }
        }

        by_concept
            .into_iter()
            .map(|(concept, (sum, count))| WeakPoint {
                concept: concept.to_string(),
                average_score: sum / count as f64,
                frequency: count,
            })
            .collect()
    }
}
