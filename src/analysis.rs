//! Statistics-driven study analysis: patterns, recommendations and a simple
//! score prediction.

use crate::db_storage::LearningStore;
use crate::errors::AppError;
use crate::models::{DateRange, SubjectEfficiencyRow, SubjectStatistics};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PATTERN_DAYS: i64 = 30;
/// Longest window the pattern report accepts (ten years).
pub const MAX_PATTERN_DAYS: i64 = 3650;
/// Minutes, used when there is too little data to cluster.
pub const DEFAULT_SESSION_LENGTH: i64 = 45;
pub const DEFAULT_STRESS_LEVEL: f64 = 3.0;

const KMEANS_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressFactors {
    /// Pearson correlation of average stress against average score.
    pub stress_impact: Option<f64>,
    pub high_stress_subjects: Vec<String>,
    pub optimal_stress_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPatterns {
    pub most_studied: String,
    pub most_efficient: Option<String>,
    pub stress_factors: StressFactors,
    /// Recommended session length in minutes.
    pub optimal_sessions: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPatternReport {
    pub period_days: i64,
    pub statistics: Vec<SubjectStatistics>,
    pub patterns: Option<StudyPatterns>,
    pub efficiency: Vec<SubjectEfficiencyRow>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionFactor {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePrediction {
    pub subject: String,
    pub predicted_score: Option<f64>,
    pub confidence: f64,
    pub factors: Vec<PredictionFactor>,
}

impl PerformancePrediction {
    fn unknown(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            predicted_score: None,
            confidence: 0.0,
            factors: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct LearningAnalyzer {
    store: LearningStore,
}

impl LearningAnalyzer {
    pub fn new(store: LearningStore) -> Self {
        Self { store }
    }

    pub async fn analyze_study_patterns(
        &self,
        user_id: i64,
        days: i64,
    ) -> Result<StudyPatternReport, AppError> {
        if !(1..=MAX_PATTERN_DAYS).contains(&days) {
            return Err(AppError::BadRequest(format!(
                "days must be between 1 and {}",
                MAX_PATTERN_DAYS
            )));
        }

        let range = DateRange::since(Utc::now() - Duration::days(days));
        let statistics = self.store.get_study_statistics(user_id, range).await?;
        let efficiency = self.store.get_learning_efficiency(user_id).await?;
        let patterns = identify_study_patterns(&statistics);
        let recommendations = patterns
            .as_ref()
            .map(generate_recommendations)
            .unwrap_or_default();

        tracing::debug!(
            "Analyzed {} subjects over {} days for user {}",
            statistics.len(),
            days,
            user_id
        );

        Ok(StudyPatternReport {
            period_days: days,
            statistics,
            patterns,
            efficiency,
            recommendations,
        })
    }

    /// Predicts the next score for `subject` from the last 30 days.
    pub async fn get_performance_prediction(
        &self,
        user_id: i64,
        subject: &str,
    ) -> Result<PerformancePrediction, AppError> {
        let range = DateRange::since(Utc::now() - Duration::days(DEFAULT_PATTERN_DAYS));
        let stats = self.store.get_study_statistics(user_id, range).await?;
        Ok(predict_performance(&stats, subject))
    }
}

/// `None` when there are no statistics at all.
pub fn identify_study_patterns(stats: &[SubjectStatistics]) -> Option<StudyPatterns> {
    let most_studied = first_max_by(stats, |s| Some(s.total_time as f64))?;
    let most_efficient = first_max_by(stats, |s| s.avg_score);

    Some(StudyPatterns {
        most_studied: most_studied.subject.clone(),
        most_efficient: most_efficient.map(|s| s.subject.clone()),
        stress_factors: analyze_stress_factors(stats),
        optimal_sessions: find_optimal_session_length(stats),
    })
}

/// First row with the largest key; rows without a key are skipped.
fn first_max_by<F>(stats: &[SubjectStatistics], key: F) -> Option<&SubjectStatistics>
where
    F: Fn(&SubjectStatistics) -> Option<f64>,
{
    let mut best: Option<(&SubjectStatistics, f64)> = None;
    for row in stats {
        if let Some(value) = key(row) {
            if best.map_or(true, |(_, top)| value > top) {
                best = Some((row, value));
            }
        }
    }
    best.map(|(row, _)| row)
}

pub fn analyze_stress_factors(stats: &[SubjectStatistics]) -> StressFactors {
    let (stress, scores): (Vec<f64>, Vec<f64>) = stats
        .iter()
        .filter_map(|s| Some((s.avg_stress?, s.avg_score?)))
        .unzip();

    let stress_levels: Vec<f64> = stats.iter().filter_map(|s| s.avg_stress).collect();
    let high_stress_subjects = match mean(&stress_levels) {
        Some(mean_stress) => stats
            .iter()
            .filter(|s| s.avg_stress.is_some_and(|v| v > mean_stress))
            .map(|s| s.subject.clone())
            .collect(),
        None => Vec::new(),
    };

    StressFactors {
        stress_impact: pearson(&stress, &scores),
        high_stress_subjects,
        optimal_stress_level: find_optimal_stress_level(stats),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Pearson correlation; `None` for fewer than two points or zero variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs)?;
    let my = mean(ys)?;

    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }

    let denom = (vx * vy).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        None
    } else {
        Some(cov / denom)
    }
}

/// Splits subjects into two clusters over (avg_time, avg_score) and returns
/// the average time of the better-scoring cluster, truncated to minutes.
pub fn find_optimal_session_length(stats: &[SubjectStatistics]) -> i64 {
    let points: Vec<[f64; 2]> = stats
        .iter()
        .filter_map(|s| Some([s.avg_time, s.avg_score?]))
        .collect();
    if points.len() < 2 {
        return DEFAULT_SESSION_LENGTH;
    }

    let centers = two_means(&points);
    let best = if centers[1][1] > centers[0][1] {
        centers[1]
    } else {
        centers[0]
    };
    best[0] as i64
}

/// Lloyd's algorithm with k = 2, seeded with the lowest and highest scoring
/// points so the result does not depend on randomness.
fn two_means(points: &[[f64; 2]]) -> [[f64; 2]; 2] {
    let by_score = |a: &&[f64; 2], b: &&[f64; 2]| a[1].total_cmp(&b[1]);
    let (Some(low), Some(high)) = (
        points.iter().min_by(by_score),
        points.iter().max_by(by_score),
    ) else {
        return [[0.0; 2]; 2];
    };

    let mut centers = [*low, *high];
    let mut assignment: Vec<usize> = vec![usize::MAX; points.len()];

    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (slot, point) in assignment.iter_mut().zip(points) {
            let nearest = if sq_dist(point, &centers[1]) < sq_dist(point, &centers[0]) {
                1
            } else {
                0
            };
            if *slot != nearest {
                *slot = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        for (cluster, center) in centers.iter_mut().enumerate() {
            let members: Vec<&[f64; 2]> = points
                .iter()
                .zip(&assignment)
                .filter(|(_, a)| **a == cluster)
                .map(|(p, _)| p)
                .collect();
            // An empty cluster keeps its previous centre.
            if !members.is_empty() {
                let n = members.len() as f64;
                *center = [
                    members.iter().map(|p| p[0]).sum::<f64>() / n,
                    members.iter().map(|p| p[1]).sum::<f64>() / n,
                ];
            }
        }
    }
    centers
}

fn sq_dist(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

/// Average stress of the subject with the best score-to-stress ratio.
pub fn find_optimal_stress_level(stats: &[SubjectStatistics]) -> f64 {
    let mut best: Option<(f64, f64)> = None;
    for row in stats {
        if let (Some(score), Some(stress)) = (row.avg_score, row.avg_stress) {
            if stress <= 0.0 {
                continue;
            }
            let ratio = score / stress;
            if best.map_or(true, |(top, _)| ratio > top) {
                best = Some((ratio, stress));
            }
        }
    }
    best.map(|(_, stress)| stress).unwrap_or(DEFAULT_STRESS_LEVEL)
}

pub fn generate_recommendations(patterns: &StudyPatterns) -> Vec<String> {
    let mut recommendations = Vec::new();

    if patterns.optimal_sessions > 0 {
        recommendations.push(format!(
            "최적 학습 세션 길이는 {}분입니다. 이 시간을 기준으로 학습 계획을 수립하세요.",
            patterns.optimal_sessions
        ));
    }

    if let Some(subject) = &patterns.most_efficient {
        recommendations.push(format!(
            "{} 과목에서 가장 높은 효율을 보이고 있습니다. 이 과목의 학습 방식을 다른 과목에도 적용해 보세요.",
            subject
        ));
    }

    let high_stress = &patterns.stress_factors.high_stress_subjects;
    if !high_stress.is_empty() {
        recommendations.push(format!(
            "{} 과목에서 스트레스가 높게 나타납니다. 이 과목들의 학습 방식을 재검토하고 필요한 경우 휴식을 취하세요.",
            high_stress.join(", ")
        ));
    }

    recommendations
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Scales the subject's current score up with relative study time and down
/// with relative stress.
pub fn predict_performance(stats: &[SubjectStatistics], subject: &str) -> PerformancePrediction {
    let Some(row) = stats.iter().find(|s| s.subject == subject) else {
        return PerformancePrediction::unknown(subject);
    };
    let Some(current_score) = row.avg_score else {
        return PerformancePrediction::unknown(subject);
    };

    let totals: Vec<f64> = stats.iter().map(|s| s.total_time as f64).collect();
    let intensity = row.total_time as f64;
    let relative_time = match mean(&totals) {
        Some(m) if m > 0.0 => intensity / m,
        _ => 0.0,
    };

    let stress_levels: Vec<f64> = stats.iter().filter_map(|s| s.avg_stress).collect();
    let relative_stress = match (row.avg_stress, mean(&stress_levels)) {
        (Some(stress), Some(m)) if m > 0.0 => stress / m,
        _ => 0.0,
    };

    let predicted = current_score * (1.0 + 0.1 * relative_time) * (1.0 - 0.05 * relative_stress);
    let confidence = (0.5 + 0.1 * relative_time).min(0.9);

    PerformancePrediction {
        subject: subject.to_string(),
        predicted_score: Some(round2(predicted)),
        confidence: round2(confidence),
        factors: vec![
            PredictionFactor {
                name: "현재 성적".to_string(),
                value: current_score,
            },
            PredictionFactor {
                name: "학습 강도".to_string(),
                value: intensity,
            },
            PredictionFactor {
                name: "스트레스 수준".to_string(),
                value: row.avg_stress.unwrap_or(0.0),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(subject: &str, total: i64, avg_time: f64, score: f64, stress: f64) -> SubjectStatistics {
        SubjectStatistics {
            subject: subject.into(),
            study_sessions: 1,
            total_time: total,
            avg_time,
            avg_score: Some(score),
            avg_stress: Some(stress),
        }
    }

    #[test]
    fn pearson_edge_cases() {
        assert_eq!(pearson(&[1.0], &[2.0]), None);
        assert_eq!(pearson(&[1.0, 1.0], &[2.0, 3.0]), None);
        let r = pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-12);
    }

    #[test]
    fn patterns_pick_extremes() {
        let stats = vec![
            stat("물리", 300, 60.0, 70.0, 4.0),
            stat("수학", 500, 50.0, 85.0, 2.0),
            stat("영어", 100, 30.0, 60.0, 3.0),
        ];
        let patterns = identify_study_patterns(&stats).unwrap();

        assert_eq!(patterns.most_studied, "수학");
        assert_eq!(patterns.most_efficient.as_deref(), Some("수학"));
        assert_eq!(patterns.stress_factors.high_stress_subjects, vec!["물리"]);
        assert_eq!(patterns.stress_factors.optimal_stress_level, 2.0);
        assert!(patterns.stress_factors.stress_impact.unwrap() < 0.0);
    }

    #[test]
    fn no_statistics_no_patterns() {
        assert!(identify_study_patterns(&[]).is_none());
    }

    #[test]
    fn session_length_defaults_and_clusters() {
        assert_eq!(find_optimal_session_length(&[]), DEFAULT_SESSION_LENGTH);
        assert_eq!(
            find_optimal_session_length(&[stat("수학", 60, 60.0, 90.0, 3.0)]),
            DEFAULT_SESSION_LENGTH
        );

        let stats = vec![
            stat("a", 0, 50.0, 90.0, 3.0),
            stat("b", 0, 52.0, 92.0, 3.0),
            stat("c", 0, 100.0, 40.0, 3.0),
            stat("d", 0, 110.0, 45.0, 3.0),
        ];
        assert_eq!(find_optimal_session_length(&stats), 51);
    }

    #[test]
    fn stress_level_default() {
        let mut row = stat("수학", 10, 10.0, 80.0, 3.0);
        row.avg_stress = None;
        assert_eq!(find_optimal_stress_level(&[row]), DEFAULT_STRESS_LEVEL);
    }

    #[test]
    fn recommendations_cover_each_pattern() {
        let stats = vec![stat("물리", 300, 60.0, 70.0, 4.0), stat("수학", 500, 50.0, 85.0, 2.0)];
        let patterns = identify_study_patterns(&stats).unwrap();
        let recs = generate_recommendations(&patterns);

        assert_eq!(recs.len(), 3);
        assert!(recs[1].starts_with("수학"));
        assert!(recs[2].starts_with("물리"));
    }

    #[test]
    fn prediction_formula() {
        let stats = vec![stat("수학", 200, 50.0, 80.0, 2.0), stat("물리", 200, 50.0, 70.0, 2.0)];
        let prediction = predict_performance(&stats, "수학");

        // 80 * 1.1 * 0.95
        assert_eq!(prediction.predicted_score, Some(83.6));
        assert_eq!(prediction.confidence, 0.6);
        assert_eq!(prediction.factors.len(), 3);
        assert_eq!(prediction.factors[1].value, 200.0);
    }

    #[test]
    fn prediction_confidence_is_capped() {
        let mut stats = vec![stat("수학", 10_000, 50.0, 80.0, 2.0)];
        for subject in ["물리", "화학", "생물", "국어", "영어"] {
            stats.push(stat(subject, 1, 50.0, 70.0, 2.0));
        }
        assert_eq!(predict_performance(&stats, "수학").confidence, 0.9);
    }

    #[test]
    fn unknown_subject_has_no_prediction() {
        let prediction = predict_performance(&[stat("수학", 10, 10.0, 80.0, 3.0)], "화학");
        assert_eq!(prediction.predicted_score, None);
        assert_eq!(prediction.confidence, 0.0);
        assert!(prediction.factors.is_empty());
    }
}
