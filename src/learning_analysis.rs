use crate::models::StudyRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SESSION_MINUTES: u32 = 50;
pub const BREAK_MINUTES: u32 = 10;
pub const PEAK_WINDOWS: [&str; 2] = ["09:00-11:00", "15:00-17:00"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTrendPoint {
    pub date: NaiveDate,
    pub subject: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectEfficiency {
    pub subject: String,
    pub total_time: i64,
    pub mean_score: Option<f64>,
    /// Mean score per hour studied.
    pub efficiency: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyAdvice {
    pub session_minutes: u32,
    pub break_minutes: u32,
    pub peak_windows: Vec<String>,
}

impl Default for StudyAdvice {
    fn default() -> Self {
        Self {
            session_minutes: SESSION_MINUTES,
            break_minutes: BREAK_MINUTES,
            peak_windows: PEAK_WINDOWS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

/// Time, performance and efficiency breakdown of a user's study log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub time_distribution: BTreeMap<String, i64>,
    pub performance_trend: Vec<ScoreTrendPoint>,
    pub efficiency: Vec<SubjectEfficiency>,
    pub best_subject: Option<String>,
    pub advice: StudyAdvice,
}

impl LearningReport {
    pub fn from_records(records: &[StudyRecord]) -> Self {
        let mut time_distribution: BTreeMap<String, i64> = BTreeMap::new();
        let mut scores_by_subject: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        let mut scores_by_day: BTreeMap<(NaiveDate, &str), (f64, usize)> = BTreeMap::new();

        for record in records {
            let total = time_distribution.entry(record.subject.clone()).or_insert(0);
            *total = total.saturating_add(record.study_time);
            if let Some(score) = record.score {
                let subject = scores_by_subject.entry(record.subject.as_str()).or_insert((0.0, 0));
                subject.0 += score;
                subject.1 += 1;

                let day = scores_by_day
                    .entry((record.created_at.date_naive(), record.subject.as_str()))
                    .or_insert((0.0, 0));
                day.0 += score;
                day.1 += 1;
            }
        }

        let performance_trend = scores_by_day
            .into_iter()
            .map(|((date, subject), (sum, count))| ScoreTrendPoint {
                date,
                subject: subject.to_string(),
                score: sum / count as f64,
            })
            .collect();

        let efficiency: Vec<SubjectEfficiency> = time_distribution
            .iter()
            .map(|(subject, &total_time)| {
                let mean_score = scores_by_subject
                    .get(subject.as_str())
                    .map(|(sum, count)| sum / *count as f64);
                let efficiency = match mean_score {
                    Some(score) if total_time > 0 => Some(score / (total_time as f64 / 60.0)),
                    _ => None,
                };
                SubjectEfficiency {
                    subject: subject.clone(),
                    total_time,
                    mean_score,
                    efficiency,
                }
            })
            .collect();

        let mut best: Option<(&str, f64)> = None;
        for row in &efficiency {
            if let Some(value) = row.efficiency {
                if best.map_or(true, |(_, top)| value > top) {
                    best = Some((&row.subject, value));
                }
            }
        }
        let best_subject = best.map(|(subject, _)| subject.to_string());

        Self {
            time_distribution,
            performance_trend,
            efficiency,
            best_subject,
            advice: StudyAdvice::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(subject: &str, day: u32, minutes: i64, score: Option<f64>) -> StudyRecord {
        StudyRecord {
            record_id: 0,
            user_id: 1,
            subject: subject.into(),
            concept: None,
            study_time: minutes,
            score,
            stress_level: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn efficiency_is_score_per_hour() {
        let records = vec![
            record("수학", 1, 60, Some(80.0)),
            record("수학", 2, 60, Some(90.0)),
            record("영어", 1, 30, Some(70.0)),
        ];
        let report = LearningReport::from_records(&records);

        assert_eq!(report.time_distribution["수학"], 120);
        let math = report.efficiency.iter().find(|e| e.subject == "수학").unwrap();
        assert_eq!(math.mean_score, Some(85.0));
        assert_eq!(math.efficiency, Some(42.5));

        // 70 / 0.5h = 140
        assert_eq!(report.best_subject.as_deref(), Some("영어"));
    }

    #[test]
    fn trend_groups_by_day_and_subject() {
        let records = vec![
            record("수학", 1, 30, Some(60.0)),
            record("수학", 1, 30, Some(80.0)),
            record("수학", 2, 30, Some(90.0)),
        ];
        let report = LearningReport::from_records(&records);

        assert_eq!(report.performance_trend.len(), 2);
        assert_eq!(report.performance_trend[0].score, 70.0);
        assert_eq!(
            report.performance_trend[0].date,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
    }

    #[test]
    fn zero_time_has_no_efficiency() {
        let report = LearningReport::from_records(&[record("국어", 1, 0, Some(90.0))]);
        assert_eq!(report.efficiency[0].efficiency, None);
        assert_eq!(report.best_subject, None);
        assert_eq!(report.advice.session_minutes, 50);
    }

    #[test]
    fn huge_study_times_saturate() {
        let records = vec![
            record("수학", 1, i64::MAX, Some(80.0)),
            record("수학", 2, i64::MAX, Some(90.0)),
        ];
        let report = LearningReport::from_records(&records);
        assert_eq!(report.time_distribution["수학"], i64::MAX);
        assert!(report.efficiency[0].efficiency.is_some());
    }
}
