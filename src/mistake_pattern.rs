use crate::models::MistakeRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const IMPROVEMENT_STRATEGIES: [&str; 3] = [
    "문제 풀이 전 체크리스트 활용",
    "시간 관리 전략 수립",
    "스트레스 관리 방안 마련",
];

pub const FOCUS_POINTS: [&str; 3] = [
    "문제 조건을 형광펜으로 표시",
    "중간 계산 과정 한 번 더 검토",
    "시험 종료 5분 전 답안 최종 검토",
];

/// Subject by mistake-type counts, zero-filled. `counts[i][j]` is for
/// `subjects[i]` and `mistake_types[j]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Crosstab {
    pub subjects: Vec<String>,
    pub mistake_types: Vec<String>,
    pub counts: Vec<Vec<u64>>,
}

impl Crosstab {
    pub fn get(&self, subject: &str, mistake_type: &str) -> u64 {
        let row = self.subjects.iter().position(|s| s == subject);
        let col = self.mistake_types.iter().position(|t| t == mistake_type);
        match (row, col) {
            (Some(r), Some(c)) => self.counts[r][c],
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistakeTrendPoint {
    pub date: NaiveDate,
    pub mistake_type: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressPoint {
    pub stress_level: i64,
    pub mistake_count: u64,
}

/// Least-squares line `count = slope * stress + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trendline {
    pub slope: f64,
    pub intercept: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StressCorrelation {
    pub points: Vec<StressPoint>,
    pub trendline: Option<Trendline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementSuggestions {
    pub primary_mistake: String,
    pub challenging_subject: String,
    pub strategies: Vec<String>,
    pub focus_points: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MistakeReport {
    pub total_mistakes: usize,
    pub pattern_overview: Crosstab,
    pub trend: Vec<MistakeTrendPoint>,
    pub stress_correlation: StressCorrelation,
    pub suggestions: Option<ImprovementSuggestions>,
}

impl MistakeReport {
    pub fn from_records(records: &[MistakeRecord]) -> Self {
        Self {
            total_mistakes: records.len(),
            pattern_overview: crosstab(records),
            trend: trend(records),
            stress_correlation: stress_correlation(records),
            suggestions: suggestions(records),
        }
    }
}

fn crosstab(records: &[MistakeRecord]) -> Crosstab {
    let subjects: BTreeSet<&str> = records.iter().map(|r| r.subject.as_str()).collect();
    let types: BTreeSet<&str> = records.iter().map(|r| r.mistake_type.as_str()).collect();
    let subjects: Vec<String> = subjects.into_iter().map(str::to_string).collect();
    let mistake_types: Vec<String> = types.into_iter().map(str::to_string).collect();

    let mut counts = vec![vec![0u64; mistake_types.len()]; subjects.len()];
    for record in records {
        // Both lookups succeed: the axes were built from these records.
        if let (Ok(r), Ok(c)) = (
            subjects.binary_search(&record.subject),
            mistake_types.binary_search(&record.mistake_type),
        ) {
            counts[r][c] += 1;
        }
    }

    Crosstab {
        subjects,
        mistake_types,
        counts,
    }
}

fn trend(records: &[MistakeRecord]) -> Vec<MistakeTrendPoint> {
    let mut by_day: BTreeMap<(NaiveDate, &str), u64> = BTreeMap::new();
    for record in records {
        *by_day
            .entry((record.created_at.date_naive(), record.mistake_type.as_str()))
            .or_insert(0) += 1;
    }
    by_day
        .into_iter()
        .map(|((date, mistake_type), count)| MistakeTrendPoint {
            date,
            mistake_type: mistake_type.to_string(),
            count,
        })
        .collect()
}

fn stress_correlation(records: &[MistakeRecord]) -> StressCorrelation {
    let mut by_level: BTreeMap<i64, u64> = BTreeMap::new();
    for level in records.iter().filter_map(|r| r.stress_level) {
        *by_level.entry(level).or_insert(0) += 1;
    }

    let points: Vec<StressPoint> = by_level
        .into_iter()
        .map(|(stress_level, mistake_count)| StressPoint {
            stress_level,
            mistake_count,
        })
        .collect();

    let xs: Vec<f64> = points.iter().map(|p| p.stress_level as f64).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.mistake_count as f64).collect();

    StressCorrelation {
        trendline: ols(&xs, &ys),
        points,
    }
}

/// Ordinary least squares fit; `None` without two distinct x values.
pub fn ols(xs: &[f64], ys: &[f64]) -> Option<Trendline> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;

    let sxx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
    if sxx == 0.0 {
        return None;
    }
    let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).sum();

    let slope = sxy / sxx;
    Some(Trendline {
        slope,
        intercept: my - slope * mx,
    })
}

/// Most frequent value; ties go to the lexicographically smallest.
fn most_frequent<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}

fn suggestions(records: &[MistakeRecord]) -> Option<ImprovementSuggestions> {
    let primary_mistake = most_frequent(records.iter().map(|r| r.mistake_type.as_str()))?;
    let challenging_subject = most_frequent(records.iter().map(|r| r.subject.as_str()))?;

    Some(ImprovementSuggestions {
        primary_mistake,
        challenging_subject,
        strategies: IMPROVEMENT_STRATEGIES.iter().map(|s| s.to_string()).collect(),
        focus_points: FOCUS_POINTS.iter().map(|s| s.to_string()).collect(),
    })
}
