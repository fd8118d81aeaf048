//! Demand estimate for stall owners.
//!
//! A linear regression over five engineered features predicts how many
//! orders a food item will get in a slot. With fewer than
//! [`MIN_TRAINING_RECORDS`] history rows the predictor falls back to a
//! fixed campus rule of thumb.

use crate::domain::model::{DemandRecord, TimeSlot};
use crate::store::Store;
use crate::utils::error::Result;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::btree_map::{BTreeMap, Entry};

pub const MIN_TRAINING_RECORDS: usize = 5;
pub const PEAK_THRESHOLD: i64 = 35;
/// Slot used for the dashboard's "what to prepare" estimate.
pub const DASHBOARD_SLOT_INDEX: i64 = 2;

const FEATURES: usize = 5;

pub const WEEKDAY_LABELS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const CHART_COLORS: [&str; 5] = [
    "rgba(255, 99, 132, 0.8)",
    "rgba(54, 162, 235, 0.8)",
    "rgba(255, 206, 86, 0.8)",
    "rgba(75, 192, 192, 0.8)",
    "rgba(153, 102, 255, 0.8)",
];

/// 0 = Monday … 6 = Sunday
pub fn day_index(date: NaiveDate) -> i64 {
    date.weekday().num_days_from_monday() as i64
}

pub fn iso_week(date: NaiveDate) -> i64 {
    date.iso_week().week() as i64
}

/// `[day, slot, is_weekend, week, day × slot]`
fn features(day_of_week: i64, slot_index: i64, week_number: i64) -> [f64; FEATURES] {
    let is_weekend = if day_of_week >= 5 { 1 } else { 0 };
    [
        day_of_week as f64,
        slot_index as f64,
        is_weekend as f64,
        week_number as f64,
        (day_of_week * slot_index) as f64,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemandSample {
    pub day_of_week: i64,
    pub slot_index: i64,
    pub week_number: i64,
    pub quantity: i64,
}

impl From<&DemandRecord> for DemandSample {
    fn from(record: &DemandRecord) -> Self {
        Self {
            day_of_week: record.day_of_week,
            slot_index: record.time_slot_id,
            week_number: iso_week(record.date),
            quantity: record.quantity_ordered,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StandardScaler {
    mean: [f64; FEATURES],
    scale: [f64; FEATURES],
}

impl StandardScaler {
    fn fit(rows: &[[f64; FEATURES]]) -> Self {
        let n = rows.len() as f64;
        let mut mean = [0.0; FEATURES];
        let mut scale = [1.0; FEATURES];

        for j in 0..FEATURES {
            mean[j] = rows.iter().map(|r| r[j]).sum::<f64>() / n;
            let variance = rows.iter().map(|r| (r[j] - mean[j]).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            // constant columns keep scale 1
            if std > f64::EPSILON {
                scale[j] = std;
            }
        }
        Self { mean, scale }
    }

    fn transform(&self, row: &[f64; FEATURES]) -> [f64; FEATURES] {
        let mut out = [0.0; FEATURES];
        for j in 0..FEATURES {
            out[j] = (row[j] - self.mean[j]) / self.scale[j];
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LinearModel {
    coef: [f64; FEATURES],
    intercept: f64,
}

impl LinearModel {
    /// Ordinary least squares on centred inputs, minimum-norm when columns are collinear.
    fn fit(x: &[[f64; FEATURES]], y: &[f64]) -> Self {
        let n = x.len() as f64;
        let y_mean = y.iter().sum::<f64>() / n;
        let mut x_mean = [0.0; FEATURES];
        for j in 0..FEATURES {
            x_mean[j] = x.iter().map(|r| r[j]).sum::<f64>() / n;
        }

        // normal equations: (XᵀX) b = Xᵀy
        let mut a = [[0.0; FEATURES]; FEATURES];
        let mut c = [0.0; FEATURES];
        for (row, target) in x.iter().zip(y) {
            for i in 0..FEATURES {
                let xi = row[i] - x_mean[i];
                c[i] += xi * (target - y_mean);
                for j in 0..FEATURES {
                    a[i][j] += xi * (row[j] - x_mean[j]);
                }
            }
        }

        let coef = solve_symmetric(a, c);
        let intercept = y_mean - (0..FEATURES).map(|j| coef[j] * x_mean[j]).sum::<f64>();
        Self { coef, intercept }
    }

    fn predict(&self, row: &[f64; FEATURES]) -> f64 {
        self.intercept + (0..FEATURES).map(|j| self.coef[j] * row[j]).sum::<f64>()
    }
}

const JACOBI_SWEEPS: usize = 50;

/// Minimum-norm solution of `a · b = c` for a symmetric positive semi-definite `a`.
///
/// `a` is diagonalised with cyclic Jacobi rotations; eigen-directions whose
/// eigenvalue is negligible contribute nothing, so collinear columns share
/// their weight instead of one of them absorbing it.
fn solve_symmetric(mut a: [[f64; FEATURES]; FEATURES], c: [f64; FEATURES]) -> [f64; FEATURES] {
    let mut v = [[0.0; FEATURES]; FEATURES];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _ in 0..JACOBI_SWEEPS {
        let diag: f64 = (0..FEATURES).map(|i| a[i][i] * a[i][i]).sum();
        let off: f64 = (0..FEATURES)
            .flat_map(|i| (0..FEATURES).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        if off <= 1e-30 * diag.max(f64::MIN_POSITIVE) {
            break;
        }

        for p in 0..FEATURES {
            for q in (p + 1)..FEATURES {
                if a[p][q] == 0.0 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let cos = 1.0 / (t * t + 1.0).sqrt();
                let sin = t * cos;

                for k in 0..FEATURES {
                    let (kp, kq) = (a[k][p], a[k][q]);
                    a[k][p] = cos * kp - sin * kq;
                    a[k][q] = sin * kp + cos * kq;
                }
                for k in 0..FEATURES {
                    let (pk, qk) = (a[p][k], a[q][k]);
                    a[p][k] = cos * pk - sin * qk;
                    a[q][k] = sin * pk + cos * qk;
                }
                for row in v.iter_mut() {
                    let (kp, kq) = (row[p], row[q]);
                    row[p] = cos * kp - sin * kq;
                    row[q] = sin * kp + cos * kq;
                }
            }
        }
    }

    let max_eigen = (0..FEATURES).map(|k| a[k][k].abs()).fold(0.0, f64::max);
    let tolerance = (max_eigen * 1e-10).max(f64::MIN_POSITIVE);

    let mut solution = [0.0; FEATURES];
    for k in 0..FEATURES {
        let eigenvalue = a[k][k];
        if eigenvalue <= tolerance {
            continue;
        }
        let weight = (0..FEATURES).map(|i| v[i][k] * c[i]).sum::<f64>() / eigenvalue;
        for (i, value) in solution.iter_mut().enumerate() {
            *value += weight * v[i][k];
        }
    }
    solution
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemandPredictor {
    fitted: Option<(StandardScaler, LinearModel)>,
}

impl DemandPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trained(&self) -> bool {
        self.fitted.is_some()
    }

    /// 以歷史需求訓練；資料不足時維持未訓練狀態並回傳 false
    pub fn train(&mut self, samples: &[DemandSample]) -> bool {
        if samples.len() < MIN_TRAINING_RECORDS {
            tracing::debug!(
                "Not enough demand history to train ({} < {})",
                samples.len(),
                MIN_TRAINING_RECORDS
            );
            self.fitted = None;
            return false;
        }

        let rows: Vec<[f64; FEATURES]> = samples
            .iter()
            .map(|s| features(s.day_of_week, s.slot_index, s.week_number))
            .collect();
        let targets: Vec<f64> = samples.iter().map(|s| s.quantity as f64).collect();

        let scaler = StandardScaler::fit(&rows);
        let scaled: Vec<[f64; FEATURES]> = rows.iter().map(|r| scaler.transform(r)).collect();
        let model = LinearModel::fit(&scaled, &targets);

        self.fitted = Some((scaler, model));
        true
    }

    pub fn train_on_records(&mut self, records: &[DemandRecord]) -> bool {
        let samples: Vec<DemandSample> = records.iter().map(DemandSample::from).collect();
        self.train(&samples)
    }

    /// Predicted order count, never negative.
    pub fn predict(&self, day_of_week: i64, slot_index: i64, week_number: i64) -> i64 {
        match &self.fitted {
            None => fallback_prediction(day_of_week, slot_index),
            Some((scaler, model)) => {
                let row = scaler.transform(&features(day_of_week, slot_index, week_number));
                let raw = model.predict(&row).round_ties_even();
                if raw.is_finite() {
                    (raw as i64).max(0)
                } else {
                    0
                }
            }
        }
    }

    pub fn predict_on(&self, date: NaiveDate, slot_index: i64) -> i64 {
        self.predict(day_index(date), slot_index, iso_week(date))
    }

    /// Slots ordered by predicted demand, highest first.
    pub fn peak_slots(&self, slots: &[TimeSlot], date: NaiveDate) -> Vec<SlotPrediction> {
        let mut predictions: Vec<SlotPrediction> = slots
            .iter()
            .map(|slot| {
                let predicted_demand = self.predict_on(date, slot.id);
                SlotPrediction {
                    slot: slot.clone(),
                    predicted_demand,
                    is_peak: predicted_demand > PEAK_THRESHOLD,
                }
            })
            .collect();
        predictions.sort_by(|a, b| b.predicted_demand.cmp(&a.predicted_demand));
        predictions
    }

    /// Bar-chart data: one dataset per slot (first five), one bar per weekday.
    pub fn weekly_chart(&self, slots: &[TimeSlot], week_number: i64) -> ChartData {
        let datasets = slots
            .iter()
            .take(CHART_COLORS.len())
            .enumerate()
            .map(|(i, slot)| ChartDataset {
                label: slot.to_string(),
                data: (0..7)
                    .map(|day| self.predict(day, slot.id, week_number))
                    .collect(),
                background_color: CHART_COLORS[i % CHART_COLORS.len()].to_string(),
            })
            .collect();

        ChartData {
            labels: WEEKDAY_LABELS.iter().map(|d| d.to_string()).collect(),
            datasets,
        }
    }
}

/// Rule of thumb used before enough history exists: lunch slots are
/// busiest and weekdays run 30% above weekends.
pub fn fallback_prediction(day_of_week: i64, slot_index: i64) -> i64 {
    let base: i64 = match slot_index {
        2 | 3 => 45,
        1 => 30,
        _ => 20,
    };
    if day_of_week < 5 {
        (base as f64 * 1.3) as i64
    } else {
        base
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotPrediction {
    pub slot: TimeSlot,
    pub predicted_demand: i64,
    pub is_peak: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartDataset {
    pub label: String,
    pub data: Vec<i64>,
    #[serde(rename = "backgroundColor")]
    pub background_color: String,
}

pub fn predictor_for_item(store: &Store, food_item_id: i64) -> Result<DemandPredictor> {
    let records = store.demand_records_for_item(food_item_id)?;
    let mut predictor = DemandPredictor::new();
    predictor.train_on_records(&records);
    Ok(predictor)
}

pub fn weekly_demand_chart(store: &Store, food_item_id: i64, date: NaiveDate) -> Result<ChartData> {
    store.get_food_item(food_item_id)?;
    let predictor = predictor_for_item(store, food_item_id)?;
    let slots = store.time_slots()?;
    Ok(predictor.weekly_chart(&slots, iso_week(date)))
}

/// 將指定日期的實際訂單量寫回需求紀錄（設定而非累加，可重複執行）
///
/// Rows of that date with no remaining orders drop to zero. Predictions only
/// learn from earlier dates, so re-running a date stores the same estimate.
pub fn refresh_demand_records(store: &Store, date: NaiveDate) -> Result<usize> {
    let quantities = store.item_quantities_on(date)?;
    let day = day_index(date);

    let tx = store.connection().unchecked_transaction()?;
    store.reset_demand_quantities_on(date)?;

    let mut predictors: BTreeMap<i64, DemandPredictor> = BTreeMap::new();
    for (food_item_id, slot_id, quantity) in &quantities {
        let predictor = match predictors.entry(*food_item_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut predictor = DemandPredictor::new();
                predictor.train_on_records(&store.demand_records_before(*food_item_id, date)?);
                entry.insert(predictor)
            }
        };
        let predicted = predictor.predict_on(date, *slot_id);
        store.upsert_demand_record(*food_item_id, date, *slot_id, day, *quantity, predicted)?;
    }
    tx.commit()?;

    tracing::info!(
        "📈 Refreshed {} demand record(s) for {}",
        quantities.len(),
        date
    );
    Ok(quantities.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: i64, time: &str) -> TimeSlot {
        TimeSlot {
            id,
            slot_time: time.to_string(),
            max_capacity: 50,
        }
    }

    #[test]
    fn test_fallback_rules() {
        assert_eq!(fallback_prediction(0, 2), 58);
        assert_eq!(fallback_prediction(0, 3), 58);
        assert_eq!(fallback_prediction(1, 1), 39);
        assert_eq!(fallback_prediction(2, 5), 26);
        assert_eq!(fallback_prediction(6, 2), 45);
        assert_eq!(fallback_prediction(5, 1), 30);
        assert_eq!(fallback_prediction(5, 4), 20);
    }

    #[test]
    fn test_untrained_with_few_records() {
        let mut predictor = DemandPredictor::new();
        let samples = vec![
            DemandSample {
                day_of_week: 0,
                slot_index: 1,
                week_number: 10,
                quantity: 12,
            };
            4
        ];
        assert!(!predictor.train(&samples));
        assert!(!predictor.is_trained());
        assert_eq!(predictor.predict(0, 2, 10), 58);
    }

    #[test]
    fn test_recovers_linear_relationship() {
        // quantity = 10 + 3*day + 5*slot, all in the same week
        let mut samples = Vec::new();
        for day in 0..5 {
            for slot in 1..=3 {
                samples.push(DemandSample {
                    day_of_week: day,
                    slot_index: slot,
                    week_number: 12,
                    quantity: 10 + 3 * day + 5 * slot,
                });
            }
        }

        let mut predictor = DemandPredictor::new();
        assert!(predictor.train(&samples));
        assert_eq!(predictor.predict(2, 2, 12), 26);
        assert_eq!(predictor.predict(4, 3, 12), 37);
    }

    #[test]
    fn test_collinear_columns_share_weight() {
        // column 2 repeats column 0; the others are constant
        let x: Vec<[f64; FEATURES]> = (0..7)
            .flat_map(|d| [d as f64; 2])
            .map(|d| [d, 0.0, d, 1.0, 0.0])
            .collect();
        let y: Vec<f64> = x.iter().map(|row| 2.0 * row[0] + 3.0).collect();

        let model = LinearModel::fit(&x, &y);
        assert!((model.coef[0] - 1.0).abs() < 1e-9);
        assert!((model.coef[2] - 1.0).abs() < 1e-9);
        assert!(model.coef[1].abs() < 1e-9 && model.coef[3].abs() < 1e-9);
        assert!((model.predict(&[4.0, 0.0, 4.0, 1.0, 0.0]) - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_never_negative() {
        let samples: Vec<DemandSample> = (0..5)
            .map(|day| DemandSample {
                day_of_week: day,
                slot_index: 1,
                week_number: 3,
                quantity: 40 - 10 * day,
            })
            .collect();

        let mut predictor = DemandPredictor::new();
        predictor.train(&samples);
        // extrapolates to a negative count on Sunday
        assert_eq!(predictor.predict(6, 1, 3), 0);
    }

    #[test]
    fn test_peak_slots_sorted_descending() {
        let predictor = DemandPredictor::new();
        let slots = vec![
            slot(1, "10:00-10:30"),
            slot(2, "12:00-12:30"),
            slot(5, "17:00-17:30"),
        ];
        // 2026-03-02 is a Monday
        let monday = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let peaks = predictor.peak_slots(&slots, monday);

        let order: Vec<i64> = peaks.iter().map(|p| p.slot.id).collect();
        assert_eq!(order, vec![2, 1, 5]);
        assert!(peaks[0].is_peak);
        assert!(peaks[1].is_peak);
        assert!(!peaks[2].is_peak);
    }

    #[test]
    fn test_weekly_chart_shape() {
        let predictor = DemandPredictor::new();
        let slots: Vec<TimeSlot> = (1..=6).map(|i| slot(i, "10:00-10:30")).collect();
        let chart = predictor.weekly_chart(&slots, 10);

        assert_eq!(chart.labels.len(), 7);
        assert_eq!(chart.labels[0], "Monday");
        assert_eq!(chart.datasets.len(), 5);
        assert_eq!(chart.datasets[0].data, vec![39, 39, 39, 39, 39, 30, 30]);
        assert_eq!(chart.datasets[1].data, vec![58, 58, 58, 58, 58, 45, 45]);

        let json = serde_json::to_value(&chart).unwrap();
        assert_eq!(
            json["datasets"][0]["backgroundColor"],
            "rgba(255, 99, 132, 0.8)"
        );
    }
}
