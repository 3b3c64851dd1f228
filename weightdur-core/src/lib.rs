//! Core types and reconciliation stages for per-stay weight durations.
//!
//! Normalized point observations go in, non-overlapping weight intervals per
//! ICU stay come out. Source specific parsing lives in adapter crates.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// ICU stay identifier (`icustay_id`).
pub type StayId = i64;
/// Hospital admission identifier (`hadm_id`), used to link secondary sources.
pub type EncounterId = i64;

/// Upper bound for `fuzziness_hours` (one week).
pub const MAX_FUZZINESS_HOURS: u32 = 168;

/// Settings for the reconciliation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Padding (hours) added around stay boundaries to absorb charting skew.
    pub fuzziness_hours: u32,
    /// How echo-derived weights cover stays without charted weights.
    pub echo_strategy: EchoStrategy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fuzziness_hours: 2,
            echo_strategy: EchoStrategy::Sequential,
        }
    }
}

impl ReconcileConfig {
    /// The fuzziness margin as a duration.
    pub fn margin(&self) -> Duration {
        Duration::hours(i64::from(self.fuzziness_hours))
    }

    /// Accepts margins of 1 to [`MAX_FUZZINESS_HOURS`] hours.
    ///
    /// A zero margin could yield empty trailing intervals; very large ones
    /// overflow timestamp arithmetic.
    pub fn validate(&self) -> Result<(), WeightError> {
        if !(1..=MAX_FUZZINESS_HOURS).contains(&self.fuzziness_hours) {
            return Err(WeightError::InvalidConfig(format!(
                "fuzziness_hours must be between 1 and {MAX_FUZZINESS_HOURS}, got {}",
                self.fuzziness_hours
            )));
        }
        Ok(())
    }
}

/// Coverage strategy for stays that only have echo weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EchoStrategy {
    /// One interval per echo report, chained like charted weights.
    #[default]
    Sequential,
    /// A single interval spanning the stay with the median echo weight.
    Median,
}

/// One ICU admission episode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stay {
    pub stay_id: StayId,
    pub encounter_id: EncounterId,
    pub intime: NaiveDateTime,
    pub outtime: NaiveDateTime,
}

/// Whether a reading is an admission weight or a later measurement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WeightType {
    Admit,
    Daily,
}

/// Which raw stream an observation was derived from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceClass {
    Chart,
    Neonatal,
    BirthWeight,
    Echo,
}

impl SourceClass {
    /// Primary sources win over echo whenever a stay has any of them.
    pub fn is_primary(self) -> bool {
        !matches!(self, SourceClass::Echo)
    }
}

/// A normalized point-in-time weight reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub stay_id: StayId,
    pub charttime: NaiveDateTime,
    pub value_kg: f64,
    pub weight_type: WeightType,
    pub source_class: SourceClass,
}

impl Observation {
    /// Builds an observation, rejecting non-positive or non-finite weights.
    pub fn new(
        stay_id: StayId,
        charttime: NaiveDateTime,
        value_kg: f64,
        weight_type: WeightType,
        source_class: SourceClass,
    ) -> Result<Self, WeightError> {
        if !value_kg.is_finite() || value_kg <= 0.0 {
            return Err(WeightError::InvalidWeight(value_kg));
        }
        Ok(Self {
            stay_id,
            charttime,
            value_kg,
            weight_type,
            source_class,
        })
    }
}

/// Half-open `[start_time, end_time)` span carrying one weight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WeightInterval {
    pub stay_id: StayId,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub value_kg: f64,
}

impl WeightInterval {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start_time <= at && at < self.end_time
    }
}

/// Errors raised while loading or preparing inputs.
///
/// Data-quality problems in individual records are not errors; those rows are
/// dropped during normalization.
#[derive(Debug, thiserror::Error)]
pub enum WeightError {
    #[error("input is missing required data: {0}")]
    MissingData(String),
    #[error("could not parse input: {0}")]
    Parse(String),
    #[error("weight must be a positive number of kilograms, got {0}")]
    InvalidWeight(f64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observations of one stay, split by source priority.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StayObservations {
    pub primary: Vec<Observation>,
    pub secondary: Vec<Observation>,
}

impl StayObservations {
    pub fn push(&mut self, observation: Observation) {
        if observation.source_class.is_primary() {
            self.primary.push(observation);
        } else {
            self.secondary.push(observation);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    start: NaiveDateTime,
    value_kg: f64,
}

/// Turns one stay's primary observations into consecutive intervals.
///
/// Admit and daily readings share one timeline: each interval ends where the
/// next reading starts, and the last one runs to `max(outtime, start) +
/// margin`. An admit reading that is the first observation of the stay is
/// pulled back to `intime - margin`, or keeps its charttime when that is
/// already earlier. When two readings land on
/// the same start the later one in `(charttime, weight_type)` order wins, so
/// a daily weight overrides an admit weight charted at the same instant.
pub fn build_intervals(
    stay: &Stay,
    observations: &[Observation],
    margin: Duration,
) -> Vec<WeightInterval> {
    let mut ordered: Vec<&Observation> = observations.iter().collect();
    ordered.sort_by(|a, b| {
        a.charttime
            .cmp(&b.charttime)
            .then(a.weight_type.cmp(&b.weight_type))
    });

    let anchors: Vec<Anchor> = ordered
        .iter()
        .enumerate()
        .map(|(idx, obs)| {
            let start = if idx == 0 && obs.weight_type == WeightType::Admit {
                obs.charttime.min(stay.intime - margin)
            } else {
                obs.charttime
            };
            Anchor {
                start,
                value_kg: obs.value_kg,
            }
        })
        .collect();

    chain(stay, &keep_last_per_start(anchors), margin)
}

/// Fills a leading gap when the first interval starts after `intime`.
///
/// The synthesized interval runs from `intime - margin` to the first start
/// and repeats the first known weight. Existing coverage is never changed and
/// nothing happens for an empty interval set.
pub fn backfill_leading_gap(stay: &Stay, intervals: &mut Vec<WeightInterval>, margin: Duration) {
    prepend_backfill(stay, intervals, stay.intime, margin);
}

/// Echo-derived coverage for a stay without any primary interval.
pub fn fallback_intervals(
    stay: &Stay,
    echoes: &[Observation],
    config: &ReconcileConfig,
) -> Vec<WeightInterval> {
    let margin = config.margin();
    match config.echo_strategy {
        EchoStrategy::Sequential => {
            let mut anchors: Vec<Anchor> = echoes
                .iter()
                .map(|obs| Anchor {
                    start: obs.charttime,
                    value_kg: obs.value_kg,
                })
                .collect();
            anchors.sort_by_key(|anchor| anchor.start);

            let mut intervals = chain(stay, &keep_last_per_start(anchors), margin);
            prepend_backfill(stay, &mut intervals, stay.intime - margin, margin);
            intervals
        }
        EchoStrategy::Median => {
            let Some(value_kg) = median(echoes.iter().map(|obs| obs.value_kg).collect()) else {
                return Vec::new();
            };
            checked_interval(
                stay.stay_id,
                stay.intime - margin,
                stay.outtime.max(stay.intime) + margin,
                value_kg,
            )
            .into_iter()
            .collect()
        }
    }
}

/// Primary intervals with the leading gap filled.
pub fn charted_intervals(
    stay: &Stay,
    observations: &[Observation],
    margin: Duration,
) -> Vec<WeightInterval> {
    let mut intervals = build_intervals(stay, observations, margin);
    backfill_leading_gap(stay, &mut intervals, margin);
    intervals
}

/// Reconciles a single stay: primary coverage if any, echo fallback otherwise.
pub fn reconcile_stay(
    stay: &Stay,
    observations: &StayObservations,
    config: &ReconcileConfig,
) -> Vec<WeightInterval> {
    if observations.primary.is_empty() {
        fallback_intervals(stay, &observations.secondary, config)
    } else {
        charted_intervals(stay, &observations.primary, config.margin())
    }
}

/// Runs the full pipeline over a stay registry and normalized observations.
///
/// Observations for stays missing from the registry are ignored. When the
/// registry lists a stay twice the first entry is used. Fails only when the
/// configuration does not validate.
pub fn reconcile<I>(
    stays: &[Stay],
    observations: I,
    config: &ReconcileConfig,
) -> Result<WeightDurations, WeightError>
where
    I: IntoIterator<Item = Observation>,
{
    config.validate()?;

    let mut registry: BTreeMap<StayId, &Stay> = BTreeMap::new();
    for stay in stays {
        registry.entry(stay.stay_id).or_insert(stay);
    }

    let mut grouped: BTreeMap<StayId, StayObservations> = BTreeMap::new();
    let mut unlinked = 0usize;
    for observation in observations {
        if !registry.contains_key(&observation.stay_id) {
            unlinked += 1;
            continue;
        }
        grouped.entry(observation.stay_id).or_default().push(observation);
    }

    let work: Vec<(&Stay, StayObservations)> = grouped
        .into_iter()
        .filter_map(|(stay_id, observations)| {
            registry.get(&stay_id).map(|stay| (*stay, observations))
        })
        .collect();

    // Stays with primary coverage never reach the fallback path.
    let (charted, uncharted): (Vec<_>, Vec<_>) = work
        .into_iter()
        .partition(|(_, observations)| !observations.primary.is_empty());

    let margin = config.margin();
    let mut intervals = map_stays(&charted, |stay, observations| {
        charted_intervals(stay, &observations.primary, margin)
    });
    intervals.extend(map_stays(&uncharted, |stay, observations| {
        fallback_intervals(stay, &observations.secondary, config)
    }));

    tracing::debug!(
        registry = registry.len(),
        charted = charted.len(),
        fallback = uncharted.len(),
        unlinked,
        intervals = intervals.len(),
        "reconciled weight durations"
    );

    Ok(WeightDurations::new(intervals))
}

fn map_stays<F>(work: &[(&Stay, StayObservations)], f: F) -> Vec<WeightInterval>
where
    F: Fn(&Stay, &StayObservations) -> Vec<WeightInterval> + Sync + Send,
{
    #[cfg(feature = "rayon")]
    {
        work.par_iter()
            .flat_map_iter(|entry| f(entry.0, &entry.1))
            .collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        work.iter()
            .flat_map(|entry| f(entry.0, &entry.1))
            .collect()
    }
}

/// Median of the given values, `None` when empty.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

fn keep_last_per_start(anchors: Vec<Anchor>) -> Vec<Anchor> {
    let mut kept: Vec<Anchor> = Vec::with_capacity(anchors.len());
    for anchor in anchors {
        match kept.last_mut() {
            Some(last) if last.start == anchor.start => *last = anchor,
            _ => kept.push(anchor),
        }
    }
    kept
}

fn chain(stay: &Stay, anchors: &[Anchor], margin: Duration) -> Vec<WeightInterval> {
    anchors
        .iter()
        .enumerate()
        .filter_map(|(idx, anchor)| {
            let end_time = match anchors.get(idx + 1) {
                Some(next) => next.start,
                None => anchor.start.max(stay.outtime) + margin,
            };
            checked_interval(stay.stay_id, anchor.start, end_time, anchor.value_kg)
        })
        .collect()
}

fn prepend_backfill(
    stay: &Stay,
    intervals: &mut Vec<WeightInterval>,
    threshold: NaiveDateTime,
    margin: Duration,
) {
    let Some(first) = intervals.iter().min_by_key(|interval| interval.start_time).copied() else {
        return;
    };
    if first.start_time <= threshold {
        return;
    }
    if let Some(fill) = checked_interval(
        stay.stay_id,
        stay.intime - margin,
        first.start_time,
        first.value_kg,
    ) {
        intervals.push(fill);
        intervals.sort_by_key(|interval| interval.start_time);
    }
}

fn checked_interval(
    stay_id: StayId,
    start_time: NaiveDateTime,
    end_time: NaiveDateTime,
    value_kg: f64,
) -> Option<WeightInterval> {
    debug_assert!(
        start_time < end_time,
        "empty or inverted interval for stay {stay_id}: {start_time} .. {end_time}"
    );
    if start_time < end_time {
        Some(WeightInterval {
            stay_id,
            start_time,
            end_time,
            value_kg,
        })
    } else {
        tracing::warn!(stay_id, %start_time, %end_time, "dropping empty or inverted interval");
        None
    }
}

/// The assembled output: intervals ordered by `(stay_id, start_time, end_time)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "Vec<WeightInterval>", into = "Vec<WeightInterval>")]
pub struct WeightDurations {
    intervals: Vec<WeightInterval>,
}

impl WeightDurations {
    pub fn new(mut intervals: Vec<WeightInterval>) -> Self {
        intervals.sort_by(|a, b| {
            (a.stay_id, a.start_time, a.end_time)
                .cmp(&(b.stay_id, b.start_time, b.end_time))
                .then(a.value_kg.total_cmp(&b.value_kg))
        });
        Self { intervals }
    }

    pub fn intervals(&self) -> &[WeightInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Distinct stays with coverage, ascending.
    pub fn stay_ids(&self) -> Vec<StayId> {
        let mut ids: Vec<StayId> = self.intervals.iter().map(|i| i.stay_id).collect();
        ids.dedup();
        ids
    }

    /// All intervals of one stay, in start order.
    pub fn for_stay(&self, stay_id: StayId) -> &[WeightInterval] {
        let lo = self.intervals.partition_point(|i| i.stay_id < stay_id);
        let hi = self.intervals.partition_point(|i| i.stay_id <= stay_id);
        &self.intervals[lo..hi]
    }

    /// Weight in effect for a stay at the given instant.
    pub fn weight_at(&self, stay_id: StayId, at: NaiveDateTime) -> Option<f64> {
        let stay = self.for_stay(stay_id);
        let idx = stay.partition_point(|i| i.start_time <= at);
        let candidate = stay.get(idx.checked_sub(1)?)?;
        candidate.contains(at).then_some(candidate.value_kg)
    }

    /// Intervals of a stay intersecting `[from, to)`.
    pub fn overlapping(
        &self,
        stay_id: StayId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> impl Iterator<Item = &WeightInterval> + '_ {
        self.for_stay(stay_id)
            .iter()
            .filter(move |i| i.start_time < to && from < i.end_time)
    }
}

impl From<Vec<WeightInterval>> for WeightDurations {
    fn from(intervals: Vec<WeightInterval>) -> Self {
        Self::new(intervals)
    }
}

impl From<WeightDurations> for Vec<WeightInterval> {
    fn from(durations: WeightDurations) -> Self {
        durations.intervals
    }
}
