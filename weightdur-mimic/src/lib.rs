//! MIMIC-III rows to `WeightDurations`.
//!
//! Raw `icustays`, `chartevents` and `echodata` rows are normalized into
//! weight observations, collapsed to one reading per stay, instant and weight
//! type, then handed to the reconciliation pipeline in `weightdur-core`.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;
use weightdur_core::{
    reconcile, EncounterId, Observation, ReconcileConfig, SourceClass, Stay, StayId, WeightDurations,
    WeightError, WeightType,
};

pub mod tables;

/// Pounds to kilograms for neonatal scale readings.
pub const LB_TO_KG: f64 = 0.45359237;
/// Ounces to kilograms for neonatal scale readings.
pub const OZ_TO_KG: f64 = 0.0283495231;
/// Pounds to kilograms as applied to echo report weights.
pub const ECHO_LB_TO_KG: f64 = 0.453592;

/// `chartevents.itemid` codes carrying weights.
pub mod items {
    pub const ADMIT_WT_CAREVUE: i64 = 762;
    pub const ADMIT_WT_METAVISION: i64 = 226512;
    pub const DAILY_WT_CAREVUE: i64 = 763;
    pub const DAILY_WT_METAVISION: i64 = 224639;
    pub const NEONATE_WT_KG: i64 = 3580;
    pub const NEONATE_WT_LB: i64 = 3581;
    pub const NEONATE_WT_OZ: i64 = 3582;
    pub const BIRTH_WT_TEXT: i64 = 4183;
    pub const BIRTH_WT_NUMERIC: i64 = 3723;

    pub const ALL: [i64; 9] = [
        ADMIT_WT_CAREVUE,
        ADMIT_WT_METAVISION,
        DAILY_WT_CAREVUE,
        DAILY_WT_METAVISION,
        NEONATE_WT_KG,
        NEONATE_WT_LB,
        NEONATE_WT_OZ,
        BIRTH_WT_TEXT,
        BIRTH_WT_NUMERIC,
    ];

    pub fn is_weight_item(itemid: i64) -> bool {
        ALL.contains(&itemid)
    }
}

/// One `icustays` row.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IcuStayRow {
    #[serde(alias = "ICUSTAY_ID")]
    pub icustay_id: StayId,
    #[serde(alias = "HADM_ID")]
    pub hadm_id: EncounterId,
    #[serde(alias = "INTIME", deserialize_with = "mimic_datetime::deserialize")]
    pub intime: NaiveDateTime,
    #[serde(
        alias = "OUTTIME",
        default,
        deserialize_with = "mimic_datetime::deserialize_option"
    )]
    pub outtime: Option<NaiveDateTime>,
}

/// One `chartevents` row, limited to the columns weights need.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChartEventRow {
    #[serde(alias = "ICUSTAY_ID", default)]
    pub icustay_id: Option<StayId>,
    #[serde(alias = "ITEMID")]
    pub itemid: i64,
    #[serde(alias = "CHARTTIME", deserialize_with = "mimic_datetime::deserialize")]
    pub charttime: NaiveDateTime,
    #[serde(alias = "VALUE", default)]
    pub value: Option<String>,
    #[serde(alias = "VALUENUM", default)]
    pub valuenum: Option<f64>,
    #[serde(alias = "ERROR", default)]
    pub error: Option<i64>,
}

/// One `echodata` row; `weight` is in pounds.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EchoRow {
    #[serde(alias = "HADM_ID")]
    pub hadm_id: EncounterId,
    #[serde(
        alias = "CHARTTIME",
        default,
        deserialize_with = "mimic_datetime::deserialize_option"
    )]
    pub charttime: Option<NaiveDateTime>,
    #[serde(alias = "WEIGHT", default)]
    pub weight: Option<f64>,
}

/// The tables the pipeline reads, as one JSON document or CSV directory.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct MimicExtract {
    #[serde(default)]
    pub icustays: Vec<IcuStayRow>,
    #[serde(default)]
    pub chartevents: Vec<ChartEventRow>,
    #[serde(default)]
    pub echodata: Vec<EchoRow>,
}

/// Derive weight durations from a JSON extract string.
pub fn derive_weight_durations_str(
    extract_json: &str,
    config: &ReconcileConfig,
) -> Result<WeightDurations, WeightError> {
    let extract: MimicExtract =
        serde_json::from_str(extract_json).map_err(|err| WeightError::Parse(err.to_string()))?;
    derive_weight_durations(&extract, config)
}

/// Derive weight durations from a `serde_json::Value` extract.
pub fn derive_weight_durations_value(
    extract: &Value,
    config: &ReconcileConfig,
) -> Result<WeightDurations, WeightError> {
    if !extract.is_object() {
        return Err(WeightError::MissingData(
            "extract must be an object with icustays/chartevents/echodata".to_string(),
        ));
    }
    let extract =
        MimicExtract::deserialize(extract).map_err(|err| WeightError::Parse(err.to_string()))?;
    derive_weight_durations(&extract, config)
}

/// Runs normalization, deduplication and reconciliation over an extract.
pub fn derive_weight_durations(
    extract: &MimicExtract,
    config: &ReconcileConfig,
) -> Result<WeightDurations, WeightError> {
    let stays = stay_registry(&extract.icustays);
    let mut records = normalize_chart_events(&extract.chartevents);
    records.extend(normalize_echo(&extract.echodata, &stays));
    let observations = collapse_duplicates(records);

    reconcile(&stays, observations, config)
}

/// Builds the stay registry, skipping stays without a usable discharge time.
pub fn stay_registry(rows: &[IcuStayRow]) -> Vec<Stay> {
    let mut skipped = 0usize;
    let stays: Vec<Stay> = rows
        .iter()
        .filter_map(|row| {
            let outtime = row.outtime.filter(|outtime| *outtime >= row.intime);
            if outtime.is_none() {
                skipped += 1;
            }
            Some(Stay {
                stay_id: row.icustay_id,
                encounter_id: row.hadm_id,
                intime: row.intime,
                outtime: outtime?,
            })
        })
        .collect();

    tracing::debug!(stays = stays.len(), skipped, "built stay registry");
    stays
}

/// Input stream a normalized record came from, in collapse precedence order.
///
/// Within one `(stay, charttime, weight_type)` group the smallest channel wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    AdmitCareVue,
    AdmitMetaVision,
    BirthWeightText,
    BirthWeightNumeric,
    DailyCareVue,
    DailyMetaVision,
    NeonatalScale,
    Echo,
}

impl Channel {
    pub fn from_itemid(itemid: i64) -> Option<Self> {
        match itemid {
            items::ADMIT_WT_CAREVUE => Some(Channel::AdmitCareVue),
            items::ADMIT_WT_METAVISION => Some(Channel::AdmitMetaVision),
            items::BIRTH_WT_TEXT => Some(Channel::BirthWeightText),
            items::BIRTH_WT_NUMERIC => Some(Channel::BirthWeightNumeric),
            items::DAILY_WT_CAREVUE => Some(Channel::DailyCareVue),
            items::DAILY_WT_METAVISION => Some(Channel::DailyMetaVision),
            items::NEONATE_WT_KG | items::NEONATE_WT_LB | items::NEONATE_WT_OZ => {
                Some(Channel::NeonatalScale)
            }
            _ => None,
        }
    }

    pub fn weight_type(self) -> WeightType {
        match self {
            Channel::AdmitCareVue
            | Channel::AdmitMetaVision
            | Channel::BirthWeightText
            | Channel::BirthWeightNumeric => WeightType::Admit,
            Channel::DailyCareVue
            | Channel::DailyMetaVision
            | Channel::NeonatalScale
            | Channel::Echo => WeightType::Daily,
        }
    }

    pub fn source_class(self) -> SourceClass {
        match self {
            Channel::AdmitCareVue
            | Channel::AdmitMetaVision
            | Channel::DailyCareVue
            | Channel::DailyMetaVision => SourceClass::Chart,
            Channel::BirthWeightText | Channel::BirthWeightNumeric => SourceClass::BirthWeight,
            Channel::NeonatalScale => SourceClass::Neonatal,
            Channel::Echo => SourceClass::Echo,
        }
    }
}

/// A validated weight reading tagged with its channel, before collapsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRecord {
    pub stay_id: StayId,
    pub charttime: NaiveDateTime,
    pub value_kg: f64,
    pub channel: Channel,
}

/// Why a free-text birth weight was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BirthWeightRejection {
    /// Contains characters other than digits and `.`, or is not a number.
    NonNumeric,
    /// Between 10 and 100: neither plausible grams nor plausible kilograms.
    Ambiguous,
    NonPositive,
}

/// Reads a free-text birth weight as kilograms.
///
/// Values above 100 are grams, values below 10 are already kilograms.
pub fn parse_birth_weight(text: &str) -> Result<f64, BirthWeightRejection> {
    if text.is_empty() || text.chars().any(|c| !(c.is_ascii_digit() || c == '.')) {
        return Err(BirthWeightRejection::NonNumeric);
    }
    let value: f64 = text
        .parse()
        .map_err(|_| BirthWeightRejection::NonNumeric)?;

    let kg = if value > 100.0 {
        value / 1000.0
    } else if value < 10.0 {
        value
    } else {
        return Err(BirthWeightRejection::Ambiguous);
    };

    if kg > 0.0 {
        Ok(kg)
    } else {
        Err(BirthWeightRejection::NonPositive)
    }
}

/// Neonatal scale channels charted at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScaleReading {
    pub kg: Option<f64>,
    pub lb: Option<f64>,
    pub oz: Option<f64>,
}

impl ScaleReading {
    fn record(&mut self, itemid: i64, value: f64) {
        let slot = match itemid {
            items::NEONATE_WT_KG => &mut self.kg,
            items::NEONATE_WT_LB => &mut self.lb,
            items::NEONATE_WT_OZ => &mut self.oz,
            _ => return,
        };
        *slot = Some(slot.map_or(value, |current| current.max(value)));
    }

    /// Kilograms when charted directly, else pounds plus ounces when both exist.
    pub fn kilograms(&self) -> Option<f64> {
        if let Some(kg) = self.kg {
            return Some(kg);
        }
        match (self.lb, self.oz) {
            (Some(lb), Some(oz)) => Some(lb * LB_TO_KG + oz * OZ_TO_KG),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct DropCounts {
    unlinked: usize,
    flagged: usize,
    invalid: usize,
    non_numeric: usize,
    ambiguous: usize,
    incomplete_scale: usize,
}

/// Normalizes weight-related chart events; everything else is ignored.
///
/// Rows without a stay, rows flagged as errors and implausible values are
/// dropped without error.
pub fn normalize_chart_events(events: &[ChartEventRow]) -> Vec<NormalizedRecord> {
    let mut drops = DropCounts::default();
    let mut records = Vec::new();
    let mut scales: BTreeMap<(StayId, NaiveDateTime), ScaleReading> = BTreeMap::new();

    for event in events {
        let Some(channel) = Channel::from_itemid(event.itemid) else {
            continue;
        };
        let Some(stay_id) = event.icustay_id else {
            drops.unlinked += 1;
            continue;
        };
        if event.error.unwrap_or(0) != 0 {
            drops.flagged += 1;
            continue;
        }

        let value_kg = match channel {
            Channel::NeonatalScale => {
                match event.valuenum.filter(|v| *v > 0.0) {
                    Some(value) => scales
                        .entry((stay_id, event.charttime))
                        .or_default()
                        .record(event.itemid, value),
                    None => drops.invalid += 1,
                }
                continue;
            }
            Channel::BirthWeightText => {
                match parse_birth_weight(event.value.as_deref().unwrap_or_default()) {
                    Ok(kg) => Some(kg),
                    Err(BirthWeightRejection::Ambiguous) => {
                        drops.ambiguous += 1;
                        continue;
                    }
                    Err(BirthWeightRejection::NonNumeric) => {
                        drops.non_numeric += 1;
                        continue;
                    }
                    Err(BirthWeightRejection::NonPositive) => None,
                }
            }
            Channel::BirthWeightNumeric => event.valuenum.filter(|v| *v > 0.0 && *v < 10.0),
            _ => event.valuenum.filter(|v| *v > 0.0),
        };

        match value_kg {
            Some(value_kg) => records.push(NormalizedRecord {
                stay_id,
                charttime: event.charttime,
                value_kg,
                channel,
            }),
            None => drops.invalid += 1,
        }
    }

    for ((stay_id, charttime), reading) in scales {
        match reading.kilograms() {
            Some(value_kg) => records.push(NormalizedRecord {
                stay_id,
                charttime,
                value_kg,
                channel: Channel::NeonatalScale,
            }),
            None => drops.incomplete_scale += 1,
        }
    }

    tracing::debug!(
        accepted = records.len(),
        unlinked = drops.unlinked,
        flagged = drops.flagged,
        invalid = drops.invalid,
        non_numeric = drops.non_numeric,
        ambiguous = drops.ambiguous,
        incomplete_scale = drops.incomplete_scale,
        "normalized chart weights"
    );
    records
}

/// Converts echo report weights and links them to every stay of the admission.
pub fn normalize_echo(rows: &[EchoRow], stays: &[Stay]) -> Vec<NormalizedRecord> {
    let mut by_encounter: HashMap<EncounterId, Vec<StayId>> = HashMap::new();
    for stay in stays {
        by_encounter
            .entry(stay.encounter_id)
            .or_default()
            .push(stay.stay_id);
    }

    let mut records = Vec::new();
    let mut dropped = 0usize;
    for row in rows {
        let (Some(charttime), Some(pounds)) = (row.charttime, row.weight.filter(|w| *w > 0.0))
        else {
            dropped += 1;
            continue;
        };
        let Some(stay_ids) = by_encounter.get(&row.hadm_id) else {
            dropped += 1;
            continue;
        };
        records.extend(stay_ids.iter().map(|stay_id| NormalizedRecord {
            stay_id: *stay_id,
            charttime,
            value_kg: pounds * ECHO_LB_TO_KG,
            channel: Channel::Echo,
        }));
    }

    tracing::debug!(accepted = records.len(), dropped, "normalized echo weights");
    records
}

/// Keeps one observation per `(stay, charttime, weight_type)` and source priority.
///
/// The highest-precedence channel wins; within a channel the largest value wins.
pub fn collapse_duplicates(mut records: Vec<NormalizedRecord>) -> Vec<Observation> {
    let key = |r: &NormalizedRecord| {
        (
            r.stay_id,
            r.charttime,
            r.channel.weight_type(),
            r.channel.source_class().is_primary(),
        )
    };
    records.sort_by(|a, b| {
        key(a)
            .cmp(&key(b))
            .then(a.channel.cmp(&b.channel))
            .then(b.value_kg.total_cmp(&a.value_kg))
    });
    let before = records.len();
    records.dedup_by(|later, first| key(later) == key(first));

    tracing::debug!(kept = records.len(), collapsed = before - records.len(), "collapsed duplicate weights");

    records
        .into_iter()
        .filter_map(|r| {
            Observation::new(
                r.stay_id,
                r.charttime,
                r.value_kg,
                r.channel.weight_type(),
                r.channel.source_class(),
            )
            .ok()
        })
        .collect()
}

/// Timestamp parsing for MIMIC exports (`YYYY-MM-DD HH:MM:SS` or ISO `T` form).
pub mod mimic_datetime {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer};

    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];

    /// Output format matching the MIMIC exports.
    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn parse(value: &str) -> Option<NaiveDateTime> {
        let value = value.trim();
        FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("unrecognized timestamp {raw:?}")))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.trim().is_empty() => parse(&raw)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp {raw:?}"))),
            _ => Ok(None),
        }
    }
}
