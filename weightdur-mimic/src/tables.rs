//! CSV access to MIMIC-III table exports and the derived output table.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use weightdur_core::{WeightDurations, WeightError};

use crate::{items, mimic_datetime, ChartEventRow, EchoRow, IcuStayRow, MimicExtract};

pub const ICUSTAYS_FILE: &str = "ICUSTAYS.csv";
pub const CHARTEVENTS_FILE: &str = "CHARTEVENTS.csv";
pub const ECHODATA_FILE: &str = "ECHODATA.csv";

/// Loads the tables from a directory of MIMIC-III CSV exports.
///
/// `ECHODATA.csv` is optional; without it no stay can fall back to echo weights.
pub fn load_extract_dir(dir: &Path) -> Result<MimicExtract, WeightError> {
    let icustays = read_icustays(&locate(dir, ICUSTAYS_FILE).ok_or_else(|| {
        WeightError::MissingData(format!("{ICUSTAYS_FILE} not found in {}", dir.display()))
    })?)?;
    let chartevents = read_chartevents(&locate(dir, CHARTEVENTS_FILE).ok_or_else(|| {
        WeightError::MissingData(format!("{CHARTEVENTS_FILE} not found in {}", dir.display()))
    })?)?;
    let echodata = match locate(dir, ECHODATA_FILE) {
        Some(path) => read_echodata(&path)?,
        None => {
            tracing::info!(dir = %dir.display(), "no echo export found, echo fallback disabled");
            Vec::new()
        }
    };

    Ok(MimicExtract {
        icustays,
        chartevents,
        echodata,
    })
}

pub fn read_icustays(path: &Path) -> Result<Vec<IcuStayRow>, WeightError> {
    read_rows(File::open(path)?, path)
}

pub fn read_echodata(path: &Path) -> Result<Vec<EchoRow>, WeightError> {
    read_rows(File::open(path)?, path)
}

/// Streams `CHARTEVENTS.csv`, keeping only weight items.
pub fn read_chartevents(path: &Path) -> Result<Vec<ChartEventRow>, WeightError> {
    read_weight_events(File::open(path)?, path)
}

/// Like [`read_chartevents`] over any reader; `origin` only labels errors.
pub fn read_weight_events<R: Read>(
    reader: R,
    origin: &Path,
) -> Result<Vec<ChartEventRow>, WeightError> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader
        .byte_headers()
        .map_err(|err| csv_error(origin, err))?
        .clone();
    let itemid_col = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(b"itemid"))
        .ok_or_else(|| {
            WeightError::MissingData(format!("{} has no ITEMID column", origin.display()))
        })?;

    let mut rows = Vec::new();
    let mut scanned = 0usize;
    for record in reader.byte_records() {
        let record = record.map_err(|err| csv_error(origin, err))?;
        scanned += 1;
        let itemid = record
            .get(itemid_col)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        if !itemid.is_some_and(items::is_weight_item) {
            continue;
        }
        rows.push(
            record
                .deserialize::<ChartEventRow>(Some(&headers))
                .map_err(|err| csv_error(origin, err))?,
        );
    }

    tracing::debug!(path = %origin.display(), scanned, kept = rows.len(), "read chart events");
    Ok(rows)
}

fn read_rows<T: DeserializeOwned, R: Read>(reader: R, origin: &Path) -> Result<Vec<T>, WeightError> {
    let mut reader = csv::Reader::from_reader(reader);
    let rows = reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|err| csv_error(origin, err))?;
    tracing::debug!(path = %origin.display(), rows = rows.len(), "read table");
    Ok(rows)
}

#[derive(Serialize)]
struct OutputRow {
    icustay_id: i64,
    starttime: String,
    endtime: String,
    weight: f64,
}

/// Writes the output table with MIMIC column names and timestamp format.
pub fn write_weight_durations_csv<W: Write>(
    durations: &WeightDurations,
    writer: W,
) -> Result<(), WeightError> {
    let mut writer = csv::Writer::from_writer(writer);
    for interval in durations.intervals() {
        writer
            .serialize(OutputRow {
                icustay_id: interval.stay_id,
                starttime: interval.start_time.format(mimic_datetime::FORMAT).to_string(),
                endtime: interval.end_time.format(mimic_datetime::FORMAT).to_string(),
                weight: interval.value_kg,
            })
            .map_err(|err| WeightError::Parse(err.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

fn locate(dir: &Path, name: &str) -> Option<PathBuf> {
    [name.to_string(), name.to_lowercase()]
        .into_iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.is_file())
}

fn csv_error(origin: &Path, err: csv::Error) -> WeightError {
    WeightError::Parse(format!("{}: {err}", origin.display()))
}
