use std::fmt;

use chrono::NaiveDate;
use galert_core::{DatasetId, MercatorPoint, NewObservation, SpeciesId, Wgs84Point};
use serde::Serialize;

use crate::archive::{split_fields, ColumnIndex};

pub mod columns {
    pub const GBIF_ID: &str = "gbifID";
    pub const OCCURRENCE_ID: &str = "occurrenceID";
    pub const DATASET_KEY: &str = "datasetKey";
    pub const DATASET_NAME: &str = "datasetName";
    pub const SPECIES_KEY: &str = "speciesKey";
    pub const SPECIES: &str = "species";
    pub const VERNACULAR_NAME: &str = "vernacularName";
    pub const EVENT_DATE: &str = "eventDate";
    pub const YEAR: &str = "year";
    pub const MONTH: &str = "month";
    pub const DAY: &str = "day";
    pub const LATITUDE: &str = "decimalLatitude";
    pub const LONGITUDE: &str = "decimalLongitude";
    pub const INDIVIDUAL_COUNT: &str = "individualCount";
    pub const LOCALITY: &str = "locality";
    pub const MUNICIPALITY: &str = "municipality";
    pub const BASIS_OF_RECORD: &str = "basisOfRecord";
    pub const RECORDED_BY: &str = "recordedBy";
    pub const COORDINATE_UNCERTAINTY: &str = "coordinateUncertaintyInMeters";
    pub const REFERENCES: &str = "references";

    /// Columns a row cannot be loaded without.
    pub const REQUIRED: [&str; 3] = [SPECIES_KEY, DATASET_KEY, EVENT_DATE];
}

/// Column widths of `observation.gbif_id` and `source_dataset_key`.
pub const GBIF_ID_MAX_CHARS: usize = 100;
pub const DATASET_KEY_MAX_CHARS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingSpeciesKey,
    InvalidSpeciesKey,
    MissingDate,
    MissingDatasetKey,
    OverlongIdentifier,
    NulByte,
    UnresolvedReference,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingSpeciesKey => "missing_species_key",
            Self::InvalidSpeciesKey => "invalid_species_key",
            Self::MissingDate => "missing_date",
            Self::MissingDatasetKey => "missing_dataset_key",
            Self::OverlongIdentifier => "overlong_identifier",
            Self::NulByte => "nul_byte",
            Self::UnresolvedReference => "unresolved_reference",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub reason: SkipReason,
    pub gbif_id: String,
}

/// One archive row with its required fields validated and its coordinates
/// already in the storage projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub gbif_id: String,
    pub occurrence_id: String,
    pub species_key: i64,
    pub species_name: String,
    pub vernacular_name: String,
    pub dataset_key: String,
    pub dataset_name: String,
    pub date: NaiveDate,
    pub location: Option<MercatorPoint>,
    pub individual_count: Option<i32>,
    pub locality: String,
    pub municipality: String,
    pub basis_of_record: String,
    pub recorded_by: String,
    pub coordinate_uncertainty_in_meters: Option<f64>,
    pub references: String,
}

impl ParsedRow {
    /// The only place the dataset key is copied onto an observation.
    pub fn into_observation(self, species_id: SpeciesId, dataset_id: DatasetId) -> NewObservation {
        NewObservation {
            gbif_id: self.gbif_id,
            occurrence_id: self.occurrence_id,
            species_id,
            source_dataset_id: dataset_id,
            source_dataset_key: self.dataset_key,
            location: self.location,
            date: self.date,
            individual_count: self.individual_count,
            locality: self.locality,
            municipality: self.municipality,
            basis_of_record: self.basis_of_record,
            recorded_by: self.recorded_by,
            coordinate_uncertainty_in_meters: self.coordinate_uncertainty_in_meters,
            references: self.references,
        }
    }
}

/// Rows Postgres would reject (NUL bytes, identifiers wider than their
/// columns) are skipped here so one bad line cannot abort the import.
pub fn parse_row(columns: &ColumnIndex, line: &str) -> Result<ParsedRow, SkippedRow> {
    use columns::*;

    if line.contains('\0') {
        let cleaned = line.replace('\0', "");
        let fields: Vec<&str> = split_fields(&cleaned).collect();
        return Err(SkippedRow {
            reason: SkipReason::NulByte,
            gbif_id: columns.get(&fields, GBIF_ID).trim().to_string(),
        });
    }

    let fields: Vec<&str> = split_fields(line).collect();
    let get = |name: &str| columns.get(&fields, name).trim();
    let gbif_id = get(GBIF_ID).to_string();
    let skip = |reason| SkippedRow {
        reason,
        gbif_id: gbif_id.clone(),
    };

    if gbif_id.chars().count() > GBIF_ID_MAX_CHARS {
        return Err(SkippedRow {
            reason: SkipReason::OverlongIdentifier,
            gbif_id: gbif_id.chars().take(GBIF_ID_MAX_CHARS).collect(),
        });
    }

    let species_key = get(SPECIES_KEY);
    if species_key.is_empty() {
        return Err(skip(SkipReason::MissingSpeciesKey));
    }
    let species_key: i64 = species_key
        .parse()
        .map_err(|_| skip(SkipReason::InvalidSpeciesKey))?;

    let date = parse_date(get(EVENT_DATE), get(YEAR), get(MONTH), get(DAY))
        .ok_or_else(|| skip(SkipReason::MissingDate))?;

    let dataset_key = get(DATASET_KEY);
    if dataset_key.is_empty() {
        return Err(skip(SkipReason::MissingDatasetKey));
    }
    if dataset_key.chars().count() > DATASET_KEY_MAX_CHARS {
        return Err(skip(SkipReason::OverlongIdentifier));
    }

    Ok(ParsedRow {
        occurrence_id: get(OCCURRENCE_ID).to_string(),
        species_key,
        species_name: get(SPECIES).to_string(),
        vernacular_name: get(VERNACULAR_NAME).to_string(),
        dataset_key: dataset_key.to_string(),
        dataset_name: get(DATASET_NAME).to_string(),
        date,
        location: parse_location(get(LATITUDE), get(LONGITUDE)),
        individual_count: get(INDIVIDUAL_COUNT).parse().ok(),
        locality: get(LOCALITY).to_string(),
        municipality: get(MUNICIPALITY).to_string(),
        basis_of_record: get(BASIS_OF_RECORD).to_string(),
        recorded_by: get(RECORDED_BY).to_string(),
        coordinate_uncertainty_in_meters: get(COORDINATE_UNCERTAINTY).parse().ok(),
        references: get(REFERENCES).to_string(),
        gbif_id,
    })
}

/// `eventDate` first (first half of a range, time part ignored), then the
/// separate year/month/day columns.
pub fn parse_date(event_date: &str, year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let event_date = event_date.trim();
    if !event_date.is_empty() {
        let first = event_date.split('/').next().unwrap_or_default();
        let first = first.split('T').next().unwrap_or_default();
        let parts: Vec<&str> = first.split('-').collect();
        if parts.len() >= 3 {
            if let (Ok(y), Ok(m), Ok(d)) = (
                parts[0].trim().parse::<i32>(),
                parts[1].trim().parse::<u32>(),
                parts[2].trim().parse::<u32>(),
            ) {
                if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                    return Some(date);
                }
            }
        }
    }

    let y = year.trim().parse::<i32>().ok()?;
    let m = month.trim().parse::<u32>().ok()?;
    let d = day.trim().parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(y, m, d)
}

pub fn parse_location(lat: &str, lon: &str) -> Option<MercatorPoint> {
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    Wgs84Point::new(lat, lon).to_web_mercator().ok()
}
