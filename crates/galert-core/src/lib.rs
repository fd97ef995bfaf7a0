//! Core domain model for observation alerts: dimensions, observations, alert
//! subscriptions and their unseen-tracking rows.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod identity;
mod projection;

pub use identity::StableId;
pub use projection::{MercatorPoint, Wgs84Point, WEB_MERCATOR_SRID};

pub type SpeciesId = i64;
pub type DatasetId = i64;
pub type AlertId = i64;
pub type UserId = i64;

pub const DEFAULT_AUTO_MARK_SEEN_AFTER_DAYS: u32 = 365;

/// Longest scientific/vernacular name kept on a species row.
pub const SPECIES_NAME_MAX_CHARS: usize = 100;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("dataset key cannot be changed after creation ({current} -> {attempted})")]
    ImmutableDatasetKey { current: String, attempted: String },
    #[error("coordinate out of WGS84 range: lat={lat} lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("unknown email frequency: {0}")]
    UnknownEmailFrequency(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Species {
    pub id: SpeciesId,
    pub gbif_taxon_key: i64,
    pub scientific_name: String,
    pub vernacular_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSpecies {
    pub gbif_taxon_key: i64,
    pub scientific_name: String,
    pub vernacular_name: Option<String>,
}

impl NewSpecies {
    /// Builds a species from raw archive values, applying the name fallbacks.
    pub fn from_raw(gbif_taxon_key: i64, scientific_name: &str, vernacular_name: &str) -> Self {
        let scientific_name = truncate_chars(scientific_name.trim(), SPECIES_NAME_MAX_CHARS);
        let vernacular_name = truncate_chars(vernacular_name.trim(), SPECIES_NAME_MAX_CHARS);
        Self {
            gbif_taxon_key,
            scientific_name: if scientific_name.is_empty() {
                format!("Species {gbif_taxon_key}")
            } else {
                scientific_name
            },
            vernacular_name: (!vernacular_name.is_empty()).then_some(vernacular_name),
        }
    }
}

/// A data-provider source. The external key is fixed at construction; the
/// only way to alter a stored dataset is [`Dataset::apply`], which refuses
/// key changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    id: DatasetId,
    gbif_dataset_key: String,
    pub name: String,
}

impl Dataset {
    pub fn new(
        id: DatasetId,
        gbif_dataset_key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            gbif_dataset_key: gbif_dataset_key.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.gbif_dataset_key
    }

    pub fn apply(&mut self, change: DatasetChange) -> Result<(), CoreError> {
        if let Some(attempted) = change.gbif_dataset_key {
            if attempted != self.gbif_dataset_key {
                return Err(CoreError::ImmutableDatasetKey {
                    current: self.gbif_dataset_key.clone(),
                    attempted,
                });
            }
        }
        if let Some(name) = change.name {
            self.name = name;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetChange {
    pub name: Option<String>,
    pub gbif_dataset_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataset {
    pub gbif_dataset_key: String,
    pub name: String,
}

impl NewDataset {
    pub fn from_raw(gbif_dataset_key: &str, name: &str) -> Self {
        let name = name.trim();
        Self {
            gbif_dataset_key: gbif_dataset_key.to_string(),
            name: if name.is_empty() {
                gbif_dataset_key.to_string()
            } else {
                name.to_string()
            },
        }
    }
}

/// Observation as staged by the loader. There is no stable-id field: the
/// identifier is always derived from `source_dataset_key` and `occurrence_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub gbif_id: String,
    pub occurrence_id: String,
    pub species_id: SpeciesId,
    pub source_dataset_id: DatasetId,
    pub source_dataset_key: String,
    pub location: Option<MercatorPoint>,
    pub date: NaiveDate,
    pub individual_count: Option<i32>,
    pub locality: String,
    pub municipality: String,
    pub basis_of_record: String,
    pub recorded_by: String,
    pub coordinate_uncertainty_in_meters: Option<f64>,
    pub references: String,
}

impl NewObservation {
    pub fn stable_id(&self) -> StableId {
        StableId::compute(&self.source_dataset_key, &self.occurrence_id)
    }
}

/// Observation as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub stable_id: StableId,
    #[serde(flatten)]
    pub fields: NewObservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmailFrequency {
    Never,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl EmailFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Minimum spacing between two notifications, `None` when disabled.
    pub fn interval(self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::days(7)),
            Self::Monthly => Some(Duration::days(30)),
        }
    }
}

impl fmt::Display for EmailFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailFrequency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" | "n" => Ok(Self::Never),
            "daily" | "d" => Ok(Self::Daily),
            "weekly" | "w" => Ok(Self::Weekly),
            "monthly" | "m" => Ok(Self::Monthly),
            other => Err(CoreError::UnknownEmailFrequency(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertOwner {
    pub user_id: UserId,
    pub username: String,
    pub email: Option<String>,
}

/// A user subscription. Empty filter sets mean "unrestricted" for that
/// dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub owner: AlertOwner,
    pub name: String,
    pub species_filter: BTreeSet<SpeciesId>,
    pub dataset_filter: BTreeSet<DatasetId>,
    pub email_frequency: EmailFrequency,
    pub auto_mark_seen_after_days: Option<u32>,
    pub unseen_count: i64,
    pub last_email_sent_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn should_send_email(&self, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.email_frequency.interval() else {
            return false;
        };
        match self.last_email_sent_at {
            None => true,
            Some(last) => now - last >= interval,
        }
    }

    /// Tracking rows dated strictly before this day are auto-marked as seen.
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        match self.auto_mark_seen_after_days {
            None | Some(0) => None,
            Some(days) => Some((now - Duration::days(i64::from(days))).date_naive()),
        }
    }
}

/// "This stable id is currently unseen under this alert."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertTrackingRow {
    pub alert_id: AlertId,
    pub stable_id: StableId,
    pub observation_date: NaiveDate,
    pub first_seen_in_alert: DateTime<Utc>,
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert(frequency: EmailFrequency, last: Option<DateTime<Utc>>) -> Alert {
        Alert {
            id: 1,
            owner: AlertOwner {
                user_id: 1,
                username: "testuser".into(),
                email: None,
            },
            name: "Test Alert".into(),
            species_filter: BTreeSet::new(),
            dataset_filter: BTreeSet::new(),
            email_frequency: frequency,
            auto_mark_seen_after_days: Some(DEFAULT_AUTO_MARK_SEEN_AFTER_DAYS),
            unseen_count: 0,
            last_email_sent_at: last,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn dataset_key_is_immutable() {
        let mut dataset = Dataset::new(1, "ds-key-1", "Test Dataset");
        let err = dataset
            .apply(DatasetChange {
                name: Some("Renamed".into()),
                gbif_dataset_key: Some("ds-key-2".into()),
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::ImmutableDatasetKey { .. }));
        assert_eq!(dataset.key(), "ds-key-1");
        assert_eq!(dataset.name, "Test Dataset");
    }

    #[test]
    fn dataset_rename_with_same_key_is_accepted() {
        let mut dataset = Dataset::new(1, "ds-key-1", "Test Dataset");
        dataset
            .apply(DatasetChange {
                name: Some("Renamed".into()),
                gbif_dataset_key: Some("ds-key-1".into()),
            })
            .unwrap();
        assert_eq!(dataset.name, "Renamed");
    }

    #[test]
    fn email_never_is_not_eligible() {
        assert!(!alert(EmailFrequency::Never, None).should_send_email(now()));
    }

    #[test]
    fn first_email_is_eligible() {
        assert!(alert(EmailFrequency::Weekly, None).should_send_email(now()));
    }

    #[test]
    fn email_frequency_windows() {
        let n = now();
        assert!(alert(EmailFrequency::Daily, Some(n - Duration::hours(25))).should_send_email(n));
        assert!(!alert(EmailFrequency::Daily, Some(n - Duration::hours(12))).should_send_email(n));
        let week_ago = n - Duration::hours(7 * 24 + 1);
        assert!(alert(EmailFrequency::Weekly, Some(week_ago)).should_send_email(n));
        assert!(!alert(EmailFrequency::Weekly, Some(n - Duration::days(3))).should_send_email(n));
        let month_ago = n - Duration::hours(30 * 24 + 1);
        assert!(alert(EmailFrequency::Monthly, Some(month_ago)).should_send_email(n));
    }

    #[test]
    fn expiry_cutoff_disabled_for_zero() {
        let mut a = alert(EmailFrequency::Daily, None);
        a.auto_mark_seen_after_days = Some(0);
        assert_eq!(a.expiry_cutoff(now()), None);
        a.auto_mark_seen_after_days = Some(30);
        assert_eq!(
            a.expiry_cutoff(now()),
            NaiveDate::from_ymd_opt(2026, 2, 8)
        );
    }

    #[test]
    fn species_name_fallbacks() {
        let species = NewSpecies::from_raw(12345, "  ", "");
        assert_eq!(species.scientific_name, "Species 12345");
        assert_eq!(species.vernacular_name, None);

        let long = "x".repeat(150);
        let species = NewSpecies::from_raw(1, &long, "Asian hornet");
        assert_eq!(species.scientific_name.chars().count(), SPECIES_NAME_MAX_CHARS);
        assert_eq!(species.vernacular_name.as_deref(), Some("Asian hornet"));
    }

    #[test]
    fn email_frequency_parses_db_codes() {
        assert_eq!("W".parse::<EmailFrequency>().unwrap(), EmailFrequency::Weekly);
        assert_eq!("monthly".parse::<EmailFrequency>().unwrap(), EmailFrequency::Monthly);
        assert!("hourly".parse::<EmailFrequency>().is_err());
    }
}
