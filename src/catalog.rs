use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    LittleElm,
    Prosper,
}

impl Location {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::LittleElm => "Little Elm",
            Self::Prosper => "Prosper",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::LittleElm => "little-elm",
            Self::Prosper => "prosper",
        }
    }
}

impl FromStr for Location {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "little-elm" => Ok(Self::LittleElm),
            "prosper" => Ok(Self::Prosper),
            other => bail!("Unknown location: {other}. Expected little-elm or prosper"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecklistType {
    Opening,
    Closing,
    Weekly,
}

impl ChecklistType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "OPENING",
            Self::Closing => "CLOSING",
            Self::Weekly => "WEEKLY",
        }
    }
}

impl FromStr for ChecklistType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "OPENING" => Ok(Self::Opening),
            "CLOSING" => Ok(Self::Closing),
            "WEEKLY" => Ok(Self::Weekly),
            other => bail!("Unknown checklist type: {other}. Expected OPENING, CLOSING or WEEKLY"),
        }
    }
}

/// Identity of one expected checklist. Exactly one derived status exists per
/// key at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChecklistKey {
    pub location: Location,
    pub checklist_type: ChecklistType,
}

/// Daily deadline as a time of day, entered on the 12-hour clock
/// ("7:00 AM", "9:00 PM"). Stored internally as a 24-hour `NaiveTime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeadlineTime(NaiveTime);

impl DeadlineTime {
    /// Parses "H:MM AM" / "H:MM PM". Noon is "12:00 PM" (hour 12) and
    /// midnight is "12:00 AM" (hour 0).
    pub fn parse(value: &str) -> Result<Self> {
        let (clock, meridiem) = value
            .trim()
            .rsplit_once(' ')
            .with_context(|| format!("Invalid deadline: {value}. Example: 7:00 AM"))?;
        let (hour_part, minute_part) = clock
            .split_once(':')
            .with_context(|| format!("Invalid deadline: {value}. Example: 7:00 AM"))?;

        let hour = hour_part
            .parse::<u32>()
            .with_context(|| format!("Invalid deadline hour: {hour_part}"))?;
        let minute = minute_part
            .parse::<u32>()
            .with_context(|| format!("Invalid deadline minute: {minute_part}"))?;

        if !(1..=12).contains(&hour) {
            bail!("Deadline hour must be 1-12 on the 12-hour clock, got {hour}");
        }

        let hour24 = match meridiem {
            "AM" => hour % 12,
            "PM" => hour % 12 + 12,
            other => bail!("Invalid deadline marker: {other}. Expected AM or PM"),
        };

        NaiveTime::from_hms_opt(hour24, minute, 0)
            .map(Self)
            .with_context(|| format!("Invalid deadline time values: hour={hour24}, minute={minute}"))
    }

    /// Absolute deadline instant for the given calendar day.
    pub fn on_date(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.0)
    }

    pub fn time(self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for DeadlineTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%-I:%M %p"))
    }
}

impl TryFrom<String> for DeadlineTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeadlineTime> for String {
    fn from(value: DeadlineTime) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedChecklist {
    pub location: Location,
    pub checklist_type: ChecklistType,
    pub deadline: DeadlineTime,
    pub nominal_task_count: u32,
    #[serde(default)]
    pub critical_tasks: Vec<String>,
}

impl ExpectedChecklist {
    pub fn key(&self) -> ChecklistKey {
        ChecklistKey {
            location: self.location,
            checklist_type: self.checklist_type,
        }
    }
}

/// Static catalog of expected checklists, loaded once per process lifetime.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<ExpectedChecklist>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<ExpectedChecklist>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.key()) {
                bail!(
                    "Duplicate catalog entry: {} {}",
                    entry.location.slug(),
                    entry.checklist_type.as_str()
                );
            }
        }

        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        let entries: Vec<ExpectedChecklist> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;

        Self::from_entries(entries)
    }

    pub fn embedded_default() -> Result<Self> {
        let entries: Vec<ExpectedChecklist> =
            serde_json::from_str(include_str!("../assets/catalog.json"))
                .context("Failed to parse embedded default catalog")?;

        Self::from_entries(entries)
    }

    pub fn entries(&self) -> &[ExpectedChecklist] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_morning_deadline() {
        let deadline = DeadlineTime::parse("7:00 AM").expect("deadline parsed");
        assert_eq!(deadline.time(), NaiveTime::from_hms_opt(7, 0, 0).unwrap());
    }

    #[test]
    fn parses_evening_deadline() {
        let deadline = DeadlineTime::parse("9:30 PM").expect("deadline parsed");
        assert_eq!(deadline.time(), NaiveTime::from_hms_opt(21, 30, 0).unwrap());
    }

    #[test]
    fn noon_maps_to_hour_twelve() {
        let deadline = DeadlineTime::parse("12:00 PM").expect("deadline parsed");
        assert_eq!(deadline.time(), NaiveTime::from_hms_opt(12, 0, 0).unwrap());
    }

    #[test]
    fn midnight_maps_to_hour_zero() {
        let deadline = DeadlineTime::parse("12:00 AM").expect("deadline parsed");
        assert_eq!(deadline.time(), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn rejects_out_of_range_hour() {
        assert!(DeadlineTime::parse("13:00 PM").is_err());
        assert!(DeadlineTime::parse("0:30 AM").is_err());
    }

    #[test]
    fn rejects_missing_meridiem() {
        assert!(DeadlineTime::parse("7:00").is_err());
        assert!(DeadlineTime::parse("7:00 XM").is_err());
    }

    #[test]
    fn renders_twelve_hour_form() {
        assert_eq!(DeadlineTime::parse("9:00 PM").unwrap().to_string(), "9:00 PM");
        assert_eq!(DeadlineTime::parse("12:00 AM").unwrap().to_string(), "12:00 AM");
    }

    #[test]
    fn deadline_combines_with_date() {
        let deadline = DeadlineTime::parse("9:00 PM").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        assert_eq!(deadline.on_date(date), date.and_hms_opt(21, 0, 0).unwrap());
    }

    #[test]
    fn embedded_catalog_loads() {
        let catalog = Catalog::embedded_default().expect("embedded catalog");
        assert_eq!(catalog.len(), 5);
        assert!(
            catalog
                .entries()
                .iter()
                .any(|entry| entry.checklist_type == ChecklistType::Weekly)
        );
    }

    #[test]
    fn rejects_duplicate_catalog_keys() {
        let entry = ExpectedChecklist {
            location: Location::Prosper,
            checklist_type: ChecklistType::Opening,
            deadline: DeadlineTime::parse("7:00 AM").unwrap(),
            nominal_task_count: 11,
            critical_tasks: Vec::new(),
        };

        assert!(Catalog::from_entries(vec![entry.clone(), entry]).is_err());
    }
}
