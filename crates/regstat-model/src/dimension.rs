use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two record kinds held by the store, one fact table each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Vehicle,
    License,
}

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::Vehicle, DataKind::License];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Vehicle => "vehicle",
            DataKind::License => "license",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vehicle" | "vehicles" => Ok(DataKind::Vehicle),
            "license" | "licenses" | "licence" | "licences" => Ok(DataKind::License),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// A categorical column that is dictionary encoded.
///
/// Every dimension owns one dictionary table. `Model` is the only scoped
/// dimension: its values are unique per make, not globally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Year,
    Region,
    District,
    Municipality,
    Classification,
    VehicleType,
    Make,
    Model,
    ModelYear,
    Color,
    FuelType,
    CylinderCount,
    AxleCount,
    LicenseType,
    AgeGroup,
    Gender,
    Experience,
}

impl Dimension {
    pub const ALL: [Dimension; 17] = [
        Dimension::Year,
        Dimension::Region,
        Dimension::District,
        Dimension::Municipality,
        Dimension::Classification,
        Dimension::VehicleType,
        Dimension::Make,
        Dimension::Model,
        Dimension::ModelYear,
        Dimension::Color,
        Dimension::FuelType,
        Dimension::CylinderCount,
        Dimension::AxleCount,
        Dimension::LicenseType,
        Dimension::AgeGroup,
        Dimension::Gender,
        Dimension::Experience,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Year => "year",
            Dimension::Region => "region",
            Dimension::District => "district",
            Dimension::Municipality => "municipality",
            Dimension::Classification => "classification",
            Dimension::VehicleType => "vehicle_type",
            Dimension::Make => "make",
            Dimension::Model => "model",
            Dimension::ModelYear => "model_year",
            Dimension::Color => "color",
            Dimension::FuelType => "fuel_type",
            Dimension::CylinderCount => "cylinder_count",
            Dimension::AxleCount => "axle_count",
            Dimension::LicenseType => "license_type",
            Dimension::AgeGroup => "age_group",
            Dimension::Gender => "gender",
            Dimension::Experience => "experience",
        }
    }

    /// Dictionary table holding this dimension's values.
    pub fn table(self) -> &'static str {
        match self {
            Dimension::Year => "dim_year",
            Dimension::Region => "dim_region",
            Dimension::District => "dim_district",
            Dimension::Municipality => "dim_municipality",
            Dimension::Classification => "dim_classification",
            Dimension::VehicleType => "dim_vehicle_type",
            Dimension::Make => "dim_make",
            Dimension::Model => "dim_model",
            Dimension::ModelYear => "dim_model_year",
            Dimension::Color => "dim_color",
            Dimension::FuelType => "dim_fuel_type",
            Dimension::CylinderCount => "dim_cylinder_count",
            Dimension::AxleCount => "dim_axle_count",
            Dimension::LicenseType => "dim_license_type",
            Dimension::AgeGroup => "dim_age_group",
            Dimension::Gender => "dim_gender",
            Dimension::Experience => "dim_experience",
        }
    }

    /// Foreign-key column carrying this dimension on a fact table.
    pub fn fact_column(self) -> &'static str {
        match self {
            Dimension::Year => "year_id",
            Dimension::Region => "region_id",
            Dimension::District => "district_id",
            Dimension::Municipality => "municipality_id",
            Dimension::Classification => "classification_id",
            Dimension::VehicleType => "vehicle_type_id",
            Dimension::Make => "make_id",
            Dimension::Model => "model_id",
            Dimension::ModelYear => "model_year_id",
            Dimension::Color => "color_id",
            Dimension::FuelType => "fuel_type_id",
            Dimension::CylinderCount => "cylinder_count_id",
            Dimension::AxleCount => "axle_count_id",
            Dimension::LicenseType => "license_type_id",
            Dimension::AgeGroup => "age_group_id",
            Dimension::Gender => "gender_id",
            Dimension::Experience => "experience_id",
        }
    }

    pub fn applies_to(self, kind: DataKind) -> bool {
        match self {
            Dimension::Year | Dimension::Region | Dimension::District => true,
            Dimension::Municipality
            | Dimension::Classification
            | Dimension::VehicleType
            | Dimension::Make
            | Dimension::Model
            | Dimension::ModelYear
            | Dimension::Color
            | Dimension::FuelType
            | Dimension::CylinderCount
            | Dimension::AxleCount => kind == DataKind::Vehicle,
            Dimension::LicenseType
            | Dimension::AgeGroup
            | Dimension::Gender
            | Dimension::Experience => kind == DataKind::License,
        }
    }

    /// Parent level in the hierarchy, if any.
    pub fn parent(self) -> Option<Dimension> {
        match self {
            Dimension::Model => Some(Dimension::Make),
            Dimension::Municipality => Some(Dimension::District),
            Dimension::District => Some(Dimension::Region),
            _ => None,
        }
    }

    /// Scoped dimensions are keyed by `(parent_id, value)` rather than `value`.
    pub fn is_scoped(self) -> bool {
        matches!(self, Dimension::Model)
    }

    pub fn is_geographic(self) -> bool {
        matches!(
            self,
            Dimension::Region | Dimension::District | Dimension::Municipality
        )
    }

    pub fn for_kind(kind: DataKind) -> impl Iterator<Item = Dimension> {
        Dimension::ALL.into_iter().filter(move |d| d.applies_to(kind))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        Dimension::ALL
            .into_iter()
            .find(|d| d.as_str() == needle)
            .ok_or(UnknownName(needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown name: {0}")]
pub struct UnknownName(pub String);

/// Split a geographic extract value such as `"Montréal (06)"` into `(code, name)`.
///
/// Values without a trailing parenthesised code are returned as their own code.
pub fn split_geographic_value(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    if let Some(open) = trimmed.rfind('(') {
        if let Some(inner) = trimmed[open + 1..].strip_suffix(')') {
            let code = inner.trim();
            let name = trimmed[..open].trim();
            if !code.is_empty() {
                let name = (!name.is_empty()).then(|| name.to_string());
                return (code.to_string(), name);
            }
        }
    }
    (trimmed.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_names_round_trip() {
        for dim in Dimension::ALL {
            assert_eq!(dim.as_str().parse::<Dimension>().unwrap(), dim);
        }
        assert_eq!("vehicle-type".parse::<Dimension>().unwrap(), Dimension::VehicleType);
    }

    #[test]
    fn geographic_values_split_code_and_name() {
        assert_eq!(
            split_geographic_value("Montréal (06)"),
            ("06".to_string(), Some("Montréal".to_string()))
        );
        assert_eq!(
            split_geographic_value(" Les Moulins (64 ) "),
            ("64".to_string(), Some("Les Moulins".to_string()))
        );
        assert_eq!(split_geographic_value("66023"), ("66023".to_string(), None));
    }

    #[test]
    fn kind_membership() {
        assert!(Dimension::Make.applies_to(DataKind::Vehicle));
        assert!(!Dimension::Make.applies_to(DataKind::License));
        assert!(Dimension::Gender.applies_to(DataKind::License));
        assert!(Dimension::Year.applies_to(DataKind::License));
        assert_eq!(Dimension::for_kind(DataKind::License).count(), 7);
    }
}
