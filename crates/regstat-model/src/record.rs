use crate::dimension::DataKind;
use crate::import::ParseError;

/// Column names of a vehicle extract, in canonical order.
pub const VEHICLE_COLUMNS: [&str; 16] = [
    "AN",
    "NOSEQ_VEH",
    "CLAS",
    "TYP_VEH_CATEG_USA",
    "MARQ_VEH",
    "MODEL_VEH",
    "ANNEE_MOD",
    "MASSE_NETTE",
    "NB_CYL",
    "CYL_VEH",
    "NB_ESIEU_MAX",
    "COUL_ORIG",
    "TYP_CARBU",
    "REG_ADM",
    "MRC",
    "CG_FIXE",
];

/// Column names of a driver's-license extract, in canonical order.
pub const LICENSE_COLUMNS: [&str; 9] = [
    "AN",
    "NOSEQ_TITUL",
    "AGE_1ER_JUIN",
    "SEXE",
    "MRC",
    "REG_ADM",
    "TYP_PERMIS",
    "EXPERIENCE_GLOBALE",
    "IND_PROBATOIRE",
];

pub fn columns_for(kind: DataKind) -> &'static [&'static str] {
    match kind {
        DataKind::Vehicle => &VEHICLE_COLUMNS,
        DataKind::License => &LICENSE_COLUMNS,
    }
}

/// One vehicle registration row as read from an extract.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VehicleRecord {
    pub year: Option<i32>,
    pub sequence: String,
    pub classification: Option<String>,
    pub vehicle_type: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub model_year: Option<i32>,
    pub net_mass: Option<f64>,
    pub cylinder_count: Option<i32>,
    pub displacement: Option<f64>,
    pub axle_count: Option<i32>,
    pub color: Option<String>,
    pub fuel_type: Option<String>,
    pub region: Option<String>,
    pub district: Option<String>,
    pub municipality: Option<String>,
}

/// One driver's-license row as read from an extract.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LicenseRecord {
    pub year: Option<i32>,
    pub sequence: String,
    pub age_group: Option<String>,
    pub gender: Option<String>,
    pub district: Option<String>,
    pub region: Option<String>,
    pub license_type: Option<String>,
    pub experience: Option<String>,
    pub is_probationary: Option<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Vehicle(VehicleRecord),
    License(LicenseRecord),
}

impl Record {
    pub fn sequence(&self) -> &str {
        match self {
            Record::Vehicle(v) => &v.sequence,
            Record::License(l) => &l.sequence,
        }
    }

    pub fn year(&self) -> Option<i32> {
        match self {
            Record::Vehicle(v) => v.year,
            Record::License(l) => l.year,
        }
    }
}

/// Maps canonical column positions to positions in a concrete extract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMap {
    kind: DataKind,
    positions: Vec<usize>,
    width: usize,
}

impl ColumnMap {
    pub fn canonical(kind: DataKind) -> Self {
        let width = columns_for(kind).len();
        Self {
            kind,
            positions: (0..width).collect(),
            width,
        }
    }

    /// Build a map from a header row. Extra columns are tolerated; missing ones are not.
    pub fn from_header(kind: DataKind, header: &[&str]) -> Result<Self, ParseError> {
        let expected = columns_for(kind);
        let mut positions = Vec::with_capacity(expected.len());
        let mut missing = Vec::new();
        for name in expected {
            match header
                .iter()
                .position(|h| h.trim().trim_matches('"').eq_ignore_ascii_case(name))
            {
                Some(idx) => positions.push(idx),
                None => missing.push(*name),
            }
        }
        if !missing.is_empty() {
            return Err(ParseError::MissingColumns {
                kind,
                columns: missing.iter().map(|c| c.to_string()).collect(),
            });
        }
        Ok(Self {
            kind,
            positions,
            width: header.len(),
        })
    }

    /// Number of fields every data row must carry.
    pub fn width(&self) -> usize {
        self.width
    }

    fn field<'a>(&self, row: &'a csv::StringRecord, canonical: usize) -> &'a str {
        row.get(self.positions[canonical]).unwrap_or("").trim()
    }

    /// Convert a row of the right width into a typed record.
    pub fn record(&self, row: &csv::StringRecord) -> Record {
        match self.kind {
            DataKind::Vehicle => Record::Vehicle(VehicleRecord {
                year: parse_int(self.field(row, 0)),
                sequence: self.field(row, 1).to_string(),
                classification: text(self.field(row, 2)),
                vehicle_type: text(self.field(row, 3)),
                make: text(self.field(row, 4)),
                model: text(self.field(row, 5)),
                model_year: parse_int(self.field(row, 6)),
                net_mass: parse_float(self.field(row, 7)),
                cylinder_count: parse_int(self.field(row, 8)),
                displacement: parse_float(self.field(row, 9)),
                axle_count: parse_int(self.field(row, 10)),
                color: text(self.field(row, 11)),
                fuel_type: text(self.field(row, 12)),
                region: text(self.field(row, 13)),
                district: text(self.field(row, 14)),
                municipality: text(self.field(row, 15)),
            }),
            DataKind::License => Record::License(LicenseRecord {
                year: parse_int(self.field(row, 0)),
                sequence: self.field(row, 1).to_string(),
                age_group: text(self.field(row, 2)),
                gender: text(self.field(row, 3)),
                district: text(self.field(row, 4)),
                region: text(self.field(row, 5)),
                license_type: text(self.field(row, 6)),
                experience: text(self.field(row, 7)),
                is_probationary: parse_flag(self.field(row, 8)),
            }),
        }
    }
}

fn text(v: &str) -> Option<String> {
    (!v.is_empty()).then(|| v.to_string())
}

fn parse_int(v: &str) -> Option<i32> {
    if v.is_empty() {
        return None;
    }
    v.parse::<i32>()
        .ok()
        .or_else(|| {
            parse_float(v)
                .filter(|f| f.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(f))
                .map(|f| f as i32)
        })
}

fn parse_float(v: &str) -> Option<f64> {
    if v.is_empty() {
        return None;
    }
    // Some years use a decimal comma.
    let normalized = v.replace(',', ".");
    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_ascii_uppercase().as_str() {
        "" => None,
        "1" | "O" | "OUI" | "Y" | "YES" | "TRUE" => Some(true),
        "0" | "N" | "NON" | "NO" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Extract a four-digit year (1900..=2100) from an extract file name.
///
/// The last matching run of digits wins, so `vehicules_2017_v2_2020.csv` yields 2020.
pub fn year_from_file_name(name: &str) -> Option<i32> {
    let stem = std::path::Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let mut found = None;
    let bytes = stem.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 {
                if let Ok(year) = stem[start..i].parse::<i32>() {
                    if (1900..=2100).contains(&year) {
                        found = Some(year);
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    found
}
