use std::io::Read;

use rand::Rng;
use serde::Deserialize;

use super::domain::OfficerCard;

/// Candidate officers for automatic assignment. Read-only to the workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfficerPool {
    officers: Vec<OfficerCard>,
}

impl OfficerPool {
    /// Keeps only entries with every officer field filled in.
    pub fn new(officers: Vec<OfficerCard>) -> Self {
        let officers = officers
            .into_iter()
            .filter(|officer| officer.missing_fields().is_empty())
            .collect();
        Self { officers }
    }

    /// Parse a pool sheet with `Officer ID`, `Name`, `Phone`, `Email` columns.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, csv::Error> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut officers = Vec::new();
        for row in csv_reader.deserialize::<OfficerRow>() {
            let row = row?;
            officers.push(OfficerCard {
                officer_id: row.officer_id,
                name: row.name,
                phone: row.phone,
                email: row.email,
            });
        }
        Ok(Self::new(officers))
    }

    pub fn officers(&self) -> &[OfficerCard] {
        &self.officers
    }

    pub fn is_empty(&self) -> bool {
        self.officers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.officers.len()
    }
}

#[derive(Debug, Deserialize)]
struct OfficerRow {
    #[serde(rename = "Officer ID")]
    officer_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Phone")]
    phone: String,
    #[serde(rename = "Email")]
    email: String,
}

/// Picks one officer out of a non-empty pool.
pub trait OfficerSelector: Send + Sync {
    fn pick<'a>(&self, pool: &'a OfficerPool) -> Option<&'a OfficerCard>;
}

/// Uniform draw per call. Consecutive draws are independent, so load is not balanced.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOfficerSelector;

impl OfficerSelector for RandomOfficerSelector {
    fn pick<'a>(&self, pool: &'a OfficerPool) -> Option<&'a OfficerCard> {
        if pool.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..pool.len());
        pool.officers.get(index)
    }
}

/// How officers get bound to newly enrolled groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentMode {
    /// An administrator writes officer fields against the group.
    Manual,
    /// A pool officer is drawn at enrollment time; manual assignment remains available.
    Automatic,
}
