//! Eligibility reference table and the label → verdict service.

use std::{borrow::Cow, collections::HashMap, io::Read, path::Path};

use serde::Serialize;

use crate::error::DatasetError;
use crate::labels::{normalize, parse_label, MakeModel};

pub const DEFAULT_ELIGIBILITY_COLUMN: &str = "Eligible_CC4A_DCAP";

/// One dataset row after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityRecord {
    pub key: MakeModel,
    pub eligible: bool,
}

/// Anything other than `YES` (after trim + uppercase) is ineligible.
pub fn parse_eligible_flag(raw: &str) -> bool {
    raw.trim().to_uppercase() == "YES"
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TableStats {
    /// Data rows read from the dataset (header excluded).
    pub rows: usize,
    /// Unique `(make, model)` keys.
    pub entries: usize,
    pub eligible: usize,
    /// Rows whose key was already present.
    pub duplicate_rows: usize,
    /// Duplicate rows that also flipped the eligibility value.
    pub conflicting_rows: usize,
    /// Rows without a make or model.
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions<'a> {
    pub eligibility_column: Option<&'a str>,
    /// Fail the build instead of letting a later row overwrite a conflicting earlier one.
    pub reject_conflicting_duplicates: bool,
}

/// Immutable `(make, model)` → eligible lookup.
#[derive(Debug, Clone, Default)]
pub struct EligibilityTable {
    entries: HashMap<MakeModel, bool>,
    stats: TableStats,
}

impl EligibilityTable {
    pub fn from_path(path: &Path, opts: TableOptions<'_>) -> Result<Self, DatasetError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        Self::from_csv(reader, opts)
    }

    pub fn from_reader<R: Read>(rdr: R, opts: TableOptions<'_>) -> Result<Self, DatasetError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(rdr);
        Self::from_csv(reader, opts)
    }

    fn from_csv<R: Read>(
        mut reader: csv::Reader<R>,
        opts: TableOptions<'_>,
    ) -> Result<Self, DatasetError> {
        let flag_column = opts
            .eligibility_column
            .unwrap_or(DEFAULT_ELIGIBILITY_COLUMN);
        // byte records so a stray non-UTF-8 cell degrades instead of failing the load
        let headers = reader.byte_headers()?.clone();
        let make_idx = column_index(&headers, "Make")?;
        let model_idx = column_index(&headers, "Model")?;
        let flag_idx = column_index(&headers, flag_column)?;

        let mut table = Self::default();
        for (row_idx, result) in reader.byte_records().enumerate() {
            let record = result?;
            let row_num = row_idx + 2; // header is row 1
            table.stats.rows += 1;

            let make = field(&record, make_idx);
            let model = field(&record, model_idx);
            if make.trim().is_empty() || model.trim().is_empty() {
                tracing::warn!("dataset row {} has no make/model; skipping", row_num);
                table.stats.skipped_rows += 1;
                continue;
            }

            let rec = EligibilityRecord {
                key: MakeModel::new(&make, &model),
                eligible: parse_eligible_flag(&field(&record, flag_idx)),
            };
            if opts.reject_conflicting_duplicates && table.conflicts_with(&rec) {
                return Err(DatasetError::ConflictingDuplicate {
                    make: rec.key.make,
                    model: rec.key.model,
                    row: row_num,
                });
            }
            table.upsert(rec, row_num);
        }

        table.finish_stats();
        if table.stats.duplicate_rows > 0 {
            tracing::warn!(
                "dataset has {} duplicate make/model rows ({} with conflicting eligibility); last row wins",
                table.stats.duplicate_rows,
                table.stats.conflicting_rows
            );
        }
        Ok(table)
    }

    fn conflicts_with(&self, rec: &EligibilityRecord) -> bool {
        self.entries
            .get(&rec.key)
            .is_some_and(|prev| *prev != rec.eligible)
    }

    /// Insert or overwrite, counting duplicates and conflicts.
    fn upsert(&mut self, rec: EligibilityRecord, row_num: usize) {
        let Some(prev) = self.entries.insert(rec.key.clone(), rec.eligible) else {
            return;
        };
        self.stats.duplicate_rows += 1;
        if prev != rec.eligible {
            self.stats.conflicting_rows += 1;
            tracing::warn!(
                "row {}: {} overrides eligibility {} -> {}",
                row_num,
                rec.key.display(),
                prev,
                rec.eligible
            );
        }
    }

    fn finish_stats(&mut self) {
        self.stats.entries = self.entries.len();
        self.stats.eligible = self.entries.values().filter(|e| **e).count();
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = EligibilityRecord>,
    {
        let mut table = Self::default();
        for (i, rec) in records.into_iter().enumerate() {
            table.stats.rows += 1;
            table.upsert(rec, i + 1);
        }
        table.finish_stats();
        table
    }

    pub fn get(&self, make: &str, model: &str) -> Option<bool> {
        self.lookup(&MakeModel::new(make, model))
    }

    pub fn lookup(&self, key: &MakeModel) -> Option<bool> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }
}

fn field(record: &csv::ByteRecord, idx: usize) -> Cow<'_, str> {
    String::from_utf8_lossy(record.get(idx).unwrap_or(b""))
}

fn column_index(headers: &csv::ByteRecord, name: &str) -> Result<usize, DatasetError> {
    let wanted = normalize(name);
    headers
        .iter()
        .position(|h| normalize(&String::from_utf8_lossy(h)) == wanted)
        .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub qualified: bool,
    pub reason: String,
}

/// Turns a predicted class label into an eligibility verdict.
#[derive(Debug, Clone)]
pub struct EligibilityService {
    table: EligibilityTable,
}

impl EligibilityService {
    pub fn new(table: EligibilityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &EligibilityTable {
        &self.table
    }

    pub fn check(&self, label: &str) -> Verdict {
        let key = match parse_label(label) {
            Ok(k) => k,
            Err(e) => {
                return Verdict {
                    qualified: false,
                    reason: e.to_string(),
                }
            }
        };

        let name = key.display();
        match self.table.lookup(&key) {
            None => Verdict {
                qualified: false,
                reason: format!("{} not found in database", name),
            },
            Some(true) => Verdict {
                qualified: true,
                reason: format!("{} is eligible", name),
            },
            Some(false) => Verdict {
                qualified: false,
                reason: format!("{} is not eligible", name),
            },
        }
    }
}
