/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::dehash::DehashError;
use crate::utils as dfutils;

/// How many cells a barcode is believed to hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellClass {
    Debris,
    Singlet,
    Multiplet,
}

impl CellClass {
    /// classification from the number of hashtags at or above threshold
    pub fn from_positive_count(n: usize) -> Self {
        match n {
            0 => CellClass::Debris,
            1 => CellClass::Singlet,
            _ => CellClass::Multiplet,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CellClass::Debris => "debris",
            CellClass::Singlet => "singlet",
            CellClass::Multiplet => "multiplet",
        }
    }
}

impl fmt::Display for CellClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellClass {
    type Err = DehashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debris" => Ok(CellClass::Debris),
            "singlet" => Ok(CellClass::Singlet),
            "multiplet" => Ok(CellClass::Multiplet),
            _ => Err(DehashError::InvariantViolation(format!(
                "unrecognized classification label `{}`",
                s
            ))),
        }
    }
}

/// One row of the hashtag metadata table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HashtagRecord {
    pub hto: String,
    #[serde(rename = "Sample")]
    pub sample: String,
    #[serde(rename = "hto-threshold-ash", default)]
    pub threshold_ash: Option<f64>,
    #[serde(rename = "hto-threshold-umi", default)]
    pub threshold_umi: Option<f64>,
}

impl HashtagRecord {
    pub fn new(hto: &str, sample: &str) -> Self {
        Self {
            hto: hto.to_string(),
            sample: sample.to_string(),
            threshold_ash: None,
            threshold_umi: None,
        }
    }
}

/// Per-hashtag thresholds and the sample each hashtag encodes.
#[derive(Clone, Debug, Default)]
pub struct HashtagMetadata {
    records: Vec<HashtagRecord>,
    index: HashMap<String, usize>,
}

impl HashtagMetadata {
    pub fn from_records(records: Vec<HashtagRecord>) -> Result<Self, DehashError> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, r) in records.iter().enumerate() {
            if index.insert(r.hto.clone(), i).is_some() {
                return Err(DehashError::InvariantViolation(format!(
                    "hashtag `{}` appears more than once in the hashtag metadata",
                    r.hto
                )));
            }
        }
        Ok(Self { records, index })
    }

    pub fn records(&self) -> &[HashtagRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, hto: &str) -> bool {
        self.index.contains_key(hto)
    }

    pub fn get(&self, hto: &str) -> Option<&HashtagRecord> {
        self.index.get(hto).map(|&i| &self.records[i])
    }

    /// Record a threshold on the ash scale; the UMI-scale threshold is
    /// derived from it.
    pub fn set_threshold(&mut self, hto: &str, ash_thresh: f64) -> Result<(), DehashError> {
        let i = *self
            .index
            .get(hto)
            .ok_or_else(|| DehashError::UnknownHashtag(hto.to_string()))?;
        let r = &mut self.records[i];
        r.threshold_ash = Some(ash_thresh);
        r.threshold_umi = Some(dfutils::inv_ash(ash_thresh));
        Ok(())
    }

    pub fn threshold_ash(&self, hto: &str) -> Result<f64, DehashError> {
        self.get(hto)
            .and_then(|r| r.threshold_ash)
            .filter(|t| !t.is_nan())
            .ok_or_else(|| DehashError::MissingThreshold(hto.to_string()))
    }

    /// the UMI-scale threshold, always recovered from the ash threshold
    pub fn threshold_umi(&self, hto: &str) -> Result<f64, DehashError> {
        self.threshold_ash(hto).map(dfutils::inv_ash)
    }

    pub fn sample(&self, hto: &str) -> Result<&str, DehashError> {
        self.get(hto)
            .map(|r| r.sample.as_str())
            .ok_or_else(|| DehashError::UnknownHashtag(hto.to_string()))
    }
}

/// Everything derived about a single barcode. Fields are filled in by
/// successive passes (QC, threshold classification, SN refinement).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub barcode: String,
    #[serde(rename = "gex-umi-sum", default)]
    pub gex_umi_sum: Option<f64>,
    #[serde(rename = "gex-umi-sum-ash", default)]
    pub gex_umi_sum_ash: Option<f64>,
    #[serde(rename = "gex-num-unique", default)]
    pub gex_num_unique: Option<usize>,
    #[serde(rename = "adt-umi-sum", default)]
    pub adt_umi_sum: Option<f64>,
    #[serde(rename = "adt-umi-sum-ash", default)]
    pub adt_umi_sum_ash: Option<f64>,
    #[serde(rename = "adt-num-unique", default)]
    pub adt_num_unique: Option<usize>,
    #[serde(rename = "hto-umi-sum", default)]
    pub hto_umi_sum: Option<f64>,
    #[serde(rename = "hto-umi-sum-ash", default)]
    pub hto_umi_sum_ash: Option<f64>,
    #[serde(rename = "hto-num-unique", default)]
    pub hto_num_unique: Option<usize>,
    #[serde(rename = "gex-mito-proportion-umi", default)]
    pub gex_mito_proportion: Option<f64>,
    #[serde(rename = "dead-cell-mito", default)]
    pub dead_cell_mito: Option<String>,
    #[serde(rename = "hto-max-name", default)]
    pub hto_max_name: Option<String>,
    #[serde(rename = "hto-max-umi", default)]
    pub hto_max_umi: Option<f64>,
    #[serde(rename = "hto-sn", default)]
    pub hto_sn: Option<f64>,
    #[serde(rename = "hto-st", default)]
    pub hto_st: Option<f64>,
    #[serde(rename = "dehash-thresh", default)]
    pub dehash_thresh: Option<CellClass>,
    #[serde(rename = "Sample-thresh", default)]
    pub sample_thresh: Option<String>,
    #[serde(rename = "dehash-thresh-sn", default)]
    pub dehash_thresh_sn: Option<CellClass>,
    #[serde(rename = "Sample-thresh-sn", default)]
    pub sample_thresh_sn: Option<String>,
}

impl CellRecord {
    pub fn new(barcode: &str) -> Self {
        Self {
            barcode: barcode.to_string(),
            ..Default::default()
        }
    }
}

/// header names of the columns holding classification labels
pub const LABEL_COLUMNS: [&str; 2] = ["dehash-thresh", "dehash-thresh-sn"];

/// Per-barcode metadata, keyed by barcode. Rows are never added or
/// removed once built; passes only fill in fields.
#[derive(Clone, Debug, Default)]
pub struct CellMetadata {
    records: Vec<CellRecord>,
    index: HashMap<String, usize, ahash::RandomState>,
}

impl CellMetadata {
    pub fn from_barcodes<S: AsRef<str>>(barcodes: &[S]) -> Result<Self, DehashError> {
        Self::from_records(barcodes.iter().map(|b| CellRecord::new(b.as_ref())).collect())
    }

    pub fn from_records(records: Vec<CellRecord>) -> Result<Self, DehashError> {
        let s = ahash::RandomState::with_seeds(2u64, 7u64, 1u64, 8u64);
        let mut index = HashMap::with_capacity_and_hasher(records.len(), s);
        for (i, r) in records.iter().enumerate() {
            if index.insert(r.barcode.clone(), i).is_some() {
                return Err(DehashError::InvariantViolation(format!(
                    "barcode `{}` appears more than once in the cell metadata",
                    r.barcode
                )));
            }
        }
        Ok(Self { records, index })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CellRecord] {
        &self.records
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, CellRecord> {
        self.records.iter_mut()
    }

    pub fn position(&self, barcode: &str) -> Option<usize> {
        self.index.get(barcode).copied()
    }

    pub fn get(&self, barcode: &str) -> Option<&CellRecord> {
        self.position(barcode).map(|i| &self.records[i])
    }

    pub fn get_mut(&mut self, barcode: &str) -> Option<&mut CellRecord> {
        match self.position(barcode) {
            Some(i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn record_at_mut(&mut self, i: usize) -> &mut CellRecord {
        &mut self.records[i]
    }
}
