/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

//! Hashtag-oligo demultiplexing ("de-hashing").
//!
//! Every barcode is first labelled as debris, singlet or multiplet by
//! counting how many hashtags reach their (ash-scale) threshold. The
//! ratio of the highest to the second-highest hashtag (signal-to-noise)
//! and of the highest hashtag to its own threshold (signal-to-threshold)
//! are then computed on raw counts, and, optionally, the signal-to-noise
//! ratio is used to revisit the threshold-only labels.

use anyhow::Context;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use slog::{info, warn};
use statrs::statistics::{Data, Median, Statistics};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::constants as dfconst;
use crate::diagnostics;
use crate::feature_matrix::HashtagCounts;
use crate::io_utils;
use crate::metadata::{CellClass, CellMetadata, CellRecord, HashtagMetadata};
use crate::prog_opts::{DehashOpts, RefineOpts};
use crate::utils as dfutils;

#[derive(Error, Debug)]
pub enum DehashError {
    #[error("no threshold has been set for hashtag `{0}`")]
    MissingThreshold(String),
    #[error("the hashtag count table is empty ({hashtags} hashtags x {cells} cells)")]
    EmptyInput { hashtags: usize, cells: usize },
    #[error("at least 2 hashtags are required to find the second highest hashtag; found {0}")]
    TooFewHashtags(usize),
    #[error("invariant violated : {0}")]
    InvariantViolation(String),
    #[error("barcode `{0}` of the hashtag count table is not present in the cell metadata")]
    UnknownBarcode(String),
    #[error("hashtag `{0}` is not present in the hashtag metadata")]
    UnknownHashtag(String),
    #[error("invalid count {value} for hashtag `{hashtag}` in barcode `{barcode}`")]
    InvalidCount {
        hashtag: String,
        barcode: String,
        value: f64,
    },
}

/// Signal-to-noise cutoffs used when revisiting each threshold-only label.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnThresholds {
    /// singlets below this are demoted to multiplets
    pub singlets: f64,
    /// debris at or above this is promoted to singlet
    pub debris: f64,
    /// multiplets at or above this are resolved to singlets
    pub multiplets: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehashParams {
    pub sn_thresh: SnThresholds,
    pub inf_replace: f64,
    pub perform_sn_adjustment: bool,
}

impl DehashParams {
    pub fn new(sn_thresh: SnThresholds) -> Self {
        Self {
            sn_thresh,
            inf_replace: dfconst::DEFAULT_INF_REPLACE,
            perform_sn_adjustment: true,
        }
    }
}

/// The top hashtag of a cell and the ratios derived from it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalRatios {
    pub max_hashtag: usize,
    pub first: f64,
    pub second: f64,
    /// first / second; infinite when second is 0
    pub sn: f64,
    /// first / UMI-scale threshold of the top hashtag
    pub st: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub debris: usize,
    pub singlet: usize,
    pub multiplet: usize,
}

impl ClassCounts {
    pub fn add(&mut self, c: CellClass) {
        match c {
            CellClass::Debris => self.debris += 1,
            CellClass::Singlet => self.singlet += 1,
            CellClass::Multiplet => self.multiplet += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.debris + self.singlet + self.multiplet
    }
}

impl<'a> FromIterator<&'a CellClass> for ClassCounts {
    fn from_iter<T: IntoIterator<Item = &'a CellClass>>(iter: T) -> Self {
        let mut cc = ClassCounts::default();
        for c in iter {
            cc.add(*c);
        }
        cc
    }
}

/// Aggregate statistics of a dehash run. Infinite ratios enter these
/// statistics as the configured replacement value; NaN ratios are skipped.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DehashSummary {
    pub num_cells: usize,
    pub num_hashtags: usize,
    pub threshold_only: ClassCounts,
    pub threshold_sn: Option<ClassCounts>,
    pub num_infinite_sn: usize,
    pub sn_mean: Option<f64>,
    pub sn_median: Option<f64>,
    pub st_mean: Option<f64>,
    pub st_median: Option<f64>,
    pub singlets_per_sample: BTreeMap<String, usize>,
}

/// One point of the first-vs-second highest hashtag scatter, on the ash
/// scale, with the log2 ratio of the two (infinities replaced).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalNoisePoint {
    pub barcode: String,
    #[serde(rename = "first highest HTO")]
    pub first_ash: f64,
    #[serde(rename = "second highest HTO")]
    pub second_ash: f64,
    #[serde(rename = "log2-sn")]
    pub log2_sn: f64,
}

fn check_inputs(
    counts: &HashtagCounts,
    hto_meta: &HashtagMetadata,
    log: &slog::Logger,
) -> Result<(), DehashError> {
    if counts.num_hashtags() == 0 || counts.num_cells() == 0 {
        return Err(DehashError::EmptyInput {
            hashtags: counts.num_hashtags(),
            cells: counts.num_cells(),
        });
    }
    if counts.num_hashtags() < 2 {
        return Err(DehashError::TooFewHashtags(counts.num_hashtags()));
    }
    for h in counts.hashtags() {
        hto_meta.threshold_ash(h)?;
    }
    for r in hto_meta.records() {
        if counts.hashtag_index(&r.hto).is_none() {
            warn!(
                log,
                "hashtag {} is in the hashtag metadata but not in the count table; ignoring it.",
                r.hto
            );
        }
    }
    Ok(())
}

/// Threshold-only classification. Counts are ash transformed and each
/// hashtag is binarized against its own ash threshold (`>=` is positive);
/// the label of a cell depends only on how many hashtags are positive.
pub fn threshold_classes(
    counts: &HashtagCounts,
    hto_meta: &HashtagMetadata,
) -> Result<Vec<CellClass>, DehashError> {
    let mut num_pos = vec![0usize; counts.num_cells()];
    for (h, name) in counts.hashtags().iter().enumerate() {
        let thresh = hto_meta.threshold_ash(name)?;
        for (c, v) in counts.row(h).iter().enumerate() {
            if dfutils::ash(*v) >= thresh {
                num_pos[c] += 1;
            }
        }
    }
    Ok(num_pos
        .into_iter()
        .map(CellClass::from_positive_count)
        .collect())
}

/// the index and value of the highest hashtag (first one wins on ties)
/// and the value of the second highest.
fn top_two(column: &[f64]) -> (usize, f64, f64) {
    let mut best = 0usize;
    for (h, v) in column.iter().enumerate().skip(1) {
        if *v > column[best] {
            best = h;
        }
    }
    let second = column
        .iter()
        .enumerate()
        .filter(|(h, _)| *h != best)
        .map(|(_, v)| *v)
        .fold(f64::NEG_INFINITY, f64::max);
    (best, column[best], second)
}

/// Signal-to-noise and signal-to-threshold ratios of every cell,
/// computed on raw counts. Ratios are left unreplaced (they may be
/// infinite, or NaN for 0 / 0).
pub fn signal_ratios(
    counts: &HashtagCounts,
    hto_meta: &HashtagMetadata,
) -> Result<Vec<SignalRatios>, DehashError> {
    if counts.num_hashtags() < 2 {
        return Err(DehashError::TooFewHashtags(counts.num_hashtags()));
    }
    let umi_thresh = counts
        .hashtags()
        .iter()
        .map(|h| hto_meta.threshold_umi(h))
        .collect::<Result<Vec<f64>, _>>()?;

    Ok((0..counts.num_cells())
        .map(|c| {
            let (max_hashtag, first, second) = top_two(&counts.column(c));
            SignalRatios {
                max_hashtag,
                first,
                second,
                sn: first / second,
                st: first / umi_thresh[max_hashtag],
            }
        })
        .collect())
}

/// Revisit a threshold-only label given the cell's signal-to-noise ratio.
/// A NaN ratio satisfies no cutoff and so leaves the label unchanged.
pub fn refine_class(class: CellClass, sn: f64, thresh: &SnThresholds) -> CellClass {
    match class {
        CellClass::Singlet if sn < thresh.singlets => CellClass::Multiplet,
        CellClass::Debris if sn >= thresh.debris => CellClass::Singlet,
        CellClass::Multiplet if sn >= thresh.multiplets => CellClass::Singlet,
        c => c,
    }
}

fn sample_for(
    class: CellClass,
    max_name: &str,
    hto_meta: &HashtagMetadata,
) -> Result<String, DehashError> {
    match class {
        CellClass::Singlet => hto_meta.sample(max_name).map(|s| s.to_string()),
        _ => Ok(dfconst::NO_SAMPLE.to_string()),
    }
}

fn log_distribution(title: &str, cc: &ClassCounts, log: &slog::Logger) {
    info!(log, "De-hash distributions: {}", title);
    info!(log, "debris {}", cc.debris.to_formatted_string(&Locale::en));
    info!(log, "singlet {}", cc.singlet.to_formatted_string(&Locale::en));
    info!(
        log,
        "multiplet {}",
        cc.multiplet.to_formatted_string(&Locale::en)
    );
}

/// Apply the signal-to-noise refinement to every cell of `cell_meta` that
/// carries a signal-to-noise ratio, filling `dehash-thresh-sn` and
/// `Sample-thresh-sn`. Cells without a ratio (i.e. absent from the count
/// table) are left untouched.
pub fn refine_with_signal_noise(
    cell_meta: &mut CellMetadata,
    hto_meta: &HashtagMetadata,
    thresh: &SnThresholds,
    log: &slog::Logger,
) -> Result<ClassCounts, DehashError> {
    let mut cc = ClassCounts::default();
    for rec in cell_meta.iter_mut() {
        let sn = match rec.hto_sn {
            Some(sn) => sn,
            None => continue,
        };
        let class = rec.dehash_thresh.ok_or_else(|| {
            DehashError::InvariantViolation(format!(
                "barcode `{}` has a signal-to-noise ratio but no threshold classification",
                rec.barcode
            ))
        })?;
        let max_name = rec.hto_max_name.as_deref().ok_or_else(|| {
            DehashError::InvariantViolation(format!(
                "barcode `{}` has a signal-to-noise ratio but no highest hashtag",
                rec.barcode
            ))
        })?;
        let refined = refine_class(class, sn, thresh);
        rec.sample_thresh_sn = Some(sample_for(refined, max_name, hto_meta)?);
        rec.dehash_thresh_sn = Some(refined);
        cc.add(refined);
    }
    log_distribution("HTO Threshold and SN", &cc, log);
    Ok(cc)
}

fn capped_mean_median(vals: impl Iterator<Item = f64>, inf_replace: f64) -> (Option<f64>, Option<f64>) {
    let v: Vec<f64> = vals
        .filter(|x| !x.is_nan())
        .map(|x| dfutils::cap_infinite(x, inf_replace))
        .collect();
    if v.is_empty() {
        return (None, None);
    }
    let mean = v.iter().mean();
    let median = Data::new(v).median();
    (Some(mean), Some(median))
}

/// Assign every barcode of the count table to debris / singlet /
/// multiplet and to a sample, recording the results in `cell_meta`.
///
/// Cells of `cell_meta` that are not in the count table keep no label
/// and get the `N.A.` threshold-only sample, while every column of the
/// count table must be present in `cell_meta`.
pub fn assign_htos(
    counts: &HashtagCounts,
    hto_meta: &HashtagMetadata,
    cell_meta: &mut CellMetadata,
    params: &DehashParams,
    log: &slog::Logger,
) -> Result<DehashSummary, DehashError> {
    check_inputs(counts, hto_meta, log)?;

    let positions = counts
        .barcodes()
        .iter()
        .map(|b| {
            cell_meta
                .position(b)
                .ok_or_else(|| DehashError::UnknownBarcode(b.clone()))
        })
        .collect::<Result<Vec<usize>, _>>()?;

    let classes = threshold_classes(counts, hto_meta)?;
    let threshold_only: ClassCounts = classes.iter().collect();
    log_distribution("HTO Threshold Only", &threshold_only, log);

    let ratios = signal_ratios(counts, hto_meta)?;

    // drop whatever an earlier pass left behind
    for rec in cell_meta.iter_mut() {
        rec.hto_max_name = None;
        rec.hto_max_umi = None;
        rec.hto_sn = None;
        rec.hto_st = None;
        rec.dehash_thresh = None;
        rec.sample_thresh = Some(dfconst::NO_SAMPLE.to_string());
        rec.dehash_thresh_sn = None;
        rec.sample_thresh_sn = None;
    }

    for ((&pos, class), r) in positions.iter().zip(classes.iter()).zip(ratios.iter()) {
        let max_name = &counts.hashtags()[r.max_hashtag];
        let sample = sample_for(*class, max_name, hto_meta)?;
        let rec: &mut CellRecord = cell_meta.record_at_mut(pos);
        rec.hto_max_name = Some(max_name.clone());
        rec.hto_max_umi = Some(r.first);
        rec.hto_sn = Some(r.sn);
        rec.hto_st = Some(r.st);
        rec.dehash_thresh = Some(*class);
        rec.sample_thresh = Some(sample);
    }

    let threshold_sn = if params.perform_sn_adjustment {
        Some(refine_with_signal_noise(
            cell_meta,
            hto_meta,
            &params.sn_thresh,
            log,
        )?)
    } else {
        None
    };

    let (sn_mean, sn_median) = capped_mean_median(ratios.iter().map(|r| r.sn), params.inf_replace);
    let (st_mean, st_median) = capped_mean_median(ratios.iter().map(|r| r.st), params.inf_replace);
    let num_infinite_sn = ratios.iter().filter(|r| r.sn.is_infinite()).count();

    let singlets_per_sample: BTreeMap<String, usize> = positions
        .iter()
        .filter_map(|&pos| {
            let rec = &cell_meta.records()[pos];
            let (class, sample) = if params.perform_sn_adjustment {
                (rec.dehash_thresh_sn, rec.sample_thresh_sn.as_ref())
            } else {
                (rec.dehash_thresh, rec.sample_thresh.as_ref())
            };
            match class {
                Some(CellClass::Singlet) => sample.cloned(),
                _ => None,
            }
        })
        .counts()
        .into_iter()
        .collect();

    for (sample, n) in singlets_per_sample.iter() {
        info!(
            log,
            "sample {} : {} singlets",
            sample,
            n.to_formatted_string(&Locale::en)
        );
    }

    Ok(DehashSummary {
        num_cells: counts.num_cells(),
        num_hashtags: counts.num_hashtags(),
        threshold_only,
        threshold_sn,
        num_infinite_sn,
        sn_mean,
        sn_median,
        st_mean,
        st_median,
        singlets_per_sample,
    })
}

/// The data behind the first-vs-second highest hashtag scatter plot and
/// the log2 signal-to-noise histogram, computed on ash-scaled counts.
pub fn signal_vs_noise(
    counts: &HashtagCounts,
    inf_replace: f64,
) -> Result<Vec<SignalNoisePoint>, DehashError> {
    if counts.num_hashtags() < 2 {
        return Err(DehashError::TooFewHashtags(counts.num_hashtags()));
    }
    Ok(counts
        .barcodes()
        .iter()
        .enumerate()
        .map(|(c, bc)| {
            let ash_col: Vec<f64> = counts.column(c).into_iter().map(dfutils::ash).collect();
            let (_, first, second) = top_two(&ash_col);
            SignalNoisePoint {
                barcode: bc.clone(),
                first_ash: first,
                second_ash: second,
                log2_sn: dfutils::cap_infinite((first / second).log2(), inf_replace),
            }
        })
        .collect())
}

/// Read the hashtag counts and metadata, de-hash every barcode and write
/// the enriched cell metadata, the signal-vs-noise table and a JSON
/// summary of the run to the output directory.
pub fn dehash(opts: &DehashOpts) -> anyhow::Result<DehashSummary> {
    let log = opts.log;
    let counts = io_utils::load_hashtag_counts(&opts.counts)?;
    let hto_meta = io_utils::read_hashtag_metadata(opts.hto_meta)?;
    let mut cell_meta = match opts.cell_meta {
        Some(p) => io_utils::read_cell_metadata(p)?,
        None => CellMetadata::from_barcodes(counts.barcodes())?,
    };
    info!(
        log,
        "de-hashing {} barcodes with {} hashtags",
        counts.num_cells().to_formatted_string(&Locale::en),
        counts.num_hashtags()
    );

    let summary = assign_htos(&counts, &hto_meta, &mut cell_meta, &opts.params, log)?;

    if let Some(min_frac) = opts.min_singlet_frac {
        let cc = summary.threshold_sn.unwrap_or(summary.threshold_only);
        match diagnostics::likely_valid_singlet_rate(&cc, min_frac) {
            Ok(f) => info!(log, "singlet fraction : {:.4}", f),
            Err(e) => warn!(log, "{:#}", e),
        }
    }

    std::fs::create_dir_all(opts.output_dir)
        .with_context(|| format!("could not create {}", opts.output_dir.display()))?;
    io_utils::write_cell_metadata(&opts.output_dir.join(dfconst::CELL_META_FILE), &cell_meta)?;
    let svn = signal_vs_noise(&counts, opts.params.inf_replace)?;
    io_utils::write_csv_records(&opts.output_dir.join(dfconst::SIGNAL_NOISE_FILE), &svn)?;

    let meta_info = json!({
        "version_str" : opts.version,
        "cmd" : opts.cmdline,
        "dehash_options" : opts,
        "summary" : &summary,
    });
    io_utils::write_json(&opts.output_dir.join(dfconst::DEHASH_JSON_FILE), &meta_info)?;
    Ok(summary)
}

/// Re-run only the signal-to-noise refinement over a cell metadata table
/// produced by an earlier `dehash`.
pub fn refine(opts: &RefineOpts) -> anyhow::Result<ClassCounts> {
    let log = opts.log;
    let hto_meta = io_utils::read_hashtag_metadata(opts.hto_meta)?;
    let mut cell_meta = io_utils::read_cell_metadata(opts.cell_meta)?;
    let cc = refine_with_signal_noise(&mut cell_meta, &hto_meta, &opts.sn_thresh, log)?;
    if cc.total() == 0 {
        warn!(
            log,
            "no barcode of {} carries a signal-to-noise ratio; was it written by dehash?",
            opts.cell_meta.display()
        );
    }

    std::fs::create_dir_all(opts.output_dir)
        .with_context(|| format!("could not create {}", opts.output_dir.display()))?;
    io_utils::write_cell_metadata(&opts.output_dir.join(dfconst::CELL_META_FILE), &cell_meta)?;
    let meta_info = json!({
        "version_str" : opts.version,
        "cmd" : opts.cmdline,
        "refine_options" : opts,
        "threshold_sn" : &cc,
    });
    io_utils::write_json(&opts.output_dir.join(dfconst::REFINE_JSON_FILE), &meta_info)?;
    Ok(cc)
}
