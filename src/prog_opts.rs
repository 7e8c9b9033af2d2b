/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

use serde::Serialize;
use slog;
use std::collections::HashMap;
use std::path::PathBuf;
use typed_builder::TypedBuilder;

use crate::constants as dfconst;
use crate::dehash::{DehashParams, SnThresholds};
use crate::thresholds::ThresholdMethod;

#[derive(TypedBuilder, Debug, Serialize)]
pub struct LoadMatrixOpts<'a> {
    pub input_dir: PathBuf,
    #[builder(default)]
    pub hto_list: Option<Vec<String>>,
    #[builder(default)]
    pub drop_default_lane: bool,
    #[builder(default)]
    pub add_lane: Option<String>,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}

/// Where the hashtag counts come from.
#[derive(Debug, Serialize)]
pub enum CountSource<'a> {
    // a dense hashtag x barcode CSV
    Table(PathBuf),
    // the hashtag features of a 10x matrix directory
    Matrix(LoadMatrixOpts<'a>),
}

#[derive(TypedBuilder, Debug, Serialize)]
pub struct ThresholdOpts<'a> {
    pub method: ThresholdMethod,
    #[builder(default)]
    pub manual: HashMap<String, f64>,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}

#[derive(TypedBuilder, Debug, Serialize)]
pub struct SetThresholdsOpts<'a> {
    pub counts: CountSource<'a>,
    pub hto_meta: &'a PathBuf,
    pub output: &'a PathBuf,
    #[builder(default)]
    pub hist_dir: Option<&'a PathBuf>,
    #[builder(default = 100)]
    pub hist_bins: usize,
    #[builder(default = 7.0)]
    pub hist_max: f64,
    pub thresh: ThresholdOpts<'a>,
    pub cmdline: &'a str,
    pub version: &'a str,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}

#[derive(TypedBuilder, Debug, Serialize)]
pub struct DehashOpts<'a> {
    pub counts: CountSource<'a>,
    pub hto_meta: &'a PathBuf,
    #[builder(default)]
    pub cell_meta: Option<&'a PathBuf>,
    pub output_dir: &'a PathBuf,
    pub params: DehashParams,
    #[builder(default)]
    pub min_singlet_frac: Option<f64>,
    pub cmdline: &'a str,
    pub version: &'a str,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}

#[derive(TypedBuilder, Debug, Serialize)]
pub struct RefineOpts<'a> {
    pub cell_meta: &'a PathBuf,
    pub hto_meta: &'a PathBuf,
    pub output_dir: &'a PathBuf,
    pub sn_thresh: SnThresholds,
    pub cmdline: &'a str,
    pub version: &'a str,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}

#[derive(TypedBuilder, Debug, Serialize)]
pub struct CellQcOpts<'a> {
    pub load: LoadMatrixOpts<'a>,
    pub output_dir: &'a PathBuf,
    #[builder(default = dfconst::DEFAULT_MITO_THRESH)]
    pub mito_thresh: f64,
    #[builder(default)]
    pub gex_ash_thresh: Option<f64>,
    #[builder(default)]
    pub hto_ash_thresh: Option<f64>,
    pub cmdline: &'a str,
    pub version: &'a str,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}

#[derive(TypedBuilder, Debug, Serialize)]
pub struct ClonotypeOpts<'a> {
    pub contig_files: Vec<PathBuf>,
    pub output_dir: &'a PathBuf,
    pub cmdline: &'a str,
    pub version: &'a str,
    #[serde(skip_serializing)]
    pub log: &'a slog::Logger,
}
