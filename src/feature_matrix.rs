/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

use anyhow::Context;
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use slog::{info, warn};
use sprs::{CsMat, TriMat, TriMatI};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{BufRead, Cursor, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::constants as dfconst;
use crate::dehash::DehashError;
use crate::prog_opts::LoadMatrixOpts;
use crate::utils as dfutils;

#[derive(Error, Debug)]
pub enum FeatureMatrixError {
    #[error("features line {0} should have at least 3 tab-separated columns; found `{1}`")]
    MalformedFeatureLine(usize, String),
    #[error("unknown feature type `{0}`")]
    UnknownFeatureType(String),
    #[error("matrix has shape {rows} x {cols} but there are {features} features and {barcodes} barcodes")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        features: usize,
        barcodes: usize,
    },
    #[error("feature `{0}` is not present in this matrix")]
    MissingFeature(String),
    #[error("barcode `{0}` is not present in this matrix")]
    MissingBarcode(String),
    #[error("no {0} features were loaded")]
    MissingModality(FeatureType),
}

/// The data modalities a 10x feature matrix is split into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    Gex,
    Adt,
    Hto,
    Custom,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Gex => "gex",
            FeatureType::Adt => "adt",
            FeatureType::Hto => "hto",
            FeatureType::Custom => "custom",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureType {
    type Err = FeatureMatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gex" | "Gene Expression" => Ok(FeatureType::Gex),
            "adt" | "Antibody Capture" => Ok(FeatureType::Adt),
            "hto" => Ok(FeatureType::Hto),
            "custom" | "Custom" => Ok(FeatureType::Custom),
            _ => Err(FeatureMatrixError::UnknownFeatureType(s.to_string())),
        }
    }
}

/// A features x barcodes count matrix for a single modality, stored
/// in compressed sparse column format (so each outer vector is a cell).
#[derive(Clone, Debug)]
pub struct FeatureMatrix {
    pub features: Vec<String>,
    pub barcodes: Vec<String>,
    pub mat: CsMat<f64>,
}

impl FeatureMatrix {
    pub fn new(
        features: Vec<String>,
        barcodes: Vec<String>,
        mat: CsMat<f64>,
    ) -> Result<Self, FeatureMatrixError> {
        let (rows, cols) = mat.shape();
        if rows != features.len() || cols != barcodes.len() {
            return Err(FeatureMatrixError::ShapeMismatch {
                rows,
                cols,
                features: features.len(),
                barcodes: barcodes.len(),
            });
        }
        let mat = if mat.is_csc() { mat } else { mat.to_csc() };
        Ok(Self {
            features,
            barcodes,
            mat,
        })
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn num_barcodes(&self) -> usize {
        self.barcodes.len()
    }

    /// total UMI count of every barcode
    pub fn umi_sums(&self) -> Vec<f64> {
        self.mat
            .outer_iterator()
            .map(|col| col.iter().map(|(_, v)| *v).sum())
            .collect()
    }

    /// number of features with a non-zero count in every barcode
    pub fn num_unique(&self) -> Vec<usize> {
        self.mat
            .outer_iterator()
            .map(|col| col.iter().filter(|(_, v)| **v > 0.0).count())
            .collect()
    }

    /// per-barcode UMI sum restricted to the features whose index is in `rows`
    pub fn umi_sums_of(&self, rows: &HashSet<usize>) -> Vec<f64> {
        self.mat
            .outer_iterator()
            .map(|col| {
                col.iter()
                    .filter(|(r, _)| rows.contains(r))
                    .map(|(_, v)| *v)
                    .sum()
            })
            .collect()
    }

    /// The dense vector of counts for `feature` across all barcodes.
    pub fn feature_values(&self, feature: usize) -> Vec<f64> {
        let mut vals = vec![0.0f64; self.num_barcodes()];
        for (bc, col) in self.mat.outer_iterator().enumerate() {
            if let Some(v) = col.get(feature) {
                vals[bc] = *v;
            }
        }
        vals
    }

    /// Keep the barcodes at the given column indices (in the given order).
    pub fn select_barcodes(&self, keep: &[usize]) -> FeatureMatrix {
        let mut tri = TriMat::new((self.num_features(), keep.len()));
        for (new_col, &old_col) in keep.iter().enumerate() {
            if let Some(col) = self.mat.outer_view(old_col) {
                for (row, v) in col.iter() {
                    tri.add_triplet(row, new_col, *v);
                }
            }
        }
        FeatureMatrix {
            features: self.features.clone(),
            barcodes: keep.iter().map(|&i| self.barcodes[i].clone()).collect(),
            mat: tri.to_csc(),
        }
    }

    /// Keep only the named features (in the given order).
    pub fn select_features<S: AsRef<str>>(
        &self,
        keep: &[S],
    ) -> Result<FeatureMatrix, FeatureMatrixError> {
        let index: HashMap<&str, usize> = self
            .features
            .iter()
            .enumerate()
            .map(|(i, f)| (f.as_str(), i))
            .collect();
        let mut old_to_new = HashMap::with_capacity(keep.len());
        for (new_row, f) in keep.iter().enumerate() {
            let old_row = index
                .get(f.as_ref())
                .ok_or_else(|| FeatureMatrixError::MissingFeature(f.as_ref().to_string()))?;
            old_to_new.insert(*old_row, new_row);
        }

        let mut tri = TriMat::new((keep.len(), self.num_barcodes()));
        for (bc, col) in self.mat.outer_iterator().enumerate() {
            for (row, v) in col.iter() {
                if let Some(&new_row) = old_to_new.get(&row) {
                    tri.add_triplet(new_row, bc, *v);
                }
            }
        }
        Ok(FeatureMatrix {
            features: keep.iter().map(|f| f.as_ref().to_string()).collect(),
            barcodes: self.barcodes.clone(),
            mat: tri.to_csc(),
        })
    }
}

/// All modalities read from one 10x feature-barcode matrix. Every
/// present modality shares the same barcodes, in the same order.
#[derive(Clone, Debug, Default)]
pub struct FeatureData {
    pub gex: Option<FeatureMatrix>,
    pub adt: Option<FeatureMatrix>,
    pub hto: Option<FeatureMatrix>,
    pub custom: Option<FeatureMatrix>,
}

impl FeatureData {
    pub fn get(&self, ft: FeatureType) -> Option<&FeatureMatrix> {
        match ft {
            FeatureType::Gex => self.gex.as_ref(),
            FeatureType::Adt => self.adt.as_ref(),
            FeatureType::Hto => self.hto.as_ref(),
            FeatureType::Custom => self.custom.as_ref(),
        }
    }

    pub fn require(&self, ft: FeatureType) -> Result<&FeatureMatrix, FeatureMatrixError> {
        self.get(ft).ok_or(FeatureMatrixError::MissingModality(ft))
    }

    fn slot(&mut self, ft: FeatureType) -> &mut Option<FeatureMatrix> {
        match ft {
            FeatureType::Gex => &mut self.gex,
            FeatureType::Adt => &mut self.adt,
            FeatureType::Hto => &mut self.hto,
            FeatureType::Custom => &mut self.custom,
        }
    }

    /// the modalities present, in a fixed order
    pub fn modalities(&self) -> impl Iterator<Item = (FeatureType, &FeatureMatrix)> {
        [
            FeatureType::Gex,
            FeatureType::Adt,
            FeatureType::Hto,
            FeatureType::Custom,
        ]
        .into_iter()
        .filter_map(move |ft| self.get(ft).map(|m| (ft, m)))
    }

    pub fn barcodes(&self) -> &[String] {
        self.modalities()
            .next()
            .map(|(_, m)| m.barcodes.as_slice())
            .unwrap_or(&[])
    }

    fn map_all<F: Fn(&FeatureMatrix) -> FeatureMatrix>(&self, f: F) -> FeatureData {
        let mut out = FeatureData::default();
        for (ft, m) in self.modalities() {
            *out.slot(ft) = Some(f(m));
        }
        out
    }

    /// Keep the barcodes whose total UMI in modality `ft` lies within
    /// `[min_umi, max_umi]`; the same barcodes are kept in every modality.
    pub fn filter_barcodes_by_umi(
        &self,
        ft: FeatureType,
        min_umi: f64,
        max_umi: f64,
    ) -> Result<FeatureData, FeatureMatrixError> {
        let keep: Vec<usize> = self
            .require(ft)?
            .umi_sums()
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s >= min_umi && *s <= max_umi)
            .map(|(i, _)| i)
            .collect();
        Ok(self.map_all(|m| m.select_barcodes(&keep)))
    }

    /// Keep only the listed barcodes (in the given order) in every modality.
    pub fn filter_barcodes<S: AsRef<str>>(
        &self,
        keep: &[S],
    ) -> Result<FeatureData, FeatureMatrixError> {
        let index: HashMap<&str, usize> = self
            .barcodes()
            .iter()
            .enumerate()
            .map(|(i, b)| (b.as_str(), i))
            .collect();
        let cols = keep
            .iter()
            .map(|b| {
                index
                    .get(b.as_ref())
                    .copied()
                    .ok_or_else(|| FeatureMatrixError::MissingBarcode(b.as_ref().to_string()))
            })
            .collect::<Result<Vec<usize>, _>>()?;
        Ok(self.map_all(|m| m.select_barcodes(&cols)))
    }

    /// Keep only the listed features of a single modality.
    pub fn filter_features<S: AsRef<str>>(
        &self,
        ft: FeatureType,
        keep: &[S],
    ) -> Result<FeatureData, FeatureMatrixError> {
        let filtered = self.require(ft)?.select_features(keep)?;
        let mut out = self.clone();
        *out.slot(ft) = Some(filtered);
        Ok(out)
    }
}

/// Dense hashtag x barcode count table; hashtag panels are small, so
/// the table is stored row-major in a single vector.
#[derive(Clone, Debug, PartialEq)]
pub struct HashtagCounts {
    hashtags: Vec<String>,
    barcodes: Vec<String>,
    counts: Vec<f64>,
}

impl HashtagCounts {
    /// Build a table from row-major `counts`. Fails on an empty table or
    /// on any negative or non-finite count.
    pub fn new(
        hashtags: Vec<String>,
        barcodes: Vec<String>,
        counts: Vec<f64>,
    ) -> Result<Self, DehashError> {
        if hashtags.is_empty() || barcodes.is_empty() {
            return Err(DehashError::EmptyInput {
                hashtags: hashtags.len(),
                cells: barcodes.len(),
            });
        }
        if counts.len() != hashtags.len() * barcodes.len() {
            return Err(DehashError::InvariantViolation(format!(
                "expected {} x {} = {} counts, got {}",
                hashtags.len(),
                barcodes.len(),
                hashtags.len() * barcodes.len(),
                counts.len()
            )));
        }
        let ncol = barcodes.len();
        if let Some((i, v)) = counts
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(DehashError::InvalidCount {
                hashtag: hashtags[i / ncol].clone(),
                barcode: barcodes[i % ncol].clone(),
                value: *v,
            });
        }
        Ok(Self {
            hashtags,
            barcodes,
            counts,
        })
    }

    /// Densify the hashtag modality of a feature matrix.
    pub fn from_feature_matrix(fm: &FeatureMatrix) -> Result<Self, DehashError> {
        let nrow = fm.num_features();
        let ncol = fm.num_barcodes();
        let mut counts = vec![0.0f64; nrow * ncol];
        for (bc, col) in fm.mat.outer_iterator().enumerate() {
            for (row, v) in col.iter() {
                counts[row * ncol + bc] = *v;
            }
        }
        Self::new(fm.features.clone(), fm.barcodes.clone(), counts)
    }

    pub fn hashtags(&self) -> &[String] {
        &self.hashtags
    }

    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    pub fn num_hashtags(&self) -> usize {
        self.hashtags.len()
    }

    pub fn num_cells(&self) -> usize {
        self.barcodes.len()
    }

    #[inline(always)]
    pub fn get(&self, hashtag: usize, cell: usize) -> f64 {
        self.counts[hashtag * self.barcodes.len() + cell]
    }

    /// counts of one hashtag across all cells
    pub fn row(&self, hashtag: usize) -> &[f64] {
        let ncol = self.barcodes.len();
        &self.counts[hashtag * ncol..(hashtag + 1) * ncol]
    }

    /// counts of all hashtags for one cell
    pub fn column(&self, cell: usize) -> Vec<f64> {
        (0..self.num_hashtags()).map(|h| self.get(h, cell)).collect()
    }

    pub fn hashtag_index(&self, name: &str) -> Option<usize> {
        self.hashtags.iter().position(|h| h == name)
    }
}

struct FeatureLine {
    id: String,
    name: String,
    ftype: FeatureType,
}

/// Map the type column of `features.tsv` to a modality. Features named in
/// the hashtag list become hashtags whether cellranger typed them
/// `Custom` or `Antibody Capture`; the remaining `Custom` features of
/// such a run are treated as antibodies.
fn classify_feature(
    id: &str,
    raw_type: &str,
    hto_set: Option<&HashSet<&str>>,
) -> Result<FeatureType, FeatureMatrixError> {
    let ft = FeatureType::from_str(raw_type)?;
    Ok(match (ft, hto_set) {
        (FeatureType::Custom, Some(hs)) | (FeatureType::Adt, Some(hs)) => {
            if hs.contains(id) {
                FeatureType::Hto
            } else {
                FeatureType::Adt
            }
        }
        (ft, _) => ft,
    })
}

/// Read a (possibly gzipped) Matrix Market file as `f64` counts. sprs only
/// loads `integer` files into integer matrices, so the header decides
/// which element type is read.
pub fn read_count_matrix(p: &Path) -> anyhow::Result<TriMat<f64>> {
    let mut br = dfutils::open_maybe_gz(p)?;
    let mut header = String::new();
    br.read_line(&mut header)
        .with_context(|| format!("could not read the header of {}", p.display()))?;
    let mut rdr = Cursor::new(header.clone().into_bytes()).chain(br);

    if header.to_lowercase().contains("integer") {
        let counts: TriMatI<i64, usize> = sprs::io::read_matrix_market_from_bufread(&mut rdr)
            .with_context(|| format!("could not parse matrix market file {}", p.display()))?;
        let mut tri = TriMat::with_capacity(counts.shape(), counts.nnz());
        for (v, (row, col)) in counts.triplet_iter() {
            tri.add_triplet(row, col, *v as f64);
        }
        Ok(tri)
    } else {
        let tri: TriMat<f64> = sprs::io::read_matrix_market_from_bufread(&mut rdr)
            .with_context(|| format!("could not parse matrix market file {}", p.display()))?;
        Ok(tri)
    }
}

/// Load a cellranger (v3+) `barcodes/features/matrix` directory and split
/// it into its modalities. Each of the three files may be gzipped.
pub fn load_feature_matrix(opts: &LoadMatrixOpts) -> anyhow::Result<FeatureData> {
    let log = opts.log;
    let dir = opts.input_dir.as_path();

    // barcodes
    let bc_path = dfutils::resolve_maybe_gz(dir, dfconst::BARCODES_FILE)?;
    let bc_rows = dfutils::read_tsv_lines(&bc_path)?;
    let drop_lane = opts.drop_default_lane || opts.add_lane.is_some();
    let mut warned = false;
    let barcodes: Vec<String> = bc_rows
        .iter()
        .map(|r| {
            let bc = r[0].as_str();
            let bc = if drop_lane {
                let (stripped, had_lane) = dfutils::strip_lane(bc);
                if !had_lane && !warned {
                    warn!(
                        log,
                        "did not find the cellranger lane suffix ({}) in {}",
                        dfconst::DEFAULT_LANE_SUFFIX,
                        bc
                    );
                    warned = true;
                }
                stripped
            } else {
                bc
            };
            match &opts.add_lane {
                Some(lane) => format!("{}-{}", bc, lane),
                None => bc.to_string(),
            }
        })
        .collect();

    // features
    let ft_path = dfutils::resolve_maybe_gz(dir, dfconst::FEATURES_FILE)?;
    let hto_set: Option<HashSet<&str>> = opts
        .hto_list
        .as_ref()
        .map(|l| l.iter().map(|s| s.as_str()).collect());
    let mut feature_lines = Vec::new();
    for (i, r) in dfutils::read_tsv_lines(&ft_path)?.into_iter().enumerate() {
        if r.len() < 3 {
            return Err(FeatureMatrixError::MalformedFeatureLine(i + 1, r.join("\t")).into());
        }
        let ftype = classify_feature(&r[0], &r[2], hto_set.as_ref())?;
        feature_lines.push(FeatureLine {
            id: r[0].clone(),
            name: r[1].clone(),
            ftype,
        });
    }

    // matrix
    let mtx_path = dfutils::resolve_maybe_gz(dir, dfconst::MATRIX_FILE)?;
    let tri = read_count_matrix(&mtx_path)?;
    let (nrows, ncols) = tri.shape();
    if nrows != feature_lines.len() || ncols != barcodes.len() {
        return Err(FeatureMatrixError::ShapeMismatch {
            rows: nrows,
            cols: ncols,
            features: feature_lines.len(),
            barcodes: barcodes.len(),
        }
        .into());
    }
    info!(
        log,
        "read {} x {} feature-barcode matrix with {} non-zero entries.",
        nrows.to_formatted_string(&Locale::en),
        ncols.to_formatted_string(&Locale::en),
        tri.nnz().to_formatted_string(&Locale::en)
    );

    // assign every feature a row within its modality
    let mut per_type: HashMap<FeatureType, Vec<usize>> = HashMap::new();
    let mut row_in_type = vec![0usize; feature_lines.len()];
    for (i, fl) in feature_lines.iter().enumerate() {
        let rows = per_type.entry(fl.ftype).or_default();
        row_in_type[i] = rows.len();
        rows.push(i);
    }

    let mut tris: HashMap<FeatureType, TriMat<f64>> = per_type
        .iter()
        .map(|(ft, rows)| (*ft, TriMat::new((rows.len(), ncols))))
        .collect();
    for (v, (row, col)) in tri.triplet_iter() {
        let ft = feature_lines[row].ftype;
        if let Some(t) = tris.get_mut(&ft) {
            t.add_triplet(row_in_type[row], col, *v);
        }
    }

    let mut fdata = FeatureData::default();
    for (ft, rows) in per_type.iter() {
        let id_name: Vec<(String, String)> = rows
            .iter()
            .map(|&i| (feature_lines[i].id.clone(), feature_lines[i].name.clone()))
            .collect();
        let names = dfutils::unique_feature_names(&id_name);
        let mat = match tris.remove(ft) {
            Some(t) => t.to_csc(),
            None => continue,
        };
        info!(
            log,
            "{} : {} features x {} barcodes",
            ft,
            names.len(),
            barcodes.len().to_formatted_string(&Locale::en)
        );
        *fdata.slot(*ft) = Some(FeatureMatrix::new(names, barcodes.clone(), mat)?);
    }
    Ok(fdata)
}
