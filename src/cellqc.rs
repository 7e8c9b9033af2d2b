/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

use anyhow::Context;
use num_format::{Locale, ToFormattedString};
use serde_json::json;
use slog::{info, warn};
use std::collections::HashSet;

use crate::constants as dfconst;
use crate::dehash::DehashError;
use crate::feature_matrix::{self, FeatureData, FeatureMatrix, FeatureType};
use crate::io_utils;
use crate::metadata::CellMetadata;
use crate::prog_opts::CellQcOpts;
use crate::utils as dfutils;

pub const DEAD_CELL: &str = "dead-cell";
pub const LIVE_CELL: &str = "live-cell";

/// Per-barcode totals of one modality.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSums {
    pub umi_sum: Vec<f64>,
    pub umi_sum_ash: Vec<f64>,
    pub num_unique: Vec<usize>,
}

pub fn feature_sums(fm: &FeatureMatrix) -> FeatureSums {
    let umi_sum = fm.umi_sums();
    let umi_sum_ash = umi_sum.iter().map(|s| dfutils::ash(*s)).collect();
    FeatureSums {
        umi_sum,
        umi_sum_ash,
        num_unique: fm.num_unique(),
    }
}

fn positions(fm: &FeatureMatrix, cell_meta: &CellMetadata) -> Result<Vec<usize>, DehashError> {
    fm.barcodes
        .iter()
        .map(|b| {
            cell_meta
                .position(b)
                .ok_or_else(|| DehashError::UnknownBarcode(b.clone()))
        })
        .collect()
}

/// Record the UMI sum, its ash and the number of detected features of
/// every modality (gex, adt, hto) in the cell metadata.
pub fn add_feature_sums(
    fdata: &FeatureData,
    cell_meta: &mut CellMetadata,
) -> Result<(), DehashError> {
    for (ft, fm) in fdata.modalities() {
        if ft == FeatureType::Custom {
            continue;
        }
        let sums = feature_sums(fm);
        let pos = positions(fm, cell_meta)?;
        for (i, p) in pos.into_iter().enumerate() {
            let rec = cell_meta.record_at_mut(p);
            let (s, a, n) = (
                Some(sums.umi_sum[i]),
                Some(sums.umi_sum_ash[i]),
                Some(sums.num_unique[i]),
            );
            match ft {
                FeatureType::Gex => {
                    rec.gex_umi_sum = s;
                    rec.gex_umi_sum_ash = a;
                    rec.gex_num_unique = n;
                }
                FeatureType::Adt => {
                    rec.adt_umi_sum = s;
                    rec.adt_umi_sum_ash = a;
                    rec.adt_num_unique = n;
                }
                FeatureType::Hto => {
                    rec.hto_umi_sum = s;
                    rec.hto_umi_sum_ash = a;
                    rec.hto_num_unique = n;
                }
                FeatureType::Custom => {}
            }
        }
    }
    Ok(())
}

/// Proportion of gene-expression UMIs coming from mitochondrial genes,
/// and the dead / live call that follows from it. Barcodes without any
/// gene-expression UMI get a NaN proportion and are called live.
/// Returns the number of dead cells.
pub fn mito_proportion_and_dead(
    gex: &FeatureMatrix,
    cell_meta: &mut CellMetadata,
    mito_thresh: f64,
    log: &slog::Logger,
) -> Result<usize, DehashError> {
    let mito_genes: HashSet<String> = dfutils::get_mito_genes(&gex.features).into_iter().collect();
    if mito_genes.is_empty() {
        warn!(log, "no mitochondrial genes were found among the gene expression features");
    } else {
        info!(log, "found {} mitochondrial genes", mito_genes.len());
    }
    let mito_rows: HashSet<usize> = gex
        .features
        .iter()
        .enumerate()
        .filter(|(_, g)| mito_genes.contains(*g))
        .map(|(i, _)| i)
        .collect();
    let mito_sum = gex.umi_sums_of(&mito_rows);
    let gex_sum = gex.umi_sums();

    let mut num_dead = 0usize;
    for (i, p) in positions(gex, cell_meta)?.into_iter().enumerate() {
        let rec = cell_meta.record_at_mut(p);
        let total = rec.gex_umi_sum.unwrap_or(gex_sum[i]);
        let prop = mito_sum[i] / total;
        let state = if prop >= mito_thresh {
            num_dead += 1;
            DEAD_CELL
        } else {
            LIVE_CELL
        };
        rec.gex_mito_proportion = Some(prop);
        rec.dead_cell_mito = Some(state.to_string());
    }
    info!(
        log,
        "{} suspected dead cells (mito proportion >= {})",
        num_dead.to_formatted_string(&Locale::en),
        mito_thresh
    );
    Ok(num_dead)
}

/// Barcodes whose gene-expression ash UMI sum reaches `ash_thresh`.
pub fn gex_debris_keep(cell_meta: &CellMetadata, ash_thresh: f64, log: &slog::Logger) -> Vec<String> {
    let keep: Vec<String> = cell_meta
        .records()
        .iter()
        .filter(|r| r.gex_umi_sum_ash.map(|a| a >= ash_thresh).unwrap_or(false))
        .map(|r| r.barcode.clone())
        .collect();
    info!(
        log,
        "gex-ash-umi thresh {} ; gex-umi thresh {:.1} ; keeping {} cells",
        ash_thresh,
        dfutils::inv_ash(ash_thresh),
        keep.len().to_formatted_string(&Locale::en)
    );
    keep
}

/// Barcodes passing the gene-expression or the hashtag ash UMI
/// threshold (or both), sorted.
pub fn drop_debris_gex_hto_ash(
    cell_meta: &CellMetadata,
    gex_ash_thresh: f64,
    hto_ash_thresh: f64,
    log: &slog::Logger,
) -> Vec<String> {
    let passes = |v: Option<f64>, t: f64| v.map(|a| a >= t).unwrap_or(false);
    let mut num_gex = 0usize;
    let mut num_hto = 0usize;
    let mut keep = Vec::new();
    for r in cell_meta.records() {
        let g = passes(r.gex_umi_sum_ash, gex_ash_thresh);
        let h = passes(r.hto_umi_sum_ash, hto_ash_thresh);
        num_gex += g as usize;
        num_hto += h as usize;
        if g || h {
            keep.push(r.barcode.clone());
        }
    }
    keep.sort();
    info!(
        log,
        "gex thresh UMI-ash {} (UMI {:.0}) keeps {} ; hto thresh UMI-ash {} (UMI {:.0}) keeps {}",
        gex_ash_thresh,
        dfutils::inv_ash(gex_ash_thresh),
        num_gex.to_formatted_string(&Locale::en),
        hto_ash_thresh,
        dfutils::inv_ash(hto_ash_thresh),
        num_hto.to_formatted_string(&Locale::en)
    );
    info!(
        log,
        "keeping {} barcodes",
        keep.len().to_formatted_string(&Locale::en)
    );
    keep
}

/// Load a 10x matrix, compute the per-cell QC metrics and write them,
/// along with the list of barcodes that survive debris removal.
pub fn cell_qc(opts: &CellQcOpts) -> anyhow::Result<usize> {
    let log = opts.log;
    let fdata = feature_matrix::load_feature_matrix(&opts.load)?;
    let mut cell_meta = CellMetadata::from_barcodes(fdata.barcodes())?;

    add_feature_sums(&fdata, &mut cell_meta)?;
    if let Some(gex) = fdata.gex.as_ref() {
        mito_proportion_and_dead(gex, &mut cell_meta, opts.mito_thresh, log)?;
    } else {
        warn!(log, "no gene expression features; skipping the mitochondrial dead-cell call");
    }

    let keep = match (opts.gex_ash_thresh, opts.hto_ash_thresh) {
        (Some(g), Some(h)) => Some(drop_debris_gex_hto_ash(&cell_meta, g, h, log)),
        (Some(g), None) => Some(gex_debris_keep(&cell_meta, g, log)),
        (None, Some(_)) => {
            warn!(log, "a hashtag ash threshold without a gene expression threshold is ignored");
            None
        }
        (None, None) => None,
    };

    std::fs::create_dir_all(opts.output_dir)
        .with_context(|| format!("could not create {}", opts.output_dir.display()))?;
    io_utils::write_cell_metadata(&opts.output_dir.join(dfconst::CELL_QC_FILE), &cell_meta)?;

    let num_kept = match keep {
        Some(k) => {
            io_utils::write_barcode_list(&opts.output_dir.join(dfconst::KEEP_BARCODES_FILE), &k)?;
            k.len()
        }
        None => cell_meta.len(),
    };

    let meta_info = json!({
        "version_str" : opts.version,
        "cmd" : opts.cmdline,
        "num_barcodes" : cell_meta.len(),
        "num_kept" : num_kept,
        "cell_qc_options" : opts,
    });
    io_utils::write_json(&opts.output_dir.join(dfconst::CELL_QC_JSON_FILE), &meta_info)?;

    Ok(num_kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn discard_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn gex() -> FeatureMatrix {
        // genes x 3 barcodes
        let mut tri = TriMat::new((3, 3));
        tri.add_triplet(0, 0, 9.0);
        tri.add_triplet(1, 0, 1.0);
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(2, 1, 1.0);
        FeatureMatrix::new(
            vec!["MT-CO1".to_string(), "CD3E".to_string(), "MTRNR2L8".to_string()],
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            tri.to_csc(),
        )
        .unwrap()
    }

    #[test]
    fn test_feature_sums_into_metadata() {
        let fd = FeatureData {
            gex: Some(gex()),
            ..Default::default()
        };
        let mut cm = CellMetadata::from_barcodes(&["A", "B", "C", "D"]).unwrap();
        add_feature_sums(&fd, &mut cm).unwrap();
        let a = cm.get("A").unwrap();
        assert_eq!(a.gex_umi_sum, Some(10.0));
        assert_eq!(a.gex_umi_sum_ash, Some(dfutils::ash(10.0)));
        assert_eq!(a.gex_num_unique, Some(2));
        assert_eq!(cm.get("C").unwrap().gex_umi_sum, Some(0.0));
        assert_eq!(cm.get("D").unwrap().gex_umi_sum, None);
        assert!(cm.get("A").unwrap().hto_umi_sum.is_none());

        let mut small = CellMetadata::from_barcodes(&["A"]).unwrap();
        assert!(matches!(
            add_feature_sums(&fd, &mut small),
            Err(DehashError::UnknownBarcode(_))
        ));
    }

    #[test]
    fn test_mito_dead_call() {
        let g = gex();
        let mut cm = CellMetadata::from_barcodes(&["A", "B", "C"]).unwrap();
        let n = mito_proportion_and_dead(&g, &mut cm, 0.9, &discard_log()).unwrap();
        assert_eq!(n, 2);
        let a = cm.get("A").unwrap();
        assert_eq!(a.gex_mito_proportion, Some(0.9));
        assert_eq!(a.dead_cell_mito.as_deref(), Some(DEAD_CELL));
        // both of B's genes are mitochondrial
        assert_eq!(cm.get("B").unwrap().gex_mito_proportion, Some(1.0));

        let n = mito_proportion_and_dead(&g, &mut cm, 0.95, &discard_log()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(cm.get("A").unwrap().dead_cell_mito.as_deref(), Some(LIVE_CELL));
        let c = cm.get("C").unwrap();
        assert!(c.gex_mito_proportion.unwrap().is_nan());
        assert_eq!(c.dead_cell_mito.as_deref(), Some(LIVE_CELL));
    }

    #[test]
    fn test_debris_filters() {
        let mut cm = CellMetadata::from_barcodes(&["C", "A", "B", "D"]).unwrap();
        cm.get_mut("A").unwrap().gex_umi_sum_ash = Some(3.0);
        cm.get_mut("B").unwrap().gex_umi_sum_ash = Some(1.0);
        cm.get_mut("B").unwrap().hto_umi_sum_ash = Some(2.5);
        cm.get_mut("C").unwrap().gex_umi_sum_ash = Some(2.0);
        cm.get_mut("C").unwrap().hto_umi_sum_ash = Some(2.0);
        let log = discard_log();
        assert_eq!(gex_debris_keep(&cm, 2.0, &log), vec!["C", "A"]);
        assert_eq!(drop_debris_gex_hto_ash(&cm, 2.5, 2.5, &log), vec!["A", "B"]);
        assert_eq!(
            drop_debris_gex_hto_ash(&cm, 2.0, 2.0, &log),
            vec!["A", "B", "C"]
        );
    }
}
