/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

/// cofactor of the arcsinh ("ash") transform applied to UMI counts
pub const ASH_COFACTOR: f64 = 5.0;

/// sample placeholder for barcodes that are not singlets
pub const NO_SAMPLE: &str = "N.A.";

/// default value standing in for infinite ratios in aggregate statistics
pub const DEFAULT_INF_REPLACE: f64 = 1000.0;

pub const DEFAULT_MITO_THRESH: f64 = 0.9;

/// suffix cellranger appends to every barcode of a single-lane run
pub const DEFAULT_LANE_SUFFIX: &str = "-1";

pub const TOTALSEQB_SUFFIX: &str = "_TotalSeqB";

pub const BARCODES_FILE: &str = "barcodes.tsv";
pub const FEATURES_FILE: &str = "features.tsv";
pub const MATRIX_FILE: &str = "matrix.mtx";

pub const CELL_META_FILE: &str = "cell_meta.csv";
pub const SIGNAL_NOISE_FILE: &str = "signal_vs_noise.csv";
pub const DEHASH_JSON_FILE: &str = "dehash.json";
pub const REFINE_JSON_FILE: &str = "refine.json";
pub const CELL_QC_FILE: &str = "cell_qc.csv";
pub const CELL_QC_JSON_FILE: &str = "cell_qc.json";
pub const KEEP_BARCODES_FILE: &str = "keep_barcodes.txt";
pub const CLONOTYPE_FILE: &str = "clonotypes.csv";

// genes whose prefix (before an `_`) marks them as mitochondrial even
// though they lack the `MT-` prefix
pub const MITO_GENE_LIST: [&str; 13] = [
    "MTRNR2L11",
    "MTRF1",
    "MTRNR2L12",
    "MTRNR2L13",
    "MTRF1L",
    "MTRNR2L6",
    "MTRNR2L7",
    "MTRNR2L10",
    "MTRNR2L8",
    "MTRNR2L5",
    "MTRNR2L1",
    "MTRNR2L3",
    "MTRNR2L4",
];
