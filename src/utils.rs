/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */
use crate::constants as dfconst;
use anyhow::Context;
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// The variance-stabilizing "ash" transform used throughout,
/// `asinh(x / 5)`.
#[inline(always)]
pub fn ash(x: f64) -> f64 {
    (x / dfconst::ASH_COFACTOR).asinh()
}

/// Inverse of [`ash`]; maps an ash-scale value back to the UMI scale.
#[inline(always)]
pub fn inv_ash(a: f64) -> f64 {
    a.sinh() * dfconst::ASH_COFACTOR
}

/// replace +/- infinity with `inf_replace` (keeping the sign),
/// leave every other value untouched.
#[inline(always)]
pub fn cap_infinite(x: f64, inf_replace: f64) -> f64 {
    if x == f64::INFINITY {
        inf_replace
    } else if x == f64::NEG_INFINITY {
        -inf_replace
    } else {
        x
    }
}

/// Given a path that may or may not carry a `.gz` extension, return
/// the path that exists on disk, preferring the gzipped version.
pub fn resolve_maybe_gz(dir: &Path, fname: &str) -> anyhow::Result<PathBuf> {
    let gz = dir.join(format!("{}.gz", fname));
    if gz.exists() {
        return Ok(gz);
    }
    let plain = dir.join(fname);
    if plain.exists() {
        return Ok(plain);
    }
    anyhow::bail!(
        "neither {} nor {} exists",
        plain.display(),
        gz.display()
    )
}

/// Open `p` for buffered reading, transparently decompressing it if the
/// file name ends in `.gz`.
pub fn open_maybe_gz(p: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let f = File::open(p).with_context(|| format!("could not open {}", p.display()))?;
    let is_gz = p.extension().map(|e| e == "gz").unwrap_or(false);
    let rdr: Box<dyn Read> = if is_gz {
        Box::new(MultiGzDecoder::new(f))
    } else {
        Box::new(f)
    };
    Ok(Box::new(BufReader::new(rdr)))
}

/// Read the tab-separated lines of a (possibly gzipped) file, splitting
/// each into its fields. Empty lines are skipped.
pub fn read_tsv_lines(p: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let br = open_maybe_gz(p)?;
    let mut rows = Vec::new();
    for l in br.lines() {
        let line = l.with_context(|| format!("could not read line from {}", p.display()))?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        rows.push(line.split('\t').map(|s| s.to_string()).collect());
    }
    Ok(rows)
}

/// Remove the cellranger lane suffix (everything after the first `-`)
/// from a barcode. Returns the barcode and whether a suffix was found.
pub fn strip_lane(bc: &str) -> (&str, bool) {
    match bc.split_once('-') {
        Some((b, _)) => (b, true),
        None => (bc, false),
    }
}

/// Build unique feature names from (id, name) pairs. Names that occur
/// more than once get the feature id appended, and the TotalSeq-B
/// suffix is dropped.
pub fn unique_feature_names(id_name: &[(String, String)]) -> Vec<String> {
    let mut name_count: HashMap<&str, usize, ahash::RandomState> =
        HashMap::with_hasher(ahash::RandomState::with_seeds(2u64, 7u64, 1u64, 8u64));
    for (_, name) in id_name {
        *name_count.entry(name.as_str()).or_insert(0) += 1;
    }

    id_name
        .iter()
        .map(|(id, name)| {
            let n = if name_count[name.as_str()] > 1 {
                format!("{}_{}", name, id)
            } else {
                name.clone()
            };
            n.replace(dfconst::TOTALSEQB_SUFFIX, "")
        })
        .collect()
}

/// Returns the subset of `genes` that are mitochondrial; either their
/// name begins with `mt-` (ignoring case) or the part of the name before
/// the first `_` is one of the known nuclear-encoded MT genes.
pub fn get_mito_genes<S: AsRef<str>>(genes: &[S]) -> Vec<String> {
    genes
        .iter()
        .map(|g| g.as_ref())
        .filter(|g| {
            let lower = g.to_lowercase();
            let prefix = lower.split('_').next().unwrap_or("");
            lower.starts_with("mt-")
                || dfconst::MITO_GENE_LIST
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(prefix))
        })
        .map(|g| g.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::utils::{ash, cap_infinite, get_mito_genes, inv_ash, strip_lane};
    use crate::utils::unique_feature_names;

    #[test]
    fn test_ash_round_trip() {
        for x in [0.0, 1.0, 5.0, 100.0, 12345.0] {
            assert!((inv_ash(ash(x)) - x).abs() < 1e-6 * x.max(1.0));
        }
        assert_eq!(ash(0.0), 0.0);
        assert!((ash(5.0) - 1.0f64.asinh()).abs() < 1e-12);
    }

    #[test]
    fn test_cap_infinite() {
        assert_eq!(cap_infinite(f64::INFINITY, 1000.0), 1000.0);
        assert_eq!(cap_infinite(f64::NEG_INFINITY, 1000.0), -1000.0);
        assert_eq!(cap_infinite(3.5, 1000.0), 3.5);
        assert!(cap_infinite(f64::NAN, 1000.0).is_nan());
    }

    #[test]
    fn test_strip_lane() {
        assert_eq!(strip_lane("AAACCTGAGAAACCAT-1"), ("AAACCTGAGAAACCAT", true));
        assert_eq!(strip_lane("AAACCTGAGAAACCAT"), ("AAACCTGAGAAACCAT", false));
    }

    #[test]
    fn test_unique_feature_names() {
        let fts = vec![
            ("ENSG1".to_string(), "CD4".to_string()),
            ("ENSG2".to_string(), "TIGIT".to_string()),
            ("ENSG3".to_string(), "TIGIT".to_string()),
            ("HTO1".to_string(), "HTO1_TotalSeqB".to_string()),
        ];
        assert_eq!(
            unique_feature_names(&fts),
            vec!["CD4", "TIGIT_ENSG2", "TIGIT_ENSG3", "HTO1"]
        );
    }

    #[test]
    fn test_get_mito_genes() {
        let genes = ["MT-CO1", "mt-Nd1", "MTRNR2L8", "MTRF1L_2", "CD3E", "SMT-1"];
        assert_eq!(
            get_mito_genes(&genes),
            vec!["MT-CO1", "mt-Nd1", "MTRNR2L8", "MTRF1L_2"]
        );
    }
}
