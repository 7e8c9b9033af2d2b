/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

//! Custom clonotypes from V(D)J contig annotations: contigs are defined by
//! their V, D and J genes and CDR3 (the constant gene is ignored), every
//! barcode is described by the combination of its contigs, and combinations
//! are numbered by how many barcodes share them.

use anyhow::{anyhow, Context};
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use slog::info;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::constants as dfconst;
use crate::io_utils;
use crate::prog_opts::ClonotypeOpts;

const MISSING_GENE: &str = "None";

/// The columns of a contig annotation table that are used here; any
/// other column is ignored.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Contig {
    pub barcode: String,
    #[serde(default)]
    pub productive: Option<String>,
    #[serde(default)]
    pub v_gene: Option<String>,
    #[serde(default)]
    pub d_gene: Option<String>,
    #[serde(default)]
    pub j_gene: Option<String>,
    #[serde(default)]
    pub c_gene: Option<String>,
    #[serde(default)]
    pub cdr3: Option<String>,
}

impl Contig {
    pub fn is_productive(&self) -> bool {
        matches!(self.productive.as_deref(), Some("True") | Some("true"))
    }

    /// `v_d_j_cdr3`; absent values are written as `None`
    pub fn key(&self) -> String {
        [&self.v_gene, &self.d_gene, &self.j_gene, &self.cdr3]
            .iter()
            .map(|g| g.as_deref().unwrap_or(MISSING_GENE))
            .join("_")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clonotype {
    pub barcode: String,
    #[serde(rename = "contig-combo")]
    pub combo: String,
    #[serde(rename = "custom-clonotype")]
    pub clone: String,
}

/// Read a contig annotation CSV keeping only its productive contigs.
pub fn load_productive_contigs(p: &Path, log: &slog::Logger) -> anyhow::Result<Vec<Contig>> {
    let mut rdr = csv::Reader::from_path(p)
        .with_context(|| format!("could not open contig annotations {}", p.display()))?;
    let mut all = 0usize;
    let mut prod = Vec::new();
    for r in rdr.deserialize() {
        let c: Contig = r.with_context(|| format!("could not parse a contig of {}", p.display()))?;
        all += 1;
        if c.is_productive() {
            prod.push(c);
        }
    }
    info!(
        log,
        "{} : {} contigs, {} productive",
        p.display(),
        all.to_formatted_string(&Locale::en),
        prod.len().to_formatted_string(&Locale::en)
    );
    Ok(prod)
}

/// The distinct contig keys, sorted.
pub fn unique_contigs(contigs: &[Contig]) -> Vec<String> {
    contigs.iter().map(|c| c.key()).sorted().dedup().collect()
}

/// Map every contig key to `contig-id-<i>`, `i` being its rank in
/// `unique`.
pub fn assign_contig_ids(unique: &[String]) -> HashMap<String, String> {
    unique
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), format!("contig-id-{}", i)))
        .collect()
}

/// The contig ids of every barcode.
pub fn barcode_contig_combos(
    contigs: &[Contig],
    contig_ids: &HashMap<String, String>,
) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let mut combos: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for c in contigs {
        let key = c.key();
        let id = contig_ids
            .get(&key)
            .ok_or_else(|| anyhow!("contig {} has no id", key))?;
        combos.entry(c.barcode.clone()).or_default().push(id.clone());
    }
    Ok(combos)
}

/// Name each distinct contig combination `custom-clone-<n>`, numbering
/// combinations from the most to the least common (ties broken by the
/// combination itself), and return the clone of every barcode.
pub fn generate_clonotypes(combos: &BTreeMap<String, Vec<String>>) -> Vec<Clonotype> {
    let bc_combo: Vec<(&String, String)> = combos
        .iter()
        .map(|(bc, ids)| (bc, ids.iter().sorted().join("_")))
        .collect();

    let clone_names: HashMap<&str, String> = bc_combo
        .iter()
        .map(|(_, combo)| combo.as_str())
        .counts()
        .into_iter()
        .sorted_by(|(ca, na), (cb, nb)| nb.cmp(na).then_with(|| ca.cmp(cb)))
        .enumerate()
        .map(|(i, (combo, _))| (combo, format!("custom-clone-{}", i + 1)))
        .collect();

    bc_combo
        .iter()
        .map(|(bc, combo)| Clonotype {
            barcode: (*bc).clone(),
            clone: clone_names[combo.as_str()].clone(),
            combo: combo.clone(),
        })
        .collect()
}

/// Read every contig annotation table, build the custom clonotypes and
/// write them out. Returns the number of distinct clonotypes.
pub fn clonotype(opts: &ClonotypeOpts) -> anyhow::Result<usize> {
    let log = opts.log;
    let mut contigs = Vec::new();
    for p in opts.contig_files.iter() {
        contigs.extend(load_productive_contigs(p, log)?);
    }
    let unique = unique_contigs(&contigs);
    info!(
        log,
        "{} unique contigs",
        unique.len().to_formatted_string(&Locale::en)
    );
    let ids = assign_contig_ids(&unique);
    let combos = barcode_contig_combos(&contigs, &ids)?;
    let clones = generate_clonotypes(&combos);
    let num_clones = clones.iter().map(|c| c.clone.as_str()).unique().count();
    info!(
        log,
        "{} barcodes in {} custom clonotypes",
        clones.len().to_formatted_string(&Locale::en),
        num_clones.to_formatted_string(&Locale::en)
    );

    std::fs::create_dir_all(opts.output_dir)
        .with_context(|| format!("could not create {}", opts.output_dir.display()))?;
    io_utils::write_csv_records(&opts.output_dir.join(dfconst::CLONOTYPE_FILE), &clones)?;
    Ok(num_clones)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contig(bc: &str, v: &str, d: Option<&str>, j: &str, cdr3: &str) -> Contig {
        Contig {
            barcode: bc.to_string(),
            productive: Some("True".to_string()),
            v_gene: Some(v.to_string()),
            d_gene: d.map(|s| s.to_string()),
            j_gene: Some(j.to_string()),
            c_gene: Some("IGHM".to_string()),
            cdr3: Some(cdr3.to_string()),
        }
    }

    #[test]
    fn test_contig_key_ignores_c_gene() {
        let mut a = contig("A", "TRAV1", None, "TRAJ2", "CAVR");
        assert_eq!(a.key(), "TRAV1_None_TRAJ2_CAVR");
        a.c_gene = Some("TRAC".to_string());
        assert_eq!(a.key(), "TRAV1_None_TRAJ2_CAVR");
        a.productive = Some("False".to_string());
        assert!(!a.is_productive());
        a.productive = Some("true".to_string());
        assert!(a.is_productive());
    }

    #[test]
    fn test_clonotypes_ranked_by_abundance() {
        let contigs = vec![
            contig("A", "V1", None, "J1", "C1"),
            contig("A", "V2", Some("D1"), "J2", "C2"),
            contig("B", "V2", Some("D1"), "J2", "C2"),
            contig("B", "V1", None, "J1", "C1"),
            contig("C", "V3", None, "J3", "C3"),
            contig("D", "V3", None, "J3", "C3"),
            contig("E", "V3", None, "J3", "C3"),
            contig("F", "V1", None, "J1", "C1"),
        ];
        let unique = unique_contigs(&contigs);
        assert_eq!(unique.len(), 3);
        let ids = assign_contig_ids(&unique);
        assert_eq!(ids["V1_None_J1_C1"], "contig-id-0");
        let combos = barcode_contig_combos(&contigs, &ids).unwrap();
        let clones = generate_clonotypes(&combos);
        let by_bc: HashMap<&str, &Clonotype> =
            clones.iter().map(|c| (c.barcode.as_str(), c)).collect();

        assert_eq!(by_bc["C"].clone, "custom-clone-1");
        assert_eq!(by_bc["E"].clone, "custom-clone-1");
        // A and B share a combination regardless of contig order
        assert_eq!(by_bc["A"].combo, "contig-id-0_contig-id-1");
        assert_eq!(by_bc["A"].clone, "custom-clone-2");
        assert_eq!(by_bc["B"].clone, "custom-clone-2");
        assert_eq!(by_bc["F"].clone, "custom-clone-3");
    }
}
