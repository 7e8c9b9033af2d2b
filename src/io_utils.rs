/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

//! readers and writers for the tables passed between subcommands

use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::feature_matrix::{self, FeatureType, HashtagCounts};
use crate::metadata::{
    CellClass, CellMetadata, CellRecord, HashtagMetadata, HashtagRecord, LABEL_COLUMNS,
};
use crate::prog_opts::CountSource;
use crate::utils as dfutils;

fn csv_reader(p: &Path) -> anyhow::Result<csv::Reader<Box<dyn std::io::BufRead>>> {
    let br = dfutils::open_maybe_gz(p)?;
    Ok(csv::ReaderBuilder::new().has_headers(true).from_reader(br))
}

/// Read the hashtag metadata table (`hto,Sample[,hto-threshold-ash[,hto-threshold-umi]]`).
pub fn read_hashtag_metadata(p: &Path) -> anyhow::Result<HashtagMetadata> {
    let mut rdr = csv_reader(p)?;
    let mut records = Vec::new();
    for r in rdr.deserialize() {
        let rec: HashtagRecord =
            r.with_context(|| format!("could not parse hashtag metadata {}", p.display()))?;
        records.push(rec);
    }
    Ok(HashtagMetadata::from_records(records)?)
}

pub fn write_hashtag_metadata(p: &Path, hto_meta: &HashtagMetadata) -> anyhow::Result<()> {
    write_csv_records(p, hto_meta.records())
}

/// Read a cell metadata table written by a previous pass. Classification
/// labels are checked before the rows are decoded, so that an unknown
/// label is reported as such rather than as a generic parse failure.
pub fn read_cell_metadata(p: &Path) -> anyhow::Result<CellMetadata> {
    let mut rdr = csv_reader(p)?;
    let headers = rdr
        .headers()
        .with_context(|| format!("could not read the header of {}", p.display()))?
        .clone();
    let label_cols: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| LABEL_COLUMNS.contains(h))
        .map(|(i, _)| i)
        .collect();

    let mut records = Vec::new();
    for (line, r) in rdr.records().enumerate() {
        let row = r.with_context(|| format!("could not read row {} of {}", line + 1, p.display()))?;
        for &c in label_cols.iter() {
            match row.get(c) {
                Some(l) if !l.is_empty() => {
                    CellClass::from_str(l)?;
                }
                _ => {}
            }
        }
        let rec: CellRecord = row
            .deserialize(Some(&headers))
            .with_context(|| format!("could not parse row {} of {}", line + 1, p.display()))?;
        records.push(rec);
    }
    Ok(CellMetadata::from_records(records)?)
}

pub fn write_cell_metadata(p: &Path, cell_meta: &CellMetadata) -> anyhow::Result<()> {
    write_csv_records(p, cell_meta.records())
}

/// Read a dense hashtag count table: one row per hashtag, the first
/// column holding the hashtag and the remaining header fields holding
/// the barcodes.
pub fn read_hashtag_counts(p: &Path) -> anyhow::Result<HashtagCounts> {
    let mut rdr = csv_reader(p)?;
    let barcodes: Vec<String> = rdr
        .headers()
        .with_context(|| format!("could not read the header of {}", p.display()))?
        .iter()
        .skip(1)
        .map(|s| s.to_string())
        .collect();

    let mut hashtags = Vec::new();
    let mut counts = Vec::with_capacity(barcodes.len() * 8);
    for r in rdr.records() {
        let row = r.with_context(|| format!("could not read {}", p.display()))?;
        let mut fields = row.iter();
        let name = fields.next().unwrap_or("").to_string();
        for (bc, v) in barcodes.iter().zip(fields) {
            let v: f64 = v
                .trim()
                .parse()
                .with_context(|| format!("count of {} in {} is not a number : `{}`", name, bc, v))?;
            counts.push(v);
        }
        hashtags.push(name);
    }
    Ok(HashtagCounts::new(hashtags, barcodes, counts)?)
}

/// Load the hashtag counts from either a dense table or the hashtag
/// features of a 10x matrix directory.
pub fn load_hashtag_counts(src: &CountSource) -> anyhow::Result<HashtagCounts> {
    match src {
        CountSource::Table(p) => read_hashtag_counts(p),
        CountSource::Matrix(load_opts) => {
            let fdata = feature_matrix::load_feature_matrix(load_opts)?;
            let hto = fdata.require(FeatureType::Hto)?;
            Ok(HashtagCounts::from_feature_matrix(hto)?)
        }
    }
}

pub fn write_csv_records<T: Serialize>(p: &Path, records: &[T]) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_path(p)
        .with_context(|| format!("could not create {}", p.display()))?;
    for r in records {
        wtr.serialize(r)
            .with_context(|| format!("could not write a record to {}", p.display()))?;
    }
    wtr.flush()
        .with_context(|| format!("could not flush {}", p.display()))?;
    Ok(())
}

/// one barcode per line
pub fn write_barcode_list<S: AsRef<str>>(p: &Path, barcodes: &[S]) -> anyhow::Result<()> {
    let f = File::create(p).with_context(|| format!("could not create {}", p.display()))?;
    let mut w = BufWriter::new(f);
    for b in barcodes {
        writeln!(w, "{}", b.as_ref())?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize>(p: &Path, v: &T) -> anyhow::Result<()> {
    let mut f = File::create(p).context("could not create metadata file.")?;
    let s = serde_json::to_string_pretty(v).context("could not format json.")?;
    f.write_all(s.as_bytes())
        .with_context(|| format!("cannot write to {}", p.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dehash::DehashError;

    #[test]
    fn test_cell_metadata_round_trip_keeps_infinity() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cell_meta.csv");
        let mut rec = CellRecord::new("AAAC");
        rec.hto_sn = Some(f64::INFINITY);
        rec.dehash_thresh = Some(CellClass::Singlet);
        rec.sample_thresh = Some("donor-a".to_string());
        let cm = CellMetadata::from_records(vec![rec, CellRecord::new("GGGT")]).unwrap();
        write_cell_metadata(&p, &cm).unwrap();

        let back = read_cell_metadata(&p).unwrap();
        assert_eq!(back.len(), 2);
        let a = back.get("AAAC").unwrap();
        assert_eq!(a.hto_sn, Some(f64::INFINITY));
        assert_eq!(a.dehash_thresh, Some(CellClass::Singlet));
        assert_eq!(back.get("GGGT").unwrap().dehash_thresh, None);
    }

    #[test]
    fn test_unknown_label_is_an_invariant_violation() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cell_meta.csv");
        std::fs::write(&p, "barcode,hto-sn,dehash-thresh\nAAAC,2.0,doublet\n").unwrap();
        let e = read_cell_metadata(&p).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<DehashError>(),
            Some(DehashError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_read_hashtag_tables() {
        let dir = tempfile::tempdir().unwrap();
        let cp = dir.path().join("hto.csv");
        std::fs::write(&cp, "hto,A,B\nHTO1,100,3\nHTO2,5,0\n").unwrap();
        let hc = read_hashtag_counts(&cp).unwrap();
        assert_eq!(hc.barcodes(), &["A".to_string(), "B".to_string()]);
        assert_eq!(hc.column(0), vec![100.0, 5.0]);

        let mp = dir.path().join("meta_hto.csv");
        std::fs::write(
            &mp,
            "hto,Sample,hto-threshold-ash\nHTO1,donor-a,1.5\nHTO2,donor-b,\n",
        )
        .unwrap();
        let hm = read_hashtag_metadata(&mp).unwrap();
        assert_eq!(hm.threshold_ash("HTO1").unwrap(), 1.5);
        assert!(hm.threshold_ash("HTO2").is_err());
        assert_eq!(hm.sample("HTO2").unwrap(), "donor-b");
    }
}
