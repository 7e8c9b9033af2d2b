use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};

use dehash_fry::cellqc;
use dehash_fry::dehash::{self, DehashParams, SnThresholds};
use dehash_fry::io_utils;
use dehash_fry::metadata::CellClass;
use dehash_fry::prog_opts::{
    CellQcOpts, ClonotypeOpts, CountSource, DehashOpts, LoadMatrixOpts, RefineOpts,
};
use dehash_fry::vdj;

fn discard_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

// 2 genes, 1 antibody and 2 hashtags measured in 4 barcodes
fn write_10x_dir(dir: &Path) {
    let bc = std::fs::File::create(dir.join("barcodes.tsv.gz")).unwrap();
    let mut gz = GzEncoder::new(bc, Compression::default());
    for b in ["AAAC-1", "CCCG-1", "GGGT-1", "TTTA-1"] {
        writeln!(gz, "{}", b).unwrap();
    }
    gz.finish().unwrap();

    std::fs::write(
        dir.join("features.tsv"),
        "ENSG01\tMT-CO1\tGene Expression\n\
         ENSG02\tCD3E\tGene Expression\n\
         CD4\tCD4_TotalSeqB\tAntibody Capture\n\
         HTO1\tHTO1\tAntibody Capture\n\
         HTO2\tHTO2\tAntibody Capture\n",
    )
    .unwrap();

    std::fs::write(
        dir.join("matrix.mtx"),
        "%%MatrixMarket matrix coordinate integer general\n\
         %\n\
         5 4 13\n\
         1 1 9\n\
         2 1 1\n\
         3 1 7\n\
         4 1 100\n\
         5 1 5\n\
         2 2 50\n\
         3 2 2\n\
         4 2 100\n\
         5 2 50\n\
         4 3 3\n\
         1 4 1\n\
         2 4 99\n\
         5 4 40\n",
    )
    .unwrap();
}

fn write_hto_meta(dir: &Path) -> PathBuf {
    let p = dir.join("meta_hto.csv");
    // sinh(1.4) * 5 ~ 9.5 UMI
    std::fs::write(
        &p,
        "hto,Sample,hto-threshold-ash\nHTO1,donor-a,1.4\nHTO2,donor-b,1.4\n",
    )
    .unwrap();
    p
}

fn load_opts<'a>(input_dir: &Path, log: &'a slog::Logger) -> LoadMatrixOpts<'a> {
    LoadMatrixOpts::builder()
        .input_dir(input_dir.to_path_buf())
        .hto_list(Some(vec!["HTO1".to_string(), "HTO2".to_string()]))
        .drop_default_lane(true)
        .log(log)
        .build()
}

#[test]
fn cell_qc_then_dehash_then_refine() {
    let log = discard_log();
    let tmp = tempfile::tempdir().unwrap();
    let input_dir = tmp.path().join("filtered_feature_bc_matrix");
    std::fs::create_dir_all(&input_dir).unwrap();
    write_10x_dir(&input_dir);
    let hto_meta = write_hto_meta(tmp.path());

    // QC
    let qc_dir = tmp.path().join("qc");
    let qc_opts = CellQcOpts::builder()
        .load(load_opts(&input_dir, &log))
        .output_dir(&qc_dir)
        .gex_ash_thresh(Some(1.0))
        .hto_ash_thresh(Some(1.0))
        .cmdline("dehash-fry cell-qc")
        .version("test")
        .log(&log)
        .build();
    let kept = cellqc::cell_qc(&qc_opts).unwrap();
    assert_eq!(kept, 3);
    let keep = std::fs::read_to_string(qc_dir.join("keep_barcodes.txt")).unwrap();
    assert_eq!(keep.lines().collect::<Vec<_>>(), vec!["AAAC", "CCCG", "TTTA"]);

    let qc_meta = io_utils::read_cell_metadata(&qc_dir.join("cell_qc.csv")).unwrap();
    let a = qc_meta.get("AAAC").unwrap();
    assert_eq!(a.gex_umi_sum, Some(10.0));
    assert_eq!(a.adt_umi_sum, Some(7.0));
    assert_eq!(a.hto_umi_sum, Some(105.0));
    assert_eq!(a.hto_num_unique, Some(2));
    assert_eq!(a.dead_cell_mito.as_deref(), Some(cellqc::DEAD_CELL));
    let g = qc_meta.get("GGGT").unwrap();
    assert!(g.gex_mito_proportion.unwrap().is_nan());
    assert_eq!(g.dead_cell_mito.as_deref(), Some(cellqc::LIVE_CELL));

    // de-hash on top of the QC table
    let qc_table = qc_dir.join("cell_qc.csv");
    let dh_dir = tmp.path().join("dehash");
    let params = DehashParams::new(SnThresholds {
        singlets: 2.0,
        debris: 5.0,
        multiplets: 10.0,
    });
    let dh_opts = DehashOpts::builder()
        .counts(CountSource::Matrix(load_opts(&input_dir, &log)))
        .hto_meta(&hto_meta)
        .cell_meta(Some(&qc_table))
        .output_dir(&dh_dir)
        .params(params)
        .min_singlet_frac(Some(0.5))
        .cmdline("dehash-fry dehash")
        .version("test")
        .log(&log)
        .build();
    let summary = dehash::dehash(&dh_opts).unwrap();
    assert_eq!(summary.threshold_only.singlet, 2);
    assert_eq!(summary.threshold_only.multiplet, 1);
    assert_eq!(summary.threshold_only.debris, 1);
    let sn = summary.threshold_sn.unwrap();
    assert_eq!(sn.singlet, 3);
    assert_eq!(sn.multiplet, 1);
    assert_eq!(summary.num_infinite_sn, 2);
    assert_eq!(summary.singlets_per_sample.get("donor-a"), Some(&2));
    assert_eq!(summary.singlets_per_sample.get("donor-b"), Some(&1));

    let cm = io_utils::read_cell_metadata(&dh_dir.join("cell_meta.csv")).unwrap();
    // QC columns survive the de-hash pass
    assert_eq!(cm.get("AAAC").unwrap().gex_umi_sum, Some(10.0));
    let a = cm.get("AAAC").unwrap();
    assert_eq!(a.hto_sn, Some(20.0));
    assert_eq!(a.dehash_thresh_sn, Some(CellClass::Singlet));
    assert_eq!(a.sample_thresh_sn.as_deref(), Some("donor-a"));
    let g = cm.get("GGGT").unwrap();
    assert_eq!(g.hto_sn, Some(f64::INFINITY));
    assert_eq!(g.dehash_thresh, Some(CellClass::Debris));
    assert_eq!(g.sample_thresh.as_deref(), Some("N.A."));
    assert_eq!(g.dehash_thresh_sn, Some(CellClass::Singlet));
    assert_eq!(g.sample_thresh_sn.as_deref(), Some("donor-a"));
    let c = cm.get("CCCG").unwrap();
    assert_eq!(c.dehash_thresh_sn, Some(CellClass::Multiplet));
    assert_eq!(c.sample_thresh_sn.as_deref(), Some("N.A."));

    let svn = std::fs::read_to_string(dh_dir.join("signal_vs_noise.csv")).unwrap();
    assert_eq!(svn.lines().count(), 5);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dh_dir.join("dehash.json")).unwrap())
            .unwrap();
    assert_eq!(json["summary"]["threshold_only"]["singlet"], 2);
    assert_eq!(json["cmd"], "dehash-fry dehash");

    // a looser multiplet cutoff resolves CCCG (sn = 2)
    let rf_dir = tmp.path().join("refine");
    let dh_table = dh_dir.join("cell_meta.csv");
    let rf_opts = RefineOpts::builder()
        .cell_meta(&dh_table)
        .hto_meta(&hto_meta)
        .output_dir(&rf_dir)
        .sn_thresh(SnThresholds {
            singlets: 2.0,
            debris: 5.0,
            multiplets: 1.5,
        })
        .cmdline("dehash-fry refine")
        .version("test")
        .log(&log)
        .build();
    let cc = dehash::refine(&rf_opts).unwrap();
    assert_eq!(cc.singlet, 4);
    let cm = io_utils::read_cell_metadata(&rf_dir.join("cell_meta.csv")).unwrap();
    let c = cm.get("CCCG").unwrap();
    assert_eq!(c.dehash_thresh, Some(CellClass::Multiplet));
    assert_eq!(c.dehash_thresh_sn, Some(CellClass::Singlet));
    assert_eq!(c.sample_thresh_sn.as_deref(), Some("donor-a"));
}

#[test]
fn dehash_from_count_table_rejects_unknown_barcodes() {
    let log = discard_log();
    let tmp = tempfile::tempdir().unwrap();
    let hto_meta = write_hto_meta(tmp.path());
    let counts = tmp.path().join("hto.csv");
    std::fs::write(&counts, "hto,AAAC,ZZZZ\nHTO1,100,3\nHTO2,5,0\n").unwrap();
    let cell_meta = tmp.path().join("cells.csv");
    std::fs::write(&cell_meta, "barcode\nAAAC\n").unwrap();
    let out = tmp.path().join("out");

    let opts = DehashOpts::builder()
        .counts(CountSource::Table(counts))
        .hto_meta(&hto_meta)
        .cell_meta(Some(&cell_meta))
        .output_dir(&out)
        .params(DehashParams::new(SnThresholds {
            singlets: 2.0,
            debris: 5.0,
            multiplets: 10.0,
        }))
        .cmdline("dehash-fry dehash")
        .version("test")
        .log(&log)
        .build();
    let e = dehash::dehash(&opts).unwrap_err();
    assert!(matches!(
        e.downcast_ref::<dehash::DehashError>(),
        Some(dehash::DehashError::UnknownBarcode(b)) if b == "ZZZZ"
    ));
}

#[test]
fn clonotypes_from_two_contig_tables() {
    let log = discard_log();
    let tmp = tempfile::tempdir().unwrap();
    let header = "barcode,is_cell,contig_id,chain,v_gene,d_gene,j_gene,c_gene,productive,cdr3,umis\n";
    let t1 = tmp.path().join("t1.csv");
    std::fs::write(
        &t1,
        format!(
            "{}AAAC-1,True,AAAC-1_contig_1,TRA,TRAV1,,TRAJ2,TRAC,True,CAVR,4\n\
             AAAC-1,True,AAAC-1_contig_2,TRB,TRBV5,TRBD1,TRBJ1,TRBC1,True,CASS,9\n\
             CCCG-1,True,CCCG-1_contig_1,TRA,TRAV1,,TRAJ2,TRAC,True,CAVR,3\n\
             CCCG-1,True,CCCG-1_contig_2,TRB,TRBV9,,TRBJ1,TRBC1,False,,2\n",
            header
        ),
    )
    .unwrap();
    let t2 = tmp.path().join("t2.csv");
    std::fs::write(
        &t2,
        format!(
            "{}GGGT-1,True,GGGT-1_contig_1,TRB,TRBV5,TRBD1,TRBJ1,TRBC2,True,CASS,5\n\
             GGGT-1,True,GGGT-1_contig_2,TRA,TRAV1,,TRAJ2,TRAC,True,CAVR,7\n",
            header
        ),
    )
    .unwrap();

    let out = tmp.path().join("vdj");
    let opts = ClonotypeOpts::builder()
        .contig_files(vec![t1, t2])
        .output_dir(&out)
        .cmdline("dehash-fry clonotype")
        .version("test")
        .log(&log)
        .build();
    assert_eq!(vdj::clonotype(&opts).unwrap(), 2);

    let mut rdr = csv::Reader::from_path(out.join("clonotypes.csv")).unwrap();
    let clones: Vec<vdj::Clonotype> = rdr.deserialize().map(|r| r.unwrap()).collect();
    assert_eq!(clones.len(), 3);
    let clone_of = |bc: &str| {
        clones
            .iter()
            .find(|c| c.barcode == bc)
            .map(|c| c.clone.clone())
            .unwrap()
    };
    // the constant gene does not split a clonotype
    assert_eq!(clone_of("AAAC-1"), "custom-clone-1");
    assert_eq!(clone_of("GGGT-1"), "custom-clone-1");
    assert_eq!(clone_of("CCCG-1"), "custom-clone-2");
}
