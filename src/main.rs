/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

use anyhow::bail;
use clap::{arg, crate_authors, crate_version, value_parser, ArgAction, ArgMatches, Command};
use mimalloc::MiMalloc;
use slog::{crit, info, o, warn, Drain, Logger};
use std::collections::HashMap;
use std::path::PathBuf;

use dehash_fry::cellqc;
use dehash_fry::cmd_parse_utils::{
    hashtag_thresh_parser, pathbuf_directory_exists_validator, pathbuf_file_exists_validator,
    sn_thresh_parser,
};
use dehash_fry::constants as dfconst;
use dehash_fry::dehash::{self, DehashParams, SnThresholds};
use dehash_fry::prog_opts::{
    CellQcOpts, ClonotypeOpts, CountSource, DehashOpts, LoadMatrixOpts, RefineOpts,
    SetThresholdsOpts, ThresholdOpts,
};
use dehash_fry::thresholds::{self, ThresholdMethod};
use dehash_fry::vdj;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// the arguments describing a 10x matrix directory
fn with_matrix_args(cmd: Command, required: bool) -> Command {
    cmd.arg(
        arg!(-i --"input-dir" <INPUTDIR> "directory holding barcodes.tsv, features.tsv and matrix.mtx (optionally gzipped)")
            .required(required)
            .value_parser(pathbuf_directory_exists_validator),
    )
    .arg(
        arg!(--"hto-list" <HASHTAGS> "comma-separated ids of the features that are hashtags")
            .required(false)
            .value_delimiter(','),
    )
    .arg(arg!(--"drop-default-lane" "strip the `-1` lane suffix from every barcode"))
    .arg(
        arg!(--"add-lane" <LANE> "append `-<LANE>` to every barcode (implies --drop-default-lane)")
            .required(false),
    )
}

fn load_opts<'a>(t: &ArgMatches, log: &'a Logger) -> Option<LoadMatrixOpts<'a>> {
    let input_dir: &PathBuf = t.get_one("input-dir")?;
    let hto_list: Option<Vec<String>> = t
        .get_many::<String>("hto-list")
        .map(|v| v.cloned().collect());
    Some(
        LoadMatrixOpts::builder()
            .input_dir(input_dir.clone())
            .hto_list(hto_list)
            .drop_default_lane(t.get_flag("drop-default-lane"))
            .add_lane(t.get_one::<String>("add-lane").cloned())
            .log(log)
            .build(),
    )
}

fn count_source<'a>(t: &ArgMatches, log: &'a Logger) -> anyhow::Result<CountSource<'a>> {
    if let Some(p) = t.get_one::<PathBuf>("hto-counts") {
        return Ok(CountSource::Table(p.clone()));
    }
    match load_opts(t, log) {
        Some(lo) => Ok(CountSource::Matrix(lo)),
        None => bail!("one of --hto-counts or --input-dir must be provided"),
    }
}

fn run(opts: &ArgMatches, version: &str, cmdline: &str, log: &Logger) -> anyhow::Result<()> {
    if let Some(t) = opts.subcommand_matches("set-thresholds") {
        let hto_meta: &PathBuf = t.get_one("hto-meta").expect("no hashtag metadata specified");
        let output: &PathBuf = t.get_one("output").expect("no output file specified");
        let method: ThresholdMethod = *t.get_one("method").expect("no method specified");
        let manual: HashMap<String, f64> = t
            .get_many::<(String, f64)>("thresh")
            .map(|v| v.cloned().collect())
            .unwrap_or_default();

        let thresh_opts = ThresholdOpts::builder()
            .method(method)
            .manual(manual)
            .log(log)
            .build();
        let st_opts = SetThresholdsOpts::builder()
            .counts(count_source(t, log)?)
            .hto_meta(hto_meta)
            .output(output)
            .hist_dir(t.get_one::<PathBuf>("hist-dir"))
            .hist_bins(*t.get_one("hist-bins").expect("hist-bins must be an integer"))
            .hist_max(*t.get_one("hist-max").expect("hist-max must be a number"))
            .thresh(thresh_opts)
            .cmdline(cmdline)
            .version(version)
            .log(log)
            .build();

        let n = thresholds::set_hashtag_thresholds(&st_opts)?;
        info!(log, "{} hashtags have a threshold", n);
    }

    if let Some(t) = opts.subcommand_matches("dehash") {
        let hto_meta: &PathBuf = t.get_one("hto-meta").expect("no hashtag metadata specified");
        let output_dir: &PathBuf = t.get_one("output-dir").expect("no output directory specified");
        let sn_thresh: SnThresholds = *t.get_one("sn-thresh").expect("no sn-thresh specified");
        let mut params = DehashParams::new(sn_thresh);
        params.inf_replace = *t.get_one("inf-replace").expect("inf-replace must be a number");
        params.perform_sn_adjustment = !t.get_flag("no-sn-adjust");

        let dh_opts = DehashOpts::builder()
            .counts(count_source(t, log)?)
            .hto_meta(hto_meta)
            .cell_meta(t.get_one::<PathBuf>("cell-meta"))
            .output_dir(output_dir)
            .params(params)
            .min_singlet_frac(t.get_one::<f64>("min-singlet-frac").copied())
            .cmdline(cmdline)
            .version(version)
            .log(log)
            .build();

        let summary = dehash::dehash(&dh_opts)?;
        if summary.singlets_per_sample.is_empty() {
            warn!(log, "no barcode was assigned to a sample; please check the thresholds.");
        }
    }

    if let Some(t) = opts.subcommand_matches("refine") {
        let cell_meta: &PathBuf = t.get_one("cell-meta").expect("no cell metadata specified");
        let hto_meta: &PathBuf = t.get_one("hto-meta").expect("no hashtag metadata specified");
        let output_dir: &PathBuf = t.get_one("output-dir").expect("no output directory specified");
        let sn_thresh: SnThresholds = *t.get_one("sn-thresh").expect("no sn-thresh specified");

        let refine_opts = RefineOpts::builder()
            .cell_meta(cell_meta)
            .hto_meta(hto_meta)
            .output_dir(output_dir)
            .sn_thresh(sn_thresh)
            .cmdline(cmdline)
            .version(version)
            .log(log)
            .build();
        dehash::refine(&refine_opts)?;
    }

    if let Some(t) = opts.subcommand_matches("cell-qc") {
        let output_dir: &PathBuf = t.get_one("output-dir").expect("no output directory specified");
        let load = match load_opts(t, log) {
            Some(lo) => lo,
            None => bail!("--input-dir is required"),
        };
        let qc_opts = CellQcOpts::builder()
            .load(load)
            .output_dir(output_dir)
            .mito_thresh(*t.get_one("mito-thresh").expect("mito-thresh must be a number"))
            .gex_ash_thresh(t.get_one::<f64>("gex-ash-thresh").copied())
            .hto_ash_thresh(t.get_one::<f64>("hto-ash-thresh").copied())
            .cmdline(cmdline)
            .version(version)
            .log(log)
            .build();
        match cellqc::cell_qc(&qc_opts) {
            Ok(0) => {
                warn!(log, "no barcode passed the debris thresholds; please check the input.");
            }
            Err(e) => return Err(e),
            _ => (),
        };
    }

    if let Some(t) = opts.subcommand_matches("clonotype") {
        let output_dir: &PathBuf = t.get_one("output-dir").expect("no output directory specified");
        let contig_files: Vec<PathBuf> = t
            .get_many::<PathBuf>("contigs")
            .expect("no contig annotations specified")
            .cloned()
            .collect();
        let ct_opts = ClonotypeOpts::builder()
            .contig_files(contig_files)
            .output_dir(output_dir)
            .cmdline(cmdline)
            .version(version)
            .log(log)
            .build();
        vdj::clonotype(&ct_opts)?;
    }
    Ok(())
}

fn main() {
    let version = crate_version!();

    let counts_arg = arg!(-c --"hto-counts" <HTOCOUNTS> "CSV of hashtag counts (one row per hashtag, one column per barcode)")
        .required(false)
        .value_parser(pathbuf_file_exists_validator)
        .conflicts_with("input-dir");
    let hto_meta_arg = arg!(-m --"hto-meta" <HTOMETA> "CSV of hashtag metadata (hto,Sample[,hto-threshold-ash])")
        .required(true)
        .value_parser(pathbuf_file_exists_validator);
    let sn_arg = arg!(-s --"sn-thresh" <SNTHRESH> "signal-to-noise cutoffs as singlets,debris,multiplets")
        .required(true)
        .value_parser(sn_thresh_parser);
    let output_dir_arg = arg!(-o --"output-dir" <OUTPUTDIR> "output directory")
        .required(true)
        .value_parser(value_parser!(PathBuf));

    let set_thresh_app = with_matrix_args(
        Command::new("set-thresholds")
            .about("Choose the UMI threshold of every hashtag")
            .version(version)
            .author(crate_authors!())
            .arg(counts_arg.clone())
            .arg(hto_meta_arg.clone())
            .arg(
                arg!(--method <METHOD> "how thresholds missing from --thresh are chosen")
                    .required(false)
                    .value_parser(value_parser!(ThresholdMethod))
                    .default_value("manual"),
            )
            .arg(
                arg!(-t --thresh <THRESH> "an explicit ash-scale threshold, as HASHTAG=VALUE")
                    .required(false)
                    .action(ArgAction::Append)
                    .value_parser(hashtag_thresh_parser),
            )
            .arg(
                arg!(-o --output <OUTPUT> "where to write the hashtag metadata with thresholds")
                    .required(true)
                    .value_parser(value_parser!(PathBuf)),
            )
            .arg(
                arg!(--"hist-dir" <HISTDIR> "write one ash histogram table per hashtag here")
                    .required(false)
                    .value_parser(value_parser!(PathBuf)),
            )
            .arg(
                arg!(--"hist-bins" <HISTBINS> "number of histogram bins")
                    .required(false)
                    .value_parser(value_parser!(usize))
                    .default_value("100"),
            )
            .arg(
                arg!(--"hist-max" <HISTMAX> "upper end of the histogram range (ash scale)")
                    .required(false)
                    .value_parser(value_parser!(f64))
                    .default_value("7"),
            ),
        false,
    );

    let dehash_app = with_matrix_args(
        Command::new("dehash")
            .about("Assign every barcode to debris, singlet or multiplet and to a sample")
            .version(version)
            .author(crate_authors!())
            .arg(counts_arg)
            .arg(hto_meta_arg.clone())
            .arg(
                arg!(--"cell-meta" <CELLMETA> "existing cell metadata to enrich (e.g. from cell-qc)")
                    .required(false)
                    .value_parser(pathbuf_file_exists_validator),
            )
            .arg(sn_arg.clone())
            .arg(
                arg!(--"inf-replace" <INFREPLACE> "value standing in for infinite ratios in summaries")
                    .required(false)
                    .value_parser(value_parser!(f64))
                    .default_value(dfconst::DEFAULT_INF_REPLACE.to_string()),
            )
            .arg(arg!(--"no-sn-adjust" "only use the thresholds; skip the signal-to-noise refinement"))
            .arg(
                arg!(--"min-singlet-frac" <MINFRAC> "warn if fewer than this fraction of barcodes are singlets")
                    .required(false)
                    .value_parser(value_parser!(f64)),
            )
            .arg(output_dir_arg.clone()),
        false,
    );

    let refine_app = Command::new("refine")
        .about("Re-run the signal-to-noise refinement over existing cell metadata")
        .version(version)
        .author(crate_authors!())
        .arg(
            arg!(--"cell-meta" <CELLMETA> "cell metadata written by dehash")
                .required(true)
                .value_parser(pathbuf_file_exists_validator),
        )
        .arg(hto_meta_arg)
        .arg(sn_arg)
        .arg(output_dir_arg.clone());

    let cell_qc_app = with_matrix_args(
        Command::new("cell-qc")
            .about("Per-barcode QC metrics, dead-cell calls and debris removal")
            .version(version)
            .author(crate_authors!())
            .arg(
                arg!(--"mito-thresh" <MITOTHRESH> "mitochondrial UMI proportion at which a cell is called dead")
                    .required(false)
                    .value_parser(value_parser!(f64))
                    .default_value(dfconst::DEFAULT_MITO_THRESH.to_string()),
            )
            .arg(
                arg!(--"gex-ash-thresh" <GEXASH> "keep barcodes whose gene expression ash UMI sum reaches this")
                    .required(false)
                    .value_parser(value_parser!(f64)),
            )
            .arg(
                arg!(--"hto-ash-thresh" <HTOASH> "also keep barcodes whose hashtag ash UMI sum reaches this")
                    .required(false)
                    .value_parser(value_parser!(f64))
                    .requires("gex-ash-thresh"),
            )
            .arg(output_dir_arg.clone()),
        true,
    );

    let clonotype_app = Command::new("clonotype")
        .about("Number custom clonotypes from productive V(D)J contigs")
        .version(version)
        .author(crate_authors!())
        .arg(
            arg!(--contigs <CONTIGS> ... "contig annotation CSV(s)")
                .required(true)
                .num_args(1..)
                .value_parser(pathbuf_file_exists_validator),
        )
        .arg(output_dir_arg);

    let opts = Command::new("dehash-fry")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .version(version)
        .author(crate_authors!())
        .about("Hashtag demultiplexing and QC of 10x-style single-cell data")
        .subcommand(set_thresh_app)
        .subcommand(dehash_app)
        .subcommand(refine_app)
        .subcommand(cell_qc_app)
        .subcommand(clonotype_app)
        .get_matches();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator)
        .use_custom_timestamp(|out: &mut dyn std::io::Write| {
            write!(out, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
        })
        .build()
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let log = slog::Logger::root(drain, o!());

    let cmdline = std::env::args().collect::<Vec<String>>().join(" ");

    if let Err(e) = run(&opts, version, &cmdline, &log) {
        crit!(log, "{:#}", e);
        // the async drain flushes once the last logger is gone
        drop(log);
        std::process::exit(1);
    }
}
