/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

use anyhow::{bail, Context};
use serde::Serialize;
use serde_json::json;
use slog::{info, warn};
use std::collections::HashMap;

use crate::feature_matrix::HashtagCounts;
use crate::io_utils;
use crate::metadata::HashtagMetadata;
use crate::prog_opts::{SetThresholdsOpts, ThresholdOpts};
use crate::utils as dfutils;

/// How the per-hashtag thresholds are chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ThresholdMethod {
    // only thresholds given explicitly (or already present
    // in the hashtag metadata) are used
    Manual,
    // hashtags without an explicit threshold get one from the
    // knee of their sorted counts
    Knee,
}

struct Point {
    x: f64,
    y: f64,
}

fn distance_to_line(p1: &Point, p2: &Point, q: &Point) -> f64 {
    let numer = ((p2.y - p1.y) * q.x - (p2.x - p1.x) * q.y + p2.x * p1.y - p2.y * p1.x).abs();
    let denom = ((p2.y - p1.y).powi(2) + (p2.x - p1.x).powi(2)).sqrt();
    numer / denom
}

/// Treat the index of each cumulative count as its x-coordinate and the
/// count as its y-coordinate, draw the line through the first and last
/// points and return the index of the point farthest from it.
fn get_max_distance_index(cumulative: &[f64]) -> anyhow::Result<usize> {
    if cumulative.len() < 2 {
        bail!(
            "cannot find a knee in a list of {} values; at least 2 are required",
            cumulative.len()
        );
    }
    let first = cumulative[0];
    let last = cumulative[cumulative.len() - 1];
    if last <= 0.0 {
        bail!("cannot find a knee when every count is 0");
    }

    let max_x = cumulative.len() as f64;
    let p1 = Point {
        x: 0.0,
        y: first / last,
    };
    let p2 = Point { x: 1.0, y: 1.0 };

    let mut max_d = -1.0f64;
    let mut max_ind = 0usize;
    for (ind, c) in cumulative.iter().enumerate() {
        let q = Point {
            x: ind as f64 / max_x,
            y: c / last,
        };
        let d = distance_to_line(&p1, &p2, &q);
        if d >= max_d {
            max_d = d;
            max_ind = ind;
        }
    }
    Ok(max_ind)
}

/// Index of the knee of the descending-sorted counts `sorted_desc`.
/// The search is repeated on a prefix a few times longer than the last
/// guess until the guess stops moving.
pub fn knee_index(
    sorted_desc: &[f64],
    max_iterations: usize,
    log: &slog::Logger,
) -> anyhow::Result<usize> {
    let cumulative: Vec<f64> = sorted_desc
        .iter()
        .scan(0.0f64, |acc, &v| {
            *acc += v;
            Some(*acc)
        })
        .collect();

    let mut prev_max = 0;
    let mut max_idx = get_max_distance_index(&cumulative)?;
    if max_idx == 0 {
        bail!("the knee was found at the first (highest) cell; the counts are probably not bimodal");
    }

    let iter_slack = 5;
    let mut iterations = 0;
    while max_idx != prev_max {
        prev_max = max_idx;
        iterations += 1;
        if iterations > max_iterations {
            warn!(log, "knee finding did not converge in {} iterations", max_iterations);
            break;
        }
        let last_idx = std::cmp::min(cumulative.len() - 1, max_idx * iter_slack);
        if last_idx < 2 {
            break;
        }
        max_idx = get_max_distance_index(&cumulative[0..last_idx])?;
        if max_idx == 0 {
            bail!("the knee was found at the first (highest) cell; the counts are probably not bimodal");
        }
    }
    Ok(max_idx)
}

/// Ash-scale threshold of one hashtag: the ash of the count at the knee
/// of its counts sorted in descending order.
pub fn knee_threshold(counts: &[f64], log: &slog::Logger) -> anyhow::Result<f64> {
    let mut sorted = counts.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let idx = knee_index(&sorted, 100, log)?;
    let v = sorted[idx];
    if v <= 0.0 {
        bail!("the knee lies among cells with a count of 0");
    }
    Ok(dfutils::ash(v))
}

/// The data behind a hashtag's ash histogram. `above[i]` tells whether
/// bin `i` starts above the threshold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AshHistogram {
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    pub above: Vec<bool>,
}

/// Histogram of the ash-transformed `counts` over `range` (values outside
/// the range are not counted; the upper edge belongs to the last bin).
pub fn ash_histogram(counts: &[f64], bins: usize, range: (f64, f64), thresh: f64) -> AshHistogram {
    let (lo, hi) = range;
    let width = (hi - lo) / bins as f64;
    let edges: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
    let mut hist = vec![0usize; bins];
    for a in counts.iter().map(|v| dfutils::ash(*v)) {
        if bins == 0 || a < lo || a > hi {
            continue;
        }
        let b = (((a - lo) / width) as usize).min(bins - 1);
        hist[b] += 1;
    }
    let above = edges[..bins].iter().map(|e| *e > thresh).collect();
    AshHistogram {
        edges,
        counts: hist,
        above,
    }
}

/// Choose a threshold for every hashtag of `counts`, recording it in
/// `hto_meta`. Explicit thresholds always win; with the knee method the
/// remaining hashtags are thresholded automatically, otherwise they keep
/// whatever threshold the metadata already carried.
pub fn set_thresholds(
    counts: &HashtagCounts,
    hto_meta: &mut HashtagMetadata,
    opts: &ThresholdOpts,
) -> anyhow::Result<HashMap<String, f64>> {
    let log = opts.log;
    let mut chosen = HashMap::new();

    for (h, name) in counts.hashtags().iter().enumerate() {
        let thresh = if let Some(t) = opts.manual.get(name) {
            Some(*t)
        } else {
            match opts.method {
                ThresholdMethod::Knee => Some(
                    knee_threshold(counts.row(h), log)
                        .with_context(|| format!("could not find a threshold for {}", name))?,
                ),
                ThresholdMethod::Manual => hto_meta
                    .get(name)
                    .and_then(|r| r.threshold_ash)
                    .filter(|t| !t.is_nan()),
            }
        };

        match thresh {
            Some(t) => {
                hto_meta.set_threshold(name, t)?;
                info!(
                    log,
                    "{} : threshold {:.3} (ash) / {:.1} (umi)",
                    name,
                    t,
                    dfutils::inv_ash(t)
                );
                chosen.insert(name.clone(), t);
            }
            None => {
                warn!(log, "no threshold was set for hashtag {}", name);
            }
        }
    }

    for name in opts.manual.keys() {
        if counts.hashtag_index(name).is_none() {
            warn!(
                log,
                "a threshold was given for {}, which is not in the count table",
                name
            );
        }
    }
    Ok(chosen)
}

#[derive(Serialize)]
struct HistogramRow {
    #[serde(rename = "bin-start")]
    start: f64,
    #[serde(rename = "bin-end")]
    end: f64,
    count: usize,
    #[serde(rename = "above-threshold")]
    above: bool,
}

/// File name of a hashtag's histogram table; anything but ASCII
/// alphanumerics, `-` and `.` becomes `_` so the table stays inside
/// the histogram directory.
fn hist_file_name(hashtag: &str) -> String {
    let safe: String = hashtag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_ash_hist.csv", safe)
}

/// Choose the hashtag thresholds, write the updated hashtag metadata
/// and, optionally, one ash histogram table per hashtag. Returns the
/// number of hashtags that have a threshold.
pub fn set_hashtag_thresholds(opts: &SetThresholdsOpts) -> anyhow::Result<usize> {
    let log = opts.log;
    let counts = io_utils::load_hashtag_counts(&opts.counts)?;
    let mut hto_meta = io_utils::read_hashtag_metadata(opts.hto_meta)?;

    let chosen = set_thresholds(&counts, &mut hto_meta, &opts.thresh)?;
    if chosen.len() < counts.num_hashtags() {
        warn!(
            log,
            "{} of {} hashtags still lack a threshold",
            counts.num_hashtags() - chosen.len(),
            counts.num_hashtags()
        );
    }
    io_utils::write_hashtag_metadata(opts.output, &hto_meta)?;

    if let Some(hist_dir) = opts.hist_dir {
        std::fs::create_dir_all(hist_dir)
            .with_context(|| format!("could not create {}", hist_dir.display()))?;
        for (h, name) in counts.hashtags().iter().enumerate() {
            let thresh = chosen.get(name).copied().unwrap_or(f64::INFINITY);
            let hist = ash_histogram(counts.row(h), opts.hist_bins, (0.0, opts.hist_max), thresh);
            let rows: Vec<HistogramRow> = (0..hist.counts.len())
                .map(|i| HistogramRow {
                    start: hist.edges[i],
                    end: hist.edges[i + 1],
                    count: hist.counts[i],
                    above: hist.above[i],
                })
                .collect();
            io_utils::write_csv_records(&hist_dir.join(hist_file_name(name)), &rows)?;
        }
    }

    let meta_info = json!({
        "version_str" : opts.version,
        "cmd" : opts.cmdline,
        "threshold_options" : opts,
        "thresholds" : &chosen,
    });
    let json_path = opts.output.with_extension("json");
    io_utils::write_json(&json_path, &meta_info)?;
    Ok(chosen.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::HashtagRecord;

    fn discard_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn bimodal() -> Vec<f64> {
        let mut v: Vec<f64> = (0..80).map(|i| (i % 5) as f64).collect();
        v.extend((0..20).map(|i| 200.0 + i as f64));
        v
    }

    #[test]
    fn test_knee_threshold_separates_clusters() {
        let t = knee_threshold(&bimodal(), &discard_log()).unwrap();
        assert!(t > dfutils::ash(4.0));
        assert!(t <= dfutils::ash(200.0));
    }

    #[test]
    fn test_knee_fails_on_degenerate_input() {
        assert!(knee_threshold(&[0.0, 0.0, 0.0], &discard_log()).is_err());
        assert!(knee_threshold(&[3.0], &discard_log()).is_err());
    }

    #[test]
    fn test_ash_histogram() {
        let h = ash_histogram(&[0.0, 5.0, 100_000.0], 7, (0.0, 7.0), 0.5);
        assert_eq!(h.edges.len(), 8);
        assert_eq!(h.counts.iter().sum::<usize>(), 2);
        assert_eq!(h.counts[0], 2);
        assert_eq!(h.above, vec![false, true, true, true, true, true, true]);
    }

    #[test]
    fn test_hist_file_name_stays_in_directory() {
        assert_eq!(hist_file_name("HTO-1"), "HTO-1_ash_hist.csv");
        assert_eq!(hist_file_name("../etc/HTO1"), ".._etc_HTO1_ash_hist.csv");
        assert_eq!(hist_file_name("a b/c"), "a_b_c_ash_hist.csv");
        for n in ["../x", "/abs", "a\\b"] {
            let f = hist_file_name(n);
            assert!(!f.contains('/') && !f.contains('\\'));
            assert_eq!(std::path::Path::new(&f).components().count(), 1);
        }
    }

    #[test]
    fn test_set_thresholds_manual_and_knee() {
        let mut rows = bimodal();
        rows.extend(bimodal().into_iter().rev());
        let counts = HashtagCounts::new(
            vec!["HTO1".to_string(), "HTO2".to_string()],
            (0..100).map(|i| format!("BC{}", i)).collect(),
            rows,
        )
        .unwrap();
        let mut hm = HashtagMetadata::from_records(vec![
            HashtagRecord::new("HTO1", "a"),
            HashtagRecord::new("HTO2", "b"),
        ])
        .unwrap();
        let log = discard_log();
        let mut manual = HashMap::new();
        manual.insert("HTO1".to_string(), 1.5);

        let opts = ThresholdOpts::builder()
            .method(ThresholdMethod::Manual)
            .manual(manual.clone())
            .log(&log)
            .build();
        let chosen = set_thresholds(&counts, &mut hm, &opts).unwrap();
        assert_eq!(chosen.len(), 1);
        assert_eq!(hm.threshold_ash("HTO1").unwrap(), 1.5);
        assert!(hm.threshold_ash("HTO2").is_err());

        let opts = ThresholdOpts::builder()
            .method(ThresholdMethod::Knee)
            .manual(manual)
            .log(&log)
            .build();
        set_thresholds(&counts, &mut hm, &opts).unwrap();
        assert_eq!(hm.threshold_ash("HTO1").unwrap(), 1.5);
        let t2 = hm.threshold_ash("HTO2").unwrap();
        assert!(t2 > dfutils::ash(4.0) && t2 <= dfutils::ash(200.0));
    }
}
