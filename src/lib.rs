/*
 * Copyright (c) 2020-2024 COMBINE-lab.
 *
 * This file is part of dehash-fry.
 *
 * License: 3-clause BSD, see https://opensource.org/licenses/BSD-3-Clause
 */

pub mod cellqc;
pub mod cmd_parse_utils;
pub mod constants;
pub mod dehash;
pub mod diagnostics;
pub mod feature_matrix;
pub mod io_utils;
pub mod metadata;
pub mod prog_opts;
pub mod thresholds;
pub mod utils;
pub mod vdj;
