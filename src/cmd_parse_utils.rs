use crate::dehash::SnThresholds;
use crate::thresholds::ThresholdMethod;
use clap;
use std::path::{Path, PathBuf};

impl clap::ValueEnum for ThresholdMethod {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Manual, Self::Knee]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Manual => Some(clap::builder::PossibleValue::new("manual")),
            Self::Knee => Some(clap::builder::PossibleValue::new("knee")),
        }
    }
}

/// Checks if the path pointed to by v exists.  It can be
/// any valid entity (e.g. disk file, FIFO, directory, etc.).
pub fn pathbuf_file_exists_validator(v: &str) -> Result<PathBuf, String> {
    if !Path::new(v).exists() {
        Err(String::from("No valid file was found at this path."))
    } else {
        Ok(PathBuf::from(v))
    }
}

/// Checks if the path pointed to by v exists and is
/// a valid directory on disk.
pub fn pathbuf_directory_exists_validator(v: &str) -> Result<PathBuf, String> {
    if !Path::new(v).is_dir() {
        Err(String::from("No valid directory was found at this path."))
    } else {
        Ok(PathBuf::from(v))
    }
}

/// Parses `singlets,debris,multiplets` signal-to-noise cutoffs.
pub fn sn_thresh_parser(v: &str) -> Result<SnThresholds, String> {
    let vals = v
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|e| format!("`{}` is not a number ({})", s, e))
        })
        .collect::<Result<Vec<f64>, String>>()?;
    match vals.as_slice() {
        [singlets, debris, multiplets] => Ok(SnThresholds {
            singlets: *singlets,
            debris: *debris,
            multiplets: *multiplets,
        }),
        _ => Err(format!(
            "expected 3 comma-separated values (singlets,debris,multiplets), found {}",
            vals.len()
        )),
    }
}

/// Parses a `HASHTAG=ASH` threshold.
pub fn hashtag_thresh_parser(v: &str) -> Result<(String, f64), String> {
    let (name, t) = v
        .rsplit_once('=')
        .ok_or_else(|| format!("`{}` is not of the form HASHTAG=THRESHOLD", v))?;
    if name.is_empty() {
        return Err(format!("`{}` has an empty hashtag name", v));
    }
    let t: f64 = t
        .trim()
        .parse()
        .map_err(|e| format!("`{}` is not a valid threshold ({})", t, e))?;
    if !t.is_finite() || t < 0.0 {
        return Err(format!("the threshold of {} must be a non-negative number", name));
    }
    Ok((name.to_string(), t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sn_thresh_parser() {
        let t = sn_thresh_parser("2, 5,10").unwrap();
        assert_eq!(t.singlets, 2.0);
        assert_eq!(t.debris, 5.0);
        assert_eq!(t.multiplets, 10.0);
        assert!(sn_thresh_parser("2,5").is_err());
        assert!(sn_thresh_parser("2,x,5").is_err());
    }

    #[test]
    fn test_hashtag_thresh_parser() {
        assert_eq!(
            hashtag_thresh_parser("HTO1=1.5").unwrap(),
            ("HTO1".to_string(), 1.5)
        );
        assert!(hashtag_thresh_parser("HTO1").is_err());
        assert!(hashtag_thresh_parser("=1").is_err());
        assert!(hashtag_thresh_parser("HTO1=-1").is_err());
    }
}
