use serde_json::Value;
use xtalscreen_core::{OverloadData, ProfileEstimate, Result, XtalscreenError};

/// Count the images of the first datablock: one exposure time per image,
/// summed over all of its scans.
pub fn count_images(datablock_json: &str) -> Result<u64> {
    let datablock: Value = serde_json::from_str(datablock_json)?;
    let scans = datablock
        .get(0)
        .and_then(|block| block.get("scan"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            XtalscreenError::Parse("Could not determine number of images in dataset".to_string())
        })?;

    scans.iter().try_fold(0u64, |total, scan| {
        let exposures = scan
            .get("exposure_time")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                XtalscreenError::Parse("scan without exposure_time list in datablock".to_string())
            })?;
        Ok(total + exposures.len() as u64)
    })
}

/// Look up the model referenced by the first experiment, e.g. the scan or
/// profile it points at by index.
fn referenced_model<'a>(experiments: &'a Value, kind: &str) -> Option<&'a Value> {
    let index = experiments
        .get("experiment")
        .and_then(|list| list.get(0))
        .and_then(|experiment| experiment.get(kind))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    experiments.get(kind)?.get(index as usize)
}

/// Read image count, oscillation width and mosaicity from an experiment list
/// written by profile modelling.
pub fn read_profile_estimate(experiments_json: &str) -> Result<ProfileEstimate> {
    let experiments: Value = serde_json::from_str(experiments_json)?;
    let missing = |what: &str| XtalscreenError::Parse(format!("experiment list has no {}", what));

    let scan = referenced_model(&experiments, "scan").ok_or_else(|| missing("scan"))?;
    let image_range = scan
        .get("image_range")
        .and_then(Value::as_array)
        .and_then(|range| Some((range.first()?.as_u64()?, range.get(1)?.as_u64()?)))
        .ok_or_else(|| missing("image range"))?;
    let oscillation = scan
        .get("oscillation")
        .and_then(|osc| osc.get(1))
        .and_then(Value::as_f64)
        .ok_or_else(|| missing("oscillation width"))?;

    let sigma_m = referenced_model(&experiments, "profile")
        .and_then(|profile| profile.get("sigma_m"))
        .and_then(Value::as_f64)
        .ok_or_else(|| missing("profile sigma_m"))?;

    Ok(ProfileEstimate {
        num_images: image_range.1.saturating_sub(image_range.0) + 1,
        oscillation,
        sigma_m,
    })
}

pub fn parse_overload(overload_json: &str) -> Result<OverloadData> {
    let data: OverloadData = serde_json::from_str(overload_json)?;
    if data.bins.is_none() && data.counts.is_none() {
        return Err(XtalscreenError::Parse(
            "overload data contains neither bins nor counts".to_string(),
        ));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_images_sums_scans() {
        let json = r#"[{"__id__": "DataBlock", "scan": [
            {"exposure_time": [0.1, 0.1, 0.1]},
            {"exposure_time": [0.2, 0.2]}
        ]}]"#;
        assert_eq!(count_images(json).unwrap(), 5);
    }

    #[test]
    fn test_count_images_without_scan() {
        let err = count_images(r#"[{"__id__": "DataBlock"}]"#).unwrap_err();
        assert!(matches!(err, XtalscreenError::Parse(_)));
        assert!(count_images("not json").is_err());
    }

    #[test]
    fn test_read_profile_estimate() {
        let json = r#"{
            "__id__": "ExperimentList",
            "experiment": [{"scan": 1, "profile": 0}],
            "scan": [
                {"image_range": [1, 5], "oscillation": [0.0, 0.1]},
                {"image_range": [1, 90], "oscillation": [-30.0, 0.5]}
            ],
            "profile": [{"__id__": "gaussian_rs", "sigma_b": 0.03, "sigma_m": 0.087}]
        }"#;
        let estimate = read_profile_estimate(json).unwrap();
        assert_eq!(estimate.num_images, 90);
        assert_eq!(estimate.oscillation, 0.5);
        assert_eq!(estimate.sigma_m, 0.087);
    }

    #[test]
    fn test_read_profile_estimate_without_profile() {
        let json = r#"{"scan": [{"image_range": [1, 5], "oscillation": [0.0, 0.1]}]}"#;
        let err = read_profile_estimate(json).unwrap_err();
        assert!(err.to_string().contains("sigma_m"));
    }

    #[test]
    fn test_parse_overload_with_counts() {
        let json = r#"{"scale_factor": 0.001, "overload_limit": 1000000, "counts": {"0": 5, "12": 3}}"#;
        let data = parse_overload(json).unwrap();
        assert_eq!(data.scale_factor, 0.001);
        assert_eq!(data.overload_limit, Some(1_000_000.0));
        assert_eq!(data.counts.unwrap().get("12"), Some(&3));
    }

    #[test]
    fn test_parse_overload_requires_histogram() {
        assert!(parse_overload(r#"{"scale_factor": 1.0}"#).is_err());
    }
}
