use std::collections::BTreeMap;
use std::f64::consts::PI;
use xtalscreen_core::{OverloadData, ProfileModel, Result, XtalscreenError};

/// Pixel count value -> number of pixels with that value
pub type Histogram = BTreeMap<u64, u64>;

/// Collect the pixel histogram from overload data, dropping empty bins.
///
/// Returns the histogram together with the total sum of counts.
pub fn histogram(data: &OverloadData) -> Result<(Histogram, u64)> {
    let mut hist = Histogram::new();
    if let Some(bins) = &data.bins {
        let bin_count = data.bin_count.unwrap_or(bins.len()).min(bins.len());
        for (value, &pixels) in bins.iter().enumerate().take(bin_count) {
            if pixels > 0 {
                hist.insert(value as u64, pixels);
            }
        }
    } else if let Some(counts) = &data.counts {
        for (key, &pixels) in counts {
            let value: i64 = key.trim().parse().map_err(|_| {
                XtalscreenError::Parse(format!("invalid count value '{}' in overload data", key))
            })?;
            if value > 0 {
                hist.insert(value as u64, pixels);
            }
        }
    }

    let count_sum = hist.iter().map(|(value, pixels)| value * pixels).sum();
    Ok((hist, count_sum))
}

/// Ratio between the average and the peak intensity of a reflection
/// recorded with oscillation width `oscillation` and mosaicity `sigma_m`.
///
/// Tends to 1 when `sigma_m` is much larger than the oscillation.
pub fn average_to_peak(sigma_m: f64, oscillation: f64) -> f64 {
    let m = PI.sqrt() * sigma_m * libm::erf(oscillation / (2.0 * sigma_m));
    m / oscillation
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleEstimate {
    /// Scale used for the histogram, from the best available model
    pub scale: f64,
    pub scale_basic: f64,
    /// `None` without a usable basic model, in which case 1 is assumed
    pub average_to_peak_basic: Option<f64>,
    pub average_to_peak_extended: Option<f64>,
}

impl ScaleEstimate {
    /// Log lines describing how the scale was derived
    pub fn describe(&self, mosaicity_corrected: bool) -> Vec<String> {
        let mut lines = Vec::new();
        if mosaicity_corrected {
            if let Some(ratio) = self.average_to_peak_basic {
                lines.push(format!(
                    "Average-to-peak intensity ratio: {:.6} (basic profile model)",
                    ratio
                ));
            }
            match self.average_to_peak_extended {
                Some(ratio) => {
                    lines.push(format!(
                        "Average-to-peak intensity ratio: {:.6} (extended profile model)",
                        ratio
                    ));
                    lines.push(
                        "Using extended profile model for count rate estimation plot".to_string(),
                    );
                }
                None => {
                    lines.push(
                        "Using basic profile model for count rate estimation plot".to_string(),
                    );
                }
            }
        }
        if self.average_to_peak_extended.is_some() {
            lines.push(format!(
                "Determined scale factor for intensities as {:.6} (basic: {:.6})",
                self.scale, self.scale_basic
            ));
        } else {
            lines.push(format!(
                "Determined scale factor for intensities as {:.6}",
                self.scale_basic
            ));
        }
        lines
    }
}

/// Scale converting pixel counts into percent of the detector count rate
/// limit. Without a profile model the average-to-peak ratio is taken as 1.
pub fn estimate_scale(scale_factor: f64, profile: Option<&ProfileModel>) -> ScaleEstimate {
    let usable = |sigma: Option<f64>| sigma.filter(|s| *s > 0.0);
    let (mut basic, mut extended) = (None, None);
    if let Some(model) = profile.filter(|m| m.oscillation > 0.0) {
        basic = usable(model.sigma_m_basic).map(|s| average_to_peak(s, model.oscillation));
        extended = usable(model.sigma_m_extended).map(|s| average_to_peak(s, model.oscillation));
    }

    let scale_basic = 100.0 * scale_factor / basic.unwrap_or(1.0);
    let scale = extended.map_or(scale_basic, |ratio| 100.0 * scale_factor / ratio);
    ScaleEstimate {
        scale,
        scale_basic,
        average_to_peak_basic: basic,
        average_to_peak_extended: extended,
    }
}

/// Histogram rebinned to percent of the count rate limit.
///
/// Keys are in units of `1 / granularity` percent.
#[derive(Debug, Clone, PartialEq)]
pub struct RescaledHistogram {
    pub bins: Histogram,
    pub granularity: u32,
}

impl RescaledHistogram {
    /// Width of one bin in percent
    pub fn bin_width(&self) -> f64 {
        1.0 / f64::from(self.granularity)
    }

    /// Decimal places worth printing for this granularity
    pub fn precision(&self) -> usize {
        if self.granularity > 1 {
            1
        } else {
            0
        }
    }
}

/// Finer bins are used when the strongest pixel is far below the limit.
pub fn granularity_for(hist_max: f64) -> u32 {
    if hist_max < 15.0 {
        10
    } else if hist_max < 50.0 {
        2
    } else {
        1
    }
}

pub fn rescale(hist: &Histogram, scale: f64, granularity: u32) -> RescaledHistogram {
    let mut bins = Histogram::new();
    for (&value, &pixels) in hist {
        let rescaled = (value as f64 * scale * f64::from(granularity)).round();
        if rescaled > 0.0 {
            *bins.entry(rescaled as u64).or_insert(0) += pixels;
        }
    }
    RescaledHistogram { bins, granularity }
}

/// How the strongest pixel relates to the detector's response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountRateAssessment {
    /// The data contain pixels at or above the overload limit
    Overloaded,
    /// Above 70 % of the limit
    FarOutsideLinearRange,
    /// Above 25 % of the limit
    OutsideLinearRange,
    WithinLinearRange,
}

pub fn assess_count_rate(
    max_count: u64,
    hist_max: f64,
    overload_limit: Option<f64>,
) -> CountRateAssessment {
    if overload_limit.is_some_and(|limit| max_count as f64 >= limit) {
        CountRateAssessment::Overloaded
    } else if hist_max > 70.0 {
        CountRateAssessment::FarOutsideLinearRange
    } else if hist_max > 25.0 {
        CountRateAssessment::OutsideLinearRange
    } else {
        CountRateAssessment::WithinLinearRange
    }
}

/// Outcome of the pixel intensity check
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityReport {
    pub max_count: u64,
    /// Strongest pixel in percent of the count rate limit
    pub hist_max: f64,
    pub count_sum: u64,
    pub scale: ScaleEstimate,
    pub rescaled: RescaledHistogram,
    pub assessment: CountRateAssessment,
    pub mosaicity_corrected: bool,
}

/// Derive the intensity report from overload data and, when available, the
/// profile model.
pub fn analyse(data: &OverloadData, profile: Option<&ProfileModel>) -> Result<IntensityReport> {
    let (hist, count_sum) = histogram(data)?;
    let max_count = hist.keys().next_back().copied().ok_or_else(|| {
        XtalscreenError::Parse("overload data contains no counted pixels".to_string())
    })?;

    let profile = profile.filter(|model| model.is_available());
    let scale = estimate_scale(data.scale_factor, profile);
    let hist_max = max_count as f64 * scale.scale;
    let rescaled = rescale(&hist, scale.scale, granularity_for(hist_max));

    Ok(IntensityReport {
        max_count,
        hist_max,
        count_sum,
        scale,
        rescaled,
        assessment: assess_count_rate(max_count, hist_max, data.overload_limit),
        mosaicity_corrected: profile.is_some(),
    })
}
