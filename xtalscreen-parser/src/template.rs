use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;
use xtalscreen_core::{Result, XtalscreenError};

/// A run of image files whose names differ only in a zero-padded counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTemplate {
    /// Name of the first image in the run
    pub template: String,
    pub count: u64,
    /// Byte span of the counter inside `template`
    pub counter: Option<Range<usize>>,
    /// Image number of the first image
    pub first_image: Option<u64>,
}

impl ImageTemplate {
    /// First and last image number covered by this template
    pub fn scan_range(&self) -> Option<(u64, u64)> {
        let first = self.first_image?;
        Some((first, first + self.count.saturating_sub(1)))
    }
}

/// Template under construction. The counter span is inclusive here.
struct TemplateBuilder {
    template: String,
    count: u64,
    counter: Option<(usize, usize)>,
}

impl TemplateBuilder {
    fn new(name: &str) -> Self {
        Self {
            template: name.to_string(),
            count: 1,
            counter: None,
        }
    }

    /// Add `name` to the run if it is the next image. Returns false if `name`
    /// has to start a new template.
    fn try_extend(&mut self, name: &str) -> bool {
        let (current, next) = (self.template.as_bytes(), name.as_bytes());
        if current.len() != next.len() {
            return false;
        }

        let mut differing = current
            .iter()
            .zip(next)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i);
        let Some(first) = differing.next() else {
            return false;
        };
        let last = differing.last().unwrap_or(first);

        // The new span may grow by one digit to the left (carry) but must
        // otherwise stay inside the counter found so far.
        let (lo, hi) = match self.counter {
            Some((r0, r1)) => {
                if first + 1 < r0 || first > r1 || last > r1 {
                    return false;
                }
                (first.min(r0), r1)
            }
            None => (first, last),
        };

        match predict_name(&self.template, lo, hi, self.count) {
            Some(predicted) if predicted == name => {
                self.counter = Some((lo, hi));
                self.count += 1;
                true
            }
            _ => false,
        }
    }

    fn finish(self) -> ImageTemplate {
        let counter = self.counter.map(|(lo, hi)| lo..hi + 1);
        let first_image = counter
            .as_ref()
            .and_then(|span| self.template.get(span.clone()))
            .and_then(|digits| digits.parse().ok());
        ImageTemplate {
            template: self.template,
            count: self.count,
            counter,
            first_image,
        }
    }
}

/// Name of the image `offset` positions after `template`, given the inclusive
/// counter span `lo..=hi`.
fn predict_name(template: &str, lo: usize, hi: usize, offset: u64) -> Option<String> {
    let digits = template.get(lo..=hi)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    let width = hi - lo + 1;
    Some(format!(
        "{}{:0width$}{}",
        template.get(..lo)?,
        value + offset,
        template.get(hi + 1..)?,
        width = width
    ))
}

/// Group image file names into runs of consecutively numbered images.
///
/// Names are sorted first. A single file yields a single template without a
/// counter.
pub fn detect_templates<S: AsRef<str>>(files: &[S]) -> Vec<ImageTemplate> {
    let mut names: Vec<&str> = files.iter().map(AsRef::as_ref).collect();
    names.sort_unstable();

    let mut templates = Vec::new();
    let mut current: Option<TemplateBuilder> = None;
    for name in names {
        let joined = current
            .as_mut()
            .map(|builder| builder.try_extend(name))
            .unwrap_or(false);
        if !joined {
            if let Some(done) = current.replace(TemplateBuilder::new(name)) {
                templates.push(done.finish());
            }
        }
    }
    if let Some(done) = current {
        templates.push(done.finish());
    }
    templates
}

fn counter_regex() -> &'static Regex {
    static COUNTER_RE: OnceLock<Regex> = OnceLock::new();
    // Safety: this regex literal is guaranteed to compile
    COUNTER_RE.get_or_init(|| Regex::new(r"([0-9]+)[^0-9]+$").unwrap())
}

/// Parse an image range given as `template:first:last`.
///
/// Returns `Ok(None)` when the argument does not have that shape or the
/// template has no numeric counter.
pub fn parse_range_argument(argument: &str) -> Result<Option<ImageTemplate>> {
    let parts: Vec<&str> = argument.split(':').collect();
    let [template, first, last] = parts.as_slice() else {
        return Ok(None);
    };

    let parse_image = |value: &str| {
        value.trim().parse::<u64>().map_err(|_| {
            XtalscreenError::Parse(format!("invalid image number '{}' in {}", value, argument))
        })
    };
    let (first, last) = (parse_image(first)?, parse_image(last)?);
    if last < first {
        return Err(XtalscreenError::Parse(format!(
            "image range {}..{} is empty in {}",
            first, last, argument
        )));
    }

    let Some(span) = counter_regex()
        .captures(template)
        .and_then(|captures| captures.get(1))
        .map(|m| m.range())
    else {
        return Ok(None);
    };

    Ok(Some(ImageTemplate {
        template: template.to_string(),
        count: last - first + 1,
        counter: Some(span),
        first_image: Some(first),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(prefix: &str, numbers: impl IntoIterator<Item = u64>) -> Vec<String> {
        numbers
            .into_iter()
            .map(|n| format!("{}{:04}.cbf", prefix, n))
            .collect()
    }

    #[test]
    fn test_consecutive_images_form_one_template() {
        let files = names("/data/xtal_1_", 1..=3);
        let templates = detect_templates(&files);

        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].template, "/data/xtal_1_0001.cbf");
        assert_eq!(templates[0].count, 3);
        assert_eq!(templates[0].scan_range(), Some((1, 3)));
    }

    #[test]
    fn test_counter_carry_is_followed() {
        let files = names("img_", 1..=120);
        let templates = detect_templates(&files);

        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].count, 120);
        assert_eq!(templates[0].scan_range(), Some((1, 120)));
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let mut files = names("img_", 5..=9);
        files.reverse();
        let templates = detect_templates(&files);

        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].scan_range(), Some((5, 9)));
    }

    #[test]
    fn test_gap_starts_new_template() {
        let mut files = names("img_", 1..=3);
        files.extend(names("img_", 7..=8));
        let templates = detect_templates(&files);

        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].scan_range(), Some((1, 3)));
        assert_eq!(templates[1].scan_range(), Some((7, 8)));
    }

    #[test]
    fn test_two_sweeps_are_separate_templates() {
        let mut files = names("xtal_1_", 1..=4);
        files.extend(names("xtal_2_", 1..=4));
        let templates = detect_templates(&files);

        assert_eq!(templates.len(), 2);
        assert_eq!(templates[1].template, "xtal_2_0001.cbf");
    }

    #[test]
    fn test_single_file_has_no_counter() {
        let templates = detect_templates(&["image.cbf"]);
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].counter, None);
        assert_eq!(templates[0].scan_range(), None);
    }

    #[test]
    fn test_different_lengths_do_not_join() {
        let templates = detect_templates(&["a_1.cbf", "a_10.cbf"]);
        assert_eq!(templates.len(), 2);
        assert!(templates.iter().all(|t| t.counter.is_none()));
    }

    #[test]
    fn test_range_argument() {
        let template = parse_range_argument("/data/x4_0001.cbf:1:100")
            .unwrap()
            .unwrap();
        assert_eq!(template.template, "/data/x4_0001.cbf");
        assert_eq!(template.count, 100);
        assert_eq!(template.counter, Some(9..13));
        assert_eq!(template.scan_range(), Some((1, 100)));
    }

    #[test]
    fn test_range_argument_without_counter() {
        assert_eq!(parse_range_argument("/data/image.cbf:1:10").unwrap(), None);
        assert_eq!(parse_range_argument("/data/image_0001.cbf").unwrap(), None);
    }

    #[test]
    fn test_range_argument_rejects_bad_numbers() {
        assert!(parse_range_argument("x_0001.cbf:a:10").is_err());
        assert!(parse_range_argument("x_0001.cbf:10:1").is_err());
    }
}
