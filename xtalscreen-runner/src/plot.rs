use crate::intensity::RescaledHistogram;
use crate::process::ToolRunner;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::IsTerminal;
use std::time::Duration;
use tracing::{debug, info, warn};
use xtalscreen_core::{PlotConfig, ProcessInvocation, XtalscreenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub columns: usize,
    pub rows: usize,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 25,
        }
    }
}

impl TerminalSize {
    /// Parse the `rows columns` line printed by `stty size`
    pub fn parse_stty(output: &str) -> Option<Self> {
        let mut fields = output.split_whitespace().map(str::parse::<usize>);
        let rows = fields.next()?.ok()?;
        let columns = fields.next()?.ok()?;
        if fields.next().is_some() || rows == 0 || columns == 0 {
            return None;
        }
        Some(Self { columns, rows })
    }

    /// Shrink to at most `max_columns` and keep a wide aspect ratio
    pub fn fit(self, max_columns: usize) -> Self {
        let columns = self.columns.min(max_columns);
        Self {
            columns,
            rows: self.rows.min(columns / 3),
        }
    }
}

/// Size of the controlling terminal, or 80x25 when there is none or it
/// cannot be queried.
pub async fn terminal_size<R: ToolRunner + ?Sized>(runner: &R, debug: bool) -> TerminalSize {
    if !std::io::stdout().is_terminal() {
        return TerminalSize::default();
    }
    let invocation = ProcessInvocation::new(["sh", "-c", "stty size < /dev/tty"])
        .with_timeout(Duration::from_secs(1))
        .with_debug(debug);
    match runner.run(invocation).await {
        Ok(result) if result.success() => {
            TerminalSize::parse_stty(&result.stdout).unwrap_or_default()
        }
        _ => TerminalSize::default(),
    }
}

/// gnuplot input drawing `histogram` as boxes on a dumb terminal
pub fn gnuplot_script(histogram: &RescaledHistogram, size: TerminalSize) -> String {
    let width = histogram.bin_width();
    let mut script = String::new();
    let _ = writeln!(script, "set term dumb {} {}", size.columns, size.rows.saturating_sub(2));
    script.push_str("set title 'Spot intensity distribution'\n");
    script.push_str("set xlabel '% of maximum'\n");
    script.push_str("set ylabel 'Number of observed pixels'\n");
    script.push_str("set logscale y\n");
    let _ = writeln!(script, "set boxwidth {:.6}", width);
    script.push_str("set xtics out nomirror\n");
    script.push_str("set ytics out\n");
    script.push_str("plot '-' using 1:2 title '' with boxes\n");
    for (&bin, &pixels) in &histogram.bins {
        let _ = writeln!(script, "{:.6} {}", bin as f64 * width, pixels);
    }
    script.push_str("e\n");
    script
}

/// Fill the box outlines of a dumb-terminal bar chart.
///
/// Columns holding a `*` stay filled on the following lines until a line
/// without any `*` is reached. Blank lines are dropped.
pub fn fill_bars(plot: &str) -> Vec<String> {
    let mut filled = BTreeSet::new();
    let mut lines = Vec::new();
    for line in plot.split('\n') {
        if line.trim().is_empty() {
            continue;
        }
        let mut chars: Vec<char> = line.chars().collect();
        let stars: Vec<usize> = chars
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == '*')
            .map(|(i, _)| i)
            .collect();
        if stars.is_empty() {
            filled.clear();
        } else {
            filled.extend(stars);
            for &column in &filled {
                if let Some(c) = chars.get_mut(column) {
                    *c = '*';
                }
            }
        }
        lines.push(chars.into_iter().collect());
    }
    lines
}

/// Render `histogram` through gnuplot and log the chart.
///
/// Returns the logged lines, or `None` when gnuplot could not be started or
/// failed; plotting problems never abort the screening.
pub async fn plot_histogram<R: ToolRunner + ?Sized>(
    runner: &R,
    histogram: &RescaledHistogram,
    config: &PlotConfig,
    debug: bool,
) -> Option<Vec<String>> {
    let size = terminal_size(runner, debug).await.fit(config.max_columns);
    let script = gnuplot_script(histogram, size);
    debug!(script = %script, "Running gnuplot");

    let invocation = ProcessInvocation::new(["gnuplot"])
        .with_stdin(script)
        .with_timeout(config.timeout())
        .with_debug(debug);
    let result = match runner.run(invocation).await {
        Ok(result) => result,
        Err(XtalscreenError::Launch { source, .. }) => {
            warn!(error = %source, "gnuplot not found. Can not plot intensity distribution.");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "Error running gnuplot");
            return None;
        }
    };

    if result.exitcode != 0 {
        warn!(
            "Error running gnuplot. Can not plot intensity distribution. Exit code {}",
            result.exitcode
        );
        return None;
    }

    let lines = fill_bars(&result.stdout);
    for line in &lines {
        info!("{}", line);
    }
    Some(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intensity::Histogram;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;
    use xtalscreen_core::{ProcessResult, Result};

    #[test]
    fn test_parse_stty() {
        assert_eq!(
            TerminalSize::parse_stty("50 200\n"),
            Some(TerminalSize {
                columns: 200,
                rows: 50
            })
        );
        assert_eq!(TerminalSize::parse_stty(""), None);
        assert_eq!(TerminalSize::parse_stty("50"), None);
        assert_eq!(TerminalSize::parse_stty("rows cols"), None);
    }

    #[test]
    fn test_fit_caps_width_and_height() {
        let size = TerminalSize {
            columns: 200,
            rows: 60,
        }
        .fit(120);
        assert_eq!(size, TerminalSize { columns: 120, rows: 40 });

        let small = TerminalSize::default().fit(120);
        assert_eq!(small, TerminalSize { columns: 80, rows: 25 });
    }

    #[test]
    fn test_gnuplot_script() {
        let histogram = RescaledHistogram {
            bins: Histogram::from([(3, 10), (25, 2)]),
            granularity: 10,
        };
        let script = gnuplot_script(&histogram, TerminalSize::default());
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "set term dumb 80 23");
        assert!(lines.contains(&"set boxwidth 0.100000"));
        assert!(lines.contains(&"plot '-' using 1:2 title '' with boxes"));
        assert_eq!(&lines[lines.len() - 3..], &["0.300000 10", "2.500000 2", "e"]);
        assert!(script.ends_with("e\n"));
    }

    #[test]
    fn test_fill_bars() {
        let plot = "\n  title\n  *  *\n  *    *\n\n  axis\n";
        let lines = fill_bars(plot);

        assert_eq!(
            lines,
            vec![
                "  title".to_string(),
                "  *  *".to_string(),
                "  *  * *".to_string(),
                "  axis".to_string(),
            ]
        );
    }

    /// Answers `gnuplot` with a fixed response and records the script it got
    struct FakeGnuplot {
        response: Option<(i32, &'static str)>,
        scripts: Mutex<Vec<String>>,
    }

    impl FakeGnuplot {
        fn new(response: Option<(i32, &'static str)>) -> Self {
            Self {
                response,
                scripts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolRunner for FakeGnuplot {
        async fn run(&self, invocation: ProcessInvocation) -> Result<ProcessResult> {
            let failed = |exitcode| ProcessResult {
                command: invocation.command.clone(),
                exitcode,
                stdout: String::new(),
                stderr: String::new(),
                runtime: 0.0,
                timeout: false,
            };
            if invocation.program() != "gnuplot" {
                return Ok(failed(1));
            }
            self.scripts
                .lock()
                .unwrap()
                .push(invocation.stdin.clone().unwrap_or_default());
            assert_eq!(invocation.timeout, Some(Duration::from_secs(120)));

            match self.response {
                Some((exitcode, stdout)) => Ok(ProcessResult {
                    stdout: stdout.to_string(),
                    ..failed(exitcode)
                }),
                None => Err(XtalscreenError::Launch {
                    command: "gnuplot".to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                }),
            }
        }
    }

    fn histogram() -> RescaledHistogram {
        RescaledHistogram {
            bins: Histogram::from([(1, 40), (2, 3)]),
            granularity: 1,
        }
    }

    #[tokio::test]
    async fn test_plot_histogram_fills_gnuplot_output() {
        let gnuplot = FakeGnuplot::new(Some((0, "\n  *  *\n  *    *\n  axis\n")));

        let lines = plot_histogram(&gnuplot, &histogram(), &PlotConfig::default(), false)
            .await
            .unwrap();

        assert_eq!(lines, vec!["  *  *", "  *  * *", "  axis"]);
        let scripts = gnuplot.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].starts_with("set term dumb 80 23\n"));
        assert!(scripts[0].ends_with("1.000000 40\n2.000000 3\ne\n"));
    }

    #[tokio::test]
    async fn test_plot_histogram_failure_is_not_fatal() {
        let gnuplot = FakeGnuplot::new(Some((1, "partial")));
        assert_eq!(
            plot_histogram(&gnuplot, &histogram(), &PlotConfig::default(), false).await,
            None
        );
    }

    #[tokio::test]
    async fn test_missing_gnuplot_is_not_fatal() {
        let gnuplot = FakeGnuplot::new(None);
        assert_eq!(
            plot_histogram(&gnuplot, &histogram(), &PlotConfig::default(), false).await,
            None
        );
        assert_eq!(gnuplot.scripts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fill_bars_ignores_columns_beyond_short_lines() {
        let lines = fill_bars("        *\n  *\n");
        assert_eq!(lines, vec!["        *".to_string(), "  *".to_string()]);
    }
}
