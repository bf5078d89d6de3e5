use crate::intensity::{self, CountRateAssessment, IntensityReport};
use crate::plot;
use crate::process::ToolRunner;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xtalscreen_core::{
    IndexingSolution, PlotConfig, ProcessInvocation, ProcessResult, ProfileModel, Result,
    XtalscreenError,
};
use xtalscreen_parser::{
    count_images, detect_templates, extract_bravais_table, parse_indexing_solution,
    parse_overload, parse_processor_count, parse_range_argument, read_profile_estimate,
    ImageTemplate,
};

const DATABLOCK: &str = "datablock.json";
const STRONG_SPOTS: &str = "strong.pickle";
const ALL_SPOTS: &str = "all_spots.pickle";
const EXPERIMENTS: &str = "experiments.json";
const INDEXED: &str = "indexed.pickle";
const PROFILE_EXPERIMENTS: &str = "experiments_with_profile_model.json";
const OVERLOAD: &str = "overload.json";

/// Datasets with fewer images skip profile modelling and the intensity check
const FAST_MODE_IMAGE_LIMIT: u64 = 10;

/// What to screen
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScreenRequest {
    /// Image files, an image directory, a `template:first:last` range, or a
    /// single datablock JSON file
    pub inputs: Vec<String>,
    pub nproc: Option<usize>,
    /// Identifier for log correlation, generated when not given
    pub run_id: Option<Uuid>,
}

/// Facts established by the early pipeline steps, handed to the later ones
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenContext {
    pub run_id: Uuid,
    pub nproc: usize,
    pub datablock: String,
    pub images: u64,
}

impl ScreenContext {
    pub fn fast_mode(&self) -> bool {
        self.images < FAST_MODE_IMAGE_LIMIT
    }
}

#[derive(Debug, Clone)]
pub struct ScreenSummary {
    pub context: ScreenContext,
    pub solution: Option<IndexingSolution>,
    pub profile: Option<ProfileModel>,
    pub intensity: Option<IntensityReport>,
    pub runtime_secs: f64,
}

/// Result of the indexing step
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    /// Indexing succeeded; the solution is `None` if its summary could not
    /// be read from the indexer output.
    Indexed(Option<IndexingSolution>),
    Failed,
}

/// Runs the screening workflow for one dataset
pub struct ScreenExecutor<R: ToolRunner> {
    runner: R,
    work_dir: PathBuf,
    debug: bool,
    plot: PlotConfig,
}

impl<R: ToolRunner> ScreenExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            work_dir: PathBuf::from("."),
            debug: false,
            plot: PlotConfig::default(),
        }
    }

    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Echo every tool invocation and its output to the debug log
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_plot_config(mut self, plot: PlotConfig) -> Self {
        self.plot = plot;
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    async fn run_tool<I, S>(&self, command: I) -> Result<ProcessResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // Tool diagnostics go to the log as they arrive; stdout is parsed.
        let invocation = ProcessInvocation::new(command)
            .with_work_dir(&self.work_dir)
            .with_debug(self.debug)
            .with_echo(false, true);
        debug!(command = %invocation.display(), "Running tool");
        let result = self.runner.run(invocation).await?;
        debug!(
            exitcode = result.exitcode,
            runtime = result.runtime,
            timeout = result.timeout,
            stdout = %result.stdout,
            stderr = %result.stderr,
            "Tool finished"
        );
        Ok(result)
    }

    /// Run the whole screening workflow
    pub async fn execute(&self, request: &ScreenRequest) -> Result<ScreenSummary> {
        let started = Instant::now();
        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
        info!(run_id = %run_id, inputs = ?request.inputs, "Starting screening");

        let nproc = self.count_processors(request.nproc).await?;
        debug!("Using {} processors", nproc);

        let datablock = match request.inputs.as_slice() {
            [json] if json.ends_with(".json") => json.clone(),
            inputs => {
                self.import(inputs).await?;
                DATABLOCK.to_string()
            }
        };

        let images = self.count_images(&datablock)?;
        let context = ScreenContext {
            run_id,
            nproc,
            datablock,
            images,
        };
        if context.fast_mode() {
            info!("{} images found, skipping a lot of processing", images);
        }

        self.find_spots(&context, &[]).await?;
        let solution = match self.index(&context).await? {
            IndexOutcome::Indexed(solution) => solution,
            IndexOutcome::Failed => self.retry_index_with_strong_spots(&context).await?,
        };

        let mut profile = None;
        let mut intensity = None;
        if !context.fast_mode() {
            let model = match self.create_profile_model().await? {
                Some(model) => model,
                None => self.refine_and_retry_profile_model().await?,
            };
            self.report().await?;
            self.predict().await?;
            intensity = Some(self.check_intensities(&context, Some(&model)).await?);
            profile = Some(model);
        }
        self.refine_bravais().await?;

        let runtime_secs = started.elapsed().as_secs_f64();
        debug!(run_id = %run_id, "Finished, total runtime: {:.1}", runtime_secs);
        info!("xtalscreen successfully completed ({:.1} sec)", runtime_secs);

        Ok(ScreenSummary {
            context,
            solution,
            profile,
            intensity,
            runtime_secs,
        })
    }

    pub async fn count_processors(&self, nproc: Option<usize>) -> Result<usize> {
        if let Some(nproc) = nproc {
            return Ok(nproc);
        }
        let result = self.run_tool(["libtbx.show_number_of_processors"]).await?;
        if result.exitcode != 0 {
            warn!(
                "Could not determine number of available processors. Error code {}",
                result.exitcode
            );
            return Err(XtalscreenError::ToolFailed {
                tool: "libtbx.show_number_of_processors".to_string(),
                exitcode: result.exitcode,
            });
        }
        parse_processor_count(&result.stdout)
    }

    pub async fn import(&self, inputs: &[String]) -> Result<()> {
        info!("Importing data...");
        let mut files = inputs.to_vec();
        if let [single] = inputs {
            let path = Path::new(single);
            if path.is_dir() {
                debug!("You specified a directory. Importing all CBF files in that directory.");
                files = cbf_files_in(path)?;
            } else if let Some(template) = parse_range_argument(single)? {
                debug!("You specified an image range in the xia2 format. Importing all specified files.");
                if !self.quick_import_templates(&[template]).await? {
                    return Err(XtalscreenError::Import(
                        "Could not import specified image range.".to_string(),
                    ));
                }
                info!("Quick import successful");
                return Ok(());
            }
        }

        if self.quick_import(&files).await? {
            info!("Quick import successful");
            return Ok(());
        }
        self.run_dials_import(files).await
    }

    async fn quick_import(&self, files: &[String]) -> Result<bool> {
        if files.len() < 2 {
            return Ok(false);
        }
        debug!("Attempting quick import...");
        let templates = detect_templates(files);
        self.quick_import_templates(&templates).await
    }

    async fn quick_import_templates(&self, templates: &[ImageTemplate]) -> Result<bool> {
        debug!(templates = ?templates, "Quick import template summary");
        let [template] = templates else {
            debug!("Cannot currently run quick import on multiple templates");
            return Ok(false);
        };
        let Some((first, last)) = template.scan_range() else {
            debug!("Cannot run quick import: could not determine image naming template");
            return Ok(false);
        };

        info!("Running quick import");
        self.run_dials_import(vec![
            template.template.clone(),
            format!("geometry.scan.image_range={},{}", first, last),
            "geometry.scan.extrapolate_scan=True".to_string(),
        ])
        .await?;
        Ok(true)
    }

    async fn run_dials_import(&self, parameters: Vec<String>) -> Result<()> {
        let command = std::iter::once("dials.import".to_string()).chain(parameters);
        let result = self.run_tool(command).await?;

        if result.exitcode == 0 {
            if self.path(DATABLOCK).is_file() {
                info!("Successfully completed ({:.1} sec)", result.runtime);
                return Ok(());
            }
            return Err(XtalscreenError::Import(
                "Could not import images. Do the specified images exist at that location?"
                    .to_string(),
            ));
        }
        if result.stderr.contains("More than 1 sweep was found.") {
            return Err(XtalscreenError::Import(
                "The data contain multiple sweeps. xtalscreen can only run on a single sweep of data."
                    .to_string(),
            ));
        }
        warn!("Failed with exit code {}", result.exitcode);
        Err(XtalscreenError::ToolFailed {
            tool: "dials.import".to_string(),
            exitcode: result.exitcode,
        })
    }

    pub fn count_images(&self, datablock: &str) -> Result<u64> {
        let content = std::fs::read_to_string(self.path(datablock))?;
        count_images(&content).map_err(|e| {
            warn!("Could not determine number of images in dataset");
            e
        })
    }

    pub async fn find_spots(&self, context: &ScreenContext, extra: &[&str]) -> Result<()> {
        info!("Spot finding...");
        let mut command = vec![
            "dials.find_spots".to_string(),
            context.datablock.clone(),
            format!("nproc={}", context.nproc),
        ];
        command.extend(extra.iter().map(|s| s.to_string()));

        let result = self.run_tool(command).await?;
        if result.exitcode != 0 {
            warn!("Failed with exit code {}", result.exitcode);
            return Err(XtalscreenError::ToolFailed {
                tool: "dials.find_spots".to_string(),
                exitcode: result.exitcode,
            });
        }
        info!("Successfully completed ({:.1} sec)", result.runtime);
        Ok(())
    }

    /// Index the strong spots, retrying with a cell constraint and then with
    /// a 1D FFT search.
    pub async fn index(&self, context: &ScreenContext) -> Result<IndexOutcome> {
        let base = vec![
            "dials.index".to_string(),
            context.datablock.clone(),
            STRONG_SPOTS.to_string(),
            format!("indexing.nproc={}", context.nproc),
        ];
        let attempts: [(&str, Option<&str>); 3] = [
            ("Indexing", None),
            ("Retrying with max_cell constraint", Some("max_cell=20")),
            ("Retrying with 1D FFT", Some("indexing.method=fft1d")),
        ];

        for (message, extra) in attempts {
            info!("{}...", message);
            let mut command = base.clone();
            command.extend(extra.map(str::to_string));

            let result = self.run_tool(command).await?;
            if result.exitcode != 0 {
                warn!("Failed with exit code {}", result.exitcode);
                continue;
            }

            let solution = parse_indexing_solution(&result.stdout);
            match &solution {
                Some(solution) => info!(
                    "Found primitive solution: {} ({}) using {} reflections",
                    solution.space_group, solution.unit_cell, solution.reflections
                ),
                None => warn!("Could not read the indexing solution from the indexer output"),
            }
            info!("Successfully completed ({:.1} sec)", result.runtime);
            return Ok(IndexOutcome::Indexed(solution));
        }
        Ok(IndexOutcome::Failed)
    }

    async fn retry_index_with_strong_spots(
        &self,
        context: &ScreenContext,
    ) -> Result<Option<IndexingSolution>> {
        info!("Retrying for stronger spots only...");
        tokio::fs::rename(self.path(STRONG_SPOTS), self.path(ALL_SPOTS)).await?;
        self.find_spots(context, &["sigma_strong=15"]).await?;

        match self.index(context).await? {
            IndexOutcome::Indexed(solution) => Ok(solution),
            IndexOutcome::Failed => {
                info!(
                    "Could not find an indexing solution. You may want to have a look\n\
                     at the reciprocal space by running:\n\n  \
                     dials.reciprocal_lattice_viewer {} {}\n\n\
                     or, to only include stronger spots:\n\n  \
                     dials.reciprocal_lattice_viewer {} {}\n",
                    context.datablock, ALL_SPOTS, context.datablock, STRONG_SPOTS
                );
                Err(XtalscreenError::GaveUp(
                    "could not find an indexing solution".to_string(),
                ))
            }
        }
    }

    /// Build the basic and the extended profile model. `None` when neither
    /// could be created.
    pub async fn create_profile_model(&self) -> Result<Option<ProfileModel>> {
        let variants: [(&str, Option<&str>); 2] = [
            ("Creating profile model...", None),
            ("Creating extended profile model...", Some("sigma_m_algorithm=extended")),
        ];

        let mut model = ProfileModel::default();
        let mut last_exitcode = 0;
        for (message, extra) in variants {
            info!("{}", message);
            let mut command = vec![
                "dials.create_profile_model".to_string(),
                EXPERIMENTS.to_string(),
                INDEXED.to_string(),
            ];
            command.extend(extra.map(str::to_string));

            let result = self.run_tool(command).await?;
            last_exitcode = result.exitcode;
            if result.exitcode != 0 {
                continue;
            }

            let content = tokio::fs::read_to_string(self.path(PROFILE_EXPERIMENTS)).await?;
            let estimate = read_profile_estimate(&content)?;
            info!(
                "{} images, {} deg. oscillation, sigma_m={:.3}",
                estimate.num_images, estimate.oscillation, estimate.sigma_m
            );
            info!("Successfully completed ({:.1} sec)", result.runtime);

            model.num_images = estimate.num_images;
            model.oscillation = estimate.oscillation;
            if extra.is_some() {
                model.sigma_m_extended = Some(estimate.sigma_m);
            } else {
                model.sigma_m_basic = Some(estimate.sigma_m);
            }
        }

        if model.is_available() {
            Ok(Some(model))
        } else {
            warn!("Failed with exit code {}", last_exitcode);
            Ok(None)
        }
    }

    async fn refine_and_retry_profile_model(&self) -> Result<ProfileModel> {
        info!("Refining model to attempt to increase number of valid spots...");
        self.refine().await?;
        match self.create_profile_model().await? {
            Some(model) => Ok(model),
            None => {
                info!(
                    "The identified indexing solution may not be correct. You may want to have a look\n\
                     at the reciprocal space by running:\n\n  \
                     dials.reciprocal_lattice_viewer {} {}\n",
                    EXPERIMENTS, INDEXED
                );
                Err(XtalscreenError::GaveUp(
                    "could not create a profile model".to_string(),
                ))
            }
        }
    }

    /// Refine the indexed model and move the refined files into place,
    /// keeping the unrefined ones.
    pub async fn refine(&self) -> Result<()> {
        info!("Refining...");
        let result = self
            .run_tool(["dials.refine", EXPERIMENTS, INDEXED])
            .await?;
        if result.exitcode != 0 {
            warn!("Failed with exit code {}", result.exitcode);
            return Err(XtalscreenError::ToolFailed {
                tool: "dials.refine".to_string(),
                exitcode: result.exitcode,
            });
        }

        info!("Successfully refined ({:.1} sec)", result.runtime);
        let moves = [
            (EXPERIMENTS, "experiments.unrefined.json"),
            (INDEXED, "indexed.unrefined.pickle"),
            ("refined_experiments.json", EXPERIMENTS),
            ("refined.pickle", INDEXED),
        ];
        for (from, to) in moves {
            tokio::fs::rename(self.path(from), self.path(to)).await?;
        }
        Ok(())
    }

    pub async fn predict(&self) -> Result<bool> {
        info!("Predicting reflections...");
        let result = self.run_tool(["dials.predict", PROFILE_EXPERIMENTS]).await?;
        if result.exitcode != 0 {
            warn!("Failed with exit code {}", result.exitcode);
            return Ok(false);
        }
        info!("To view predicted reflections run:");
        info!("  dials.image_viewer {} predicted.pickle", PROFILE_EXPERIMENTS);
        info!("Successfully completed ({:.1} sec)", result.runtime);
        Ok(true)
    }

    pub async fn report(&self) -> Result<()> {
        info!("Creating report...");
        let result = self
            .run_tool(["dials.report", PROFILE_EXPERIMENTS, INDEXED])
            .await?;
        if result.exitcode != 0 {
            warn!("Failed with exit code {}", result.exitcode);
            return Err(XtalscreenError::ToolFailed {
                tool: "dials.report".to_string(),
                exitcode: result.exitcode,
            });
        }
        info!("Successfully completed ({:.1} sec)", result.runtime);
        Ok(())
    }

    /// Survey pixel intensities and estimate how close the strongest pixel
    /// comes to the detector's count rate limit.
    pub async fn check_intensities(
        &self,
        context: &ScreenContext,
        profile: Option<&ProfileModel>,
    ) -> Result<IntensityReport> {
        info!("Testing pixel intensities...");
        let result = self
            .run_tool([
                "xia2.overload".to_string(),
                format!("nproc={}", context.nproc),
                context.datablock.clone(),
            ])
            .await?;
        info!("Successfully completed ({:.1} sec)", result.runtime);
        if result.exitcode != 0 {
            warn!("Failed with exit code {}", result.exitcode);
            return Err(XtalscreenError::ToolFailed {
                tool: "xia2.overload".to_string(),
                exitcode: result.exitcode,
            });
        }

        let content = tokio::fs::read_to_string(self.path(OVERLOAD)).await?;
        let data = parse_overload(&content)?;
        let report = intensity::analyse(&data, profile)?;
        self.log_scale(&report);
        self.plot_and_assess(&report).await;
        Ok(report)
    }

    fn log_scale(&self, report: &IntensityReport) {
        info!("Pixel intensity distribution:");
        for line in report.scale.describe(report.mosaicity_corrected) {
            info!("{}", line);
        }

        let precision = report.rescaled.precision();
        let granularity = f64::from(report.rescaled.granularity);
        debug!(
            "rescaled histogram: {{ {} }}",
            report
                .rescaled
                .bins
                .iter()
                .map(|(bin, pixels)| format!(
                    "{:.*}:{}",
                    precision,
                    *bin as f64 / granularity,
                    pixels
                ))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    async fn plot_and_assess(&self, report: &IntensityReport) {
        plot::plot_histogram(&self.runner, &report.rescaled, &self.plot, self.debug).await;

        let text = format!(
            "Strongest pixel ({} counts) reaches {:.1} % of the detector count rate limit",
            report.max_count, report.hist_max
        );
        if report.hist_max > 100.0 {
            warn!("Warning: {}!", text);
        } else {
            info!("{}", text);
        }
        if report.scale.average_to_peak_extended.is_some() {
            info!(
                "   {}(basic profile model estimate: {:.1} %)",
                " ".repeat(report.max_count.to_string().len()),
                report.max_count as f64 * report.scale.scale_basic
            );
        }

        match report.assessment {
            CountRateAssessment::Overloaded => {
                warn!("Warning: THE DATA CONTAIN REGULAR OVERLOADS!");
                warn!("         The photon incidence rate is outside the specified limits of the detector.");
                warn!("         The built-in detector count rate correction cannot adjust for this.");
                warn!("         You should aim for count rates below 25% of the detector limit.");
            }
            CountRateAssessment::FarOutsideLinearRange => {
                warn!("Warning: The photon incidence rate is well outside the linear response region of the detector (<25%).");
                warn!("         The built-in detector count rate correction may not be able to adjust for this.");
            }
            CountRateAssessment::OutsideLinearRange => {
                info!("The photon incidence rate is outside the linear response region of the detector (<25%).");
                info!("The built-in detector count rate correction should be able to adjust for this.");
            }
            CountRateAssessment::WithinLinearRange => {}
        }
        if !report.mosaicity_corrected {
            warn!("Warning: Not enough data for proper profile estimation.");
            warn!("         The spot intensities are not corrected for mosaicity.");
            warn!("         The true photon incidence rate will be higher than the given estimate.");
        }

        info!("Total sum of counts in dataset: {}", report.count_sum);
    }

    pub async fn refine_bravais(&self) -> Result<()> {
        info!("Refining bravais settings...");
        let result = self
            .run_tool(["dials.refine_bravais_settings", EXPERIMENTS, INDEXED])
            .await?;
        if result.exitcode != 0 {
            warn!("Failed with exit code {}", result.exitcode);
            return Err(XtalscreenError::ToolFailed {
                tool: "dials.refine_bravais_settings".to_string(),
                exitcode: result.exitcode,
            });
        }
        match extract_bravais_table(&result.stdout) {
            Some(table) => info!("{}", table),
            None => warn!("Could not find the table of Bravais settings in the output"),
        }
        info!("Successfully completed ({:.1} sec)", result.runtime);
        Ok(())
    }
}

/// All `*.cbf` files directly inside `dir`, sorted
fn cbf_files_in(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "cbf") {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    if files.is_empty() {
        return Err(XtalscreenError::Import(format!(
            "no CBF files found in {}",
            dir.display()
        )));
    }
    files.sort();
    Ok(files)
}
