pub mod executor;
pub mod intensity;
pub mod plot;
pub mod process;
pub mod stream;
pub mod termination;

pub use executor::{IndexOutcome, ScreenContext, ScreenExecutor, ScreenRequest, ScreenSummary};
pub use intensity::{CountRateAssessment, IntensityReport};
pub use process::{run_process, ProcessRunner, RunnerSettings, ToolRunner};
pub use termination::{exit_code, Termination, TerminationState};
