use clap::{ArgAction, Parser};
use fluxgen_bfl::{
    BflClient, BflError, DEFAULT_GUIDANCE, DEFAULT_HEIGHT, DEFAULT_INTERVAL,
    DEFAULT_SAFETY_TOLERANCE, DEFAULT_STEPS, DEFAULT_VARIANT, DEFAULT_WIDTH, GenerationRequest,
    JobApi, PollEvent, PollOptions, job_id, poll_until_ready, sample_url,
};
use fluxgen_config::{
    Config, ConfigError, DotenvFiles, DotenvValues, poll_interval_seconds, resolve_api_key,
    seconds,
};
use fluxgen_output::{
    ArtifactPaths, OutputDir, OutputError, RunTimestamp, save_bytes, save_json, to_pretty_json,
};
use fluxgen_utils::{PromptError, RANDOM_SEED_TOKEN, SeedError, SeedPolicy, read_prompt};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const LOG_FILTER: &str = "warn";
const VERBOSE_LOG_FILTER: &str =
    "warn,fluxgen=debug,fluxgen_bfl=debug,fluxgen_config=debug,fluxgen_output=debug";

/// fluxgen CLI entry point.
///
/// Reads a prompt from standard input, submits it to the Black Forest Labs
/// FLUX API and stores the request, the result and the generated image.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fluxgen",
    author,
    version,
    about = "Generate images with the FLUX diffusion API. The prompt is read from standard input.",
    long_about = None,
    disable_version_flag = true
)]
struct Cli {
    /// Width of the image in pixels.
    #[arg(short = 'W', long, default_value_t = DEFAULT_WIDTH)]
    width: u32,
    /// Height of the image in pixels.
    #[arg(short = 'H', long, default_value_t = DEFAULT_HEIGHT)]
    height: u32,
    /// Variant of the diffusion model.
    #[arg(short = 'v', long, default_value_t = DEFAULT_VARIANT.to_string())]
    variant: String,
    /// Number of network evaluations. Higher values improve quality but take longer.
    #[arg(
        short = 's',
        long,
        default_value_t = DEFAULT_STEPS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    steps: u32,
    /// Let the API upsample the prompt for more detailed results.
    #[arg(short = 'p', long, alias = "prompt_upsampling")]
    prompt_upsampling: bool,
    /// Generation seed: an integer, 'rand' for a random seed, or 'null' to send null.
    #[arg(long, value_name = "SEED", default_value = RANDOM_SEED_TOKEN)]
    seed: String,
    /// Guidance scale. Higher values follow the prompt more strictly.
    #[arg(short = 'g', long, default_value_t = DEFAULT_GUIDANCE)]
    guidance: f64,
    /// Content filter tolerance. Lower values filter more strictly.
    #[arg(
        short = 't',
        long,
        alias = "safety_tolerance",
        default_value_t = DEFAULT_SAFETY_TOLERANCE
    )]
    safety_tolerance: i32,
    /// Diffusion interval. Smaller values give more stable outputs, larger ones more variety.
    #[arg(short = 'i', long, default_value_t = DEFAULT_INTERVAL)]
    interval: f64,
    /// Seconds to wait between status checks [default: from config, 1]
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<f64>,
    /// Give up after waiting this many seconds for the job [default: wait forever]
    #[arg(long, value_name = "SECS")]
    max_wait: Option<f64>,
    /// Directory receiving request, result and image files [default: from config, ./output]
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Print the request and every API response.
    #[arg(short = 'V', long)]
    verbose: bool,
    /// Print version
    #[arg(long, action = ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    /// Bad credentials, prompt, arguments or local files. Aborts the run.
    FatalInput,
    /// Submission failed or the API never produced a usable job. Aborts the run.
    FatalNetwork,
    /// Reported and skipped.
    TransientNetwork,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("Error: {0}.")]
    Config(#[from] ConfigError),
    #[error("Error: {0}.")]
    Prompt(#[from] PromptError),
    #[error("Error: {0}.")]
    Seed(#[from] SeedError),
    #[error("Error: {0}.")]
    Output(#[from] OutputError),
    #[error("Error: {0}.")]
    Credentials(#[source] BflError),
    #[error("Error during POST request: {0}")]
    Submit(#[source] BflError),
    #[error("Error: {0}.")]
    Job(#[source] BflError),
    #[error("Error during GET request: {0}")]
    StatusCheck(#[source] BflError),
    #[error("Failed to download image from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: BflError,
    },
}

impl RunError {
    fn kind(&self) -> ErrorKind {
        match self {
            RunError::Config(_)
            | RunError::Prompt(_)
            | RunError::Seed(_)
            | RunError::Output(_)
            | RunError::Credentials(_) => ErrorKind::FatalInput,
            RunError::Submit(_) | RunError::Job(_) => ErrorKind::FatalNetwork,
            RunError::StatusCheck(_) | RunError::Download { .. } => ErrorKind::TransientNetwork,
        }
    }
}

/// Everything resolved from config files and the environment before a run.
#[derive(Debug, Clone)]
struct Settings {
    api_key: String,
    base_url: String,
    output_dir: PathBuf,
    poll: PollOptions,
    verbose: bool,
}

impl Settings {
    fn resolve(cli: &Cli, config: &Config, dotenv: &DotenvValues) -> Result<Self, RunError> {
        let api_key = resolve_api_key(&config.bfl_api.api_key_env_var, dotenv)?;

        let interval = match cli.poll_interval {
            Some(value) => poll_interval_seconds("--poll-interval", value)?,
            None => config.poll_interval()?,
        };
        let max_wait = match cli.max_wait {
            Some(value) => Some(seconds("--max-wait", value)?),
            None => config.max_wait()?,
        };

        Ok(Self {
            api_key,
            base_url: config.bfl_api.base_url.clone(),
            output_dir: cli
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(&config.output_dir)),
            poll: PollOptions { interval, max_wait },
            verbose: cli.verbose,
        })
    }
}

/// Paths written by a finished run.
#[derive(Debug)]
struct RunReport {
    job_id: String,
    artifacts: ArtifactPaths,
    image_saved: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(report) => {
            info!(
                "job {} finished, result written to {}",
                report.job_id,
                report.artifacts.result_json.display()
            );
            if !report.image_saved {
                debug!("no image was saved for job {}", report.job_id);
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            debug!("run failed ({:?})", error.kind());
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose { VERBOSE_LOG_FILTER } else { LOG_FILTER };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> Result<RunReport, RunError> {
    let config = load_config()?;
    let dotenv = DotenvFiles::discover()?.load()?;
    let settings = Settings::resolve(&cli, &config, &dotenv)?;

    let stdin = io::stdin();
    let prompt_cue = stdin.is_terminal();

    run_with(
        &cli,
        &settings,
        stdin.lock(),
        prompt_cue,
        connect,
        thread::sleep,
        &mut io::stdout(),
    )
}

/// Reads the prompt, then opens the API through `connect` and runs the job.
///
/// Nothing touches the network or the output directory until the prompt and
/// seed have been validated.
fn run_with<R, A, C, S>(
    cli: &Cli,
    settings: &Settings,
    input: R,
    prompt_cue: bool,
    connect: C,
    sleep: S,
    out: &mut dyn Write,
) -> Result<RunReport, RunError>
where
    R: Read,
    A: JobApi,
    C: FnOnce(&Settings) -> Result<A, RunError>,
    S: FnMut(Duration),
{
    if prompt_cue {
        report(out, format_args!("Enter your prompt:"));
    }
    let request = read_request(cli, input)?;

    let api = connect(settings)?;
    let output_dir = OutputDir::prepare(&settings.output_dir)?;
    let timestamp = RunTimestamp::now();

    execute(&api, &request, &output_dir, &timestamp, settings, sleep, out)
}

fn connect(settings: &Settings) -> Result<BflClient, RunError> {
    BflClient::new(settings.base_url.as_str(), settings.api_key.as_str())
        .map_err(RunError::Credentials)
}

fn load_config() -> Result<Config, RunError> {
    match fluxgen_config::load() {
        Ok(outcome) => {
            if !outcome.found {
                debug!("{} not found, using defaults", outcome.path.display());
            }
            Ok(outcome.config)
        }
        Err(ConfigError::ConfigDirUnavailable) => {
            eprintln!(
                "Warning: could not determine the home directory. Falling back to default settings."
            );
            Ok(Config::default())
        }
        Err(error) => Err(error.into()),
    }
}

/// Reads the prompt from `input` and builds the request from the CLI flags.
fn read_request<R: Read>(cli: &Cli, input: R) -> Result<GenerationRequest, RunError> {
    let prompt = read_prompt(input)?;
    let seed = cli.seed.parse::<SeedPolicy>()?.resolve();

    Ok(GenerationRequest {
        prompt,
        width: cli.width,
        height: cli.height,
        variant: cli.variant.clone(),
        steps: cli.steps,
        prompt_upsampling: cli.prompt_upsampling,
        seed,
        guidance: cli.guidance,
        safety_tolerance: cli.safety_tolerance,
        interval: cli.interval,
    })
}

/// Submits `request`, waits for the job and persists its artifacts.
///
/// User-facing progress goes to `out`. Status-check and download failures are
/// written there as well and do not end the run.
fn execute<A, S>(
    api: &A,
    request: &GenerationRequest,
    output_dir: &OutputDir,
    timestamp: &RunTimestamp,
    settings: &Settings,
    sleep: S,
    out: &mut dyn Write,
) -> Result<RunReport, RunError>
where
    A: JobApi + ?Sized,
    S: FnMut(Duration),
{
    if output_dir.created() {
        report(out, format_args!("Created directory: {}", output_dir.path().display()));
    }

    let artifacts = output_dir.artifacts(timestamp);
    save_json(request, &artifacts.request_json)?;

    if settings.verbose {
        report_json(out, "Request JSON:", request);
    }

    let response = api.submit(request).map_err(RunError::Submit)?;
    if settings.verbose {
        report_json(out, "Response from POST request:", &response);
    }

    let id = job_id(&response).map_err(RunError::Job)?.to_string();
    info!("submitted job {id}");

    let result = poll_until_ready(api, &id, &settings.poll, sleep, |event| match event {
        PollEvent::Failed { attempt, error } => {
            let transient = RunError::StatusCheck(error);
            debug!("status check #{attempt} failed ({:?})", transient.kind());
            report(out, format_args!("{transient}"));
        }
        PollEvent::Pending {
            attempt,
            status,
            response,
        } => {
            debug!("status check #{attempt} returned {status:?}");
            if settings.verbose {
                report_json(out, "Result Response:", response);
            }
            report(out, format_args!("Status: {}", status.unwrap_or("None")));
        }
        PollEvent::Ready { attempt, response } => {
            debug!("job ready after {attempt} status check(s)");
            if settings.verbose {
                report_json(out, "Result Response:", response);
            }
            report(out, format_args!("Result is ready."));
        }
    })
    .map_err(RunError::Job)?;

    save_json(&result, &artifacts.result_json)?;

    let image_saved = match sample_url(&result) {
        Some(url) => match api.download(url) {
            Ok(bytes) => {
                save_bytes(&bytes, &artifacts.result_image)?;
                report(
                    out,
                    format_args!("Image saved to {}", artifacts.result_image.display()),
                );
                true
            }
            Err(source) => {
                let transient = RunError::Download {
                    url: url.to_string(),
                    source,
                };
                debug!("download skipped ({:?})", transient.kind());
                report(out, format_args!("{transient}"));
                false
            }
        },
        None => {
            report(out, format_args!("No image URL found in the result."));
            false
        }
    };

    Ok(RunReport {
        job_id: id,
        artifacts,
        image_saved,
    })
}

fn report(out: &mut dyn Write, line: fmt::Arguments<'_>) {
    if let Err(error) = writeln!(out, "{line}") {
        warn!("failed to write progress output: {error}");
    }
}

fn report_json<T: Serialize + ?Sized>(out: &mut dyn Write, label: &str, value: &T) {
    match to_pretty_json(value) {
        Ok(text) => report(out, format_args!("{label}\n{text}")),
        Err(error) => warn!("could not print {label} {error}"),
    }
}
