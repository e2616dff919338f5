use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueHint};
use mpgif::audio::AudioFormat;
use mpgif::container::{ContainerInfo, ContainerReader, Metadata};
use mpgif::convert::batch::{self, BatchJob};
use mpgif::convert::{
    CONTAINER_EXTENSION, DECODED_EXTENSION, DecodeOptions, EncodeOptions, VIDEO_EXTENSIONS,
    decode_file, encode_file, run_batch,
};
use mpgif::observability::{MetricsSnapshot, log_snapshot, write_metrics_json};
use mpgif::presets::{generate_recipe, known_presets};
use mpgif::progress::{ProgressSink, ProgressTable, ProgressUpdate};
use mpgif::recipe::Recipe;
use mpgif::validation::{ValidationReport, validate_recipe};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Encode {
            input,
            output,
            settings,
            jobs,
            print_metrics,
            metrics_json,
        } => {
            let options = settings.apply(EncodeOptions::default())?;
            let reporting = Reporting {
                print_metrics,
                metrics_json,
            };
            encode_command(&input, output.as_deref(), &options, jobs, &reporting)
        }
        Commands::Decode {
            input,
            output,
            frame_extension,
            jobs,
            print_metrics,
            metrics_json,
        } => {
            let options = DecodeOptions { frame_extension };
            let reporting = Reporting {
                print_metrics,
                metrics_json,
            };
            decode_command(&input, output.as_deref(), &options, jobs, &reporting)
        }
        Commands::Info { input, json } => info_command(&input, json),
        Commands::Run {
            recipe,
            dry_run,
            jobs,
            print_metrics,
            metrics_json,
        } => {
            let reporting = Reporting {
                print_metrics,
                metrics_json,
            };
            run_recipe(&recipe, dry_run, jobs, &reporting)
        }
        Commands::Validate { recipe } => validate_recipe_cmd(&recipe),
        Commands::Recipe { action } => recipe_command(action),
        Commands::Presets => {
            list_presets();
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct Reporting {
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
}

impl Reporting {
    fn emit(&self, snapshots: &BTreeMap<String, MetricsSnapshot>) -> Result<()> {
        if self.print_metrics {
            for (job, snapshot) in snapshots {
                log_snapshot(job, snapshot);
            }
        }
        if let Some(path) = &self.metrics_json {
            write_metrics_json(path, snapshots)?;
        }
        Ok(())
    }
}

/// Logs job progress at every tenth of completion and mirrors it into the
/// shared job table.
struct LogProgress<'a> {
    table: &'a ProgressTable,
    last_decile: Mutex<HashMap<String, u8>>,
}

impl<'a> LogProgress<'a> {
    fn new(table: &'a ProgressTable) -> Self {
        Self {
            table,
            last_decile: Mutex::new(HashMap::new()),
        }
    }
}

impl ProgressSink for LogProgress<'_> {
    fn report(&self, job_id: &str, update: &ProgressUpdate) {
        self.table.report(job_id, update);
        let decile = update.percent / 10;
        let Ok(mut last) = self.last_decile.lock() else {
            return;
        };
        if last.get(job_id).is_some_and(|seen| *seen >= decile) {
            return;
        }
        last.insert(job_id.to_string(), decile);
        info!(
            job = job_id,
            percent = update.percent,
            done = update.done,
            total = update.total,
            eta_s = update.eta.map(|eta| eta.as_secs()),
            "Progress"
        );
    }
}

fn encode_command(
    input: &Path,
    output: Option<&Path>,
    options: &EncodeOptions,
    jobs: usize,
    reporting: &Reporting,
) -> Result<()> {
    let batch_jobs = if input.is_dir() {
        let jobs = batch::collect_jobs(input, output, &VIDEO_EXTENSIONS, CONTAINER_EXTENSION)?;
        if jobs.is_empty() {
            warn!(dir = %input.display(), "No video files found");
            return Ok(());
        }
        jobs
    } else {
        let output = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| input.with_extension(CONTAINER_EXTENSION));
        vec![BatchJob::new(input.to_path_buf(), output)]
    };
    encode_jobs(batch_jobs, options, jobs, reporting)
}

fn encode_jobs(
    batch_jobs: Vec<BatchJob>,
    options: &EncodeOptions,
    jobs: usize,
    reporting: &Reporting,
) -> Result<()> {
    let table = ProgressTable::new();
    let progress = LogProgress::new(&table);
    let summary = run_batch(batch_jobs, jobs, &table, |job| {
        let report = encode_file(
            &job.id,
            &job.input,
            &job.output,
            options,
            Some(&progress as &dyn ProgressSink),
        )
        .with_context(|| format!("Failed to encode {}", job.input.display()))?;
        info!(
            input = %job.input.display(),
            output = %report.output.display(),
            frames = report.frames,
            width = report.width,
            height = report.height,
            fps = report.fps,
            audio = report.audio.label(),
            "Encoded"
        );
        Ok(report)
    });

    let snapshots: BTreeMap<_, _> = summary
        .succeeded
        .iter()
        .map(|(job, report)| (job.id.clone(), report.metrics.clone()))
        .collect();
    reporting.emit(&snapshots)?;
    finish_batch("encode", summary.succeeded.len(), &summary.failed)
}

fn decode_command(
    input: &Path,
    output: Option<&Path>,
    options: &DecodeOptions,
    jobs: usize,
    reporting: &Reporting,
) -> Result<()> {
    let batch_jobs = if input.is_dir() {
        let jobs = batch::collect_jobs(input, output, &[CONTAINER_EXTENSION], DECODED_EXTENSION)?;
        if jobs.is_empty() {
            warn!(dir = %input.display(), "No .mpgif files found");
            return Ok(());
        }
        jobs
    } else {
        let output = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| input.with_extension(DECODED_EXTENSION));
        vec![BatchJob::new(input.to_path_buf(), output)]
    };

    let table = ProgressTable::new();
    let summary = run_batch(batch_jobs, jobs, &table, |job| {
        let report = decode_file(&job.id, &job.input, &job.output, options)
            .with_context(|| format!("Failed to decode {}", job.input.display()))?;
        info!(
            input = %job.input.display(),
            output = %report.output.display(),
            frames = report.frames,
            audio = %report.audio_codec,
            "Decoded"
        );
        Ok(report)
    });

    let snapshots: BTreeMap<_, _> = summary
        .succeeded
        .iter()
        .map(|(job, report)| (job.id.clone(), report.metrics.clone()))
        .collect();
    reporting.emit(&snapshots)?;
    finish_batch("decode", summary.succeeded.len(), &summary.failed)
}

fn finish_batch(verb: &str, succeeded: usize, failed: &[(BatchJob, String)]) -> Result<()> {
    if failed.is_empty() {
        return Ok(());
    }
    for (job, message) in failed {
        error!(input = %job.input.display(), "{message}");
    }
    if succeeded == 0 && failed.len() == 1 {
        bail!("{}", failed[0].1);
    }
    bail!(
        "Failed to {verb} {} of {} file(s)",
        failed.len(),
        succeeded + failed.len()
    )
}

fn info_command(input: &Path, json: bool) -> Result<()> {
    let container = ContainerReader::new(input)
        .read()
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let info = container.info();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_info(input, &info);
    }
    Ok(())
}

fn print_info(path: &Path, info: &ContainerInfo) {
    println!("File: {}", path.display());
    println!("Version: {}", info.version);
    println!("Dimensions: {}x{}", info.width, info.height);
    println!("FPS: {}", info.fps);
    if info.frames == info.declared_frames as usize {
        println!("Frames: {}", info.frames);
    } else {
        println!(
            "Frames: {} (header declares {})",
            info.frames, info.declared_frames
        );
    }
    if info.fps > 0 {
        println!("Duration: {:.2}s", info.frames as f64 / f64::from(info.fps));
    }
    println!("Loop: {}", info.loop_description);
    if info.audio_size > 0 {
        println!("Audio: {} ({} bytes)", info.audio_codec, info.audio_size);
    } else {
        println!("Audio: none");
    }
    if !info.metadata.is_empty() {
        println!("Metadata:");
        for (key, value) in info.metadata.iter() {
            println!("  {key}: {value}");
        }
    }
}

fn run_recipe(recipe_path: &Path, dry_run: bool, jobs: usize, reporting: &Reporting) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe);
    log_report(recipe_path, &report);
    if !report.is_ok() {
        bail!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let inputs = recipe.expand_inputs()?;
    if dry_run {
        for input in &inputs {
            info!(
                input = %input.display(),
                output = %recipe.output.resolve(input).display(),
                "Planned"
            );
        }
        info!(inputs = inputs.len(), "Dry run complete");
        return Ok(());
    }

    let batch_jobs = inputs
        .into_iter()
        .map(|input| {
            let output = recipe.output.resolve(&input);
            BatchJob::new(input, output)
        })
        .collect();
    encode_jobs(batch_jobs, &recipe.encode, jobs, reporting)
}

fn log_report(recipe_path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %recipe_path.display(), "{error_msg}");
    }
}

fn validate_recipe_cmd(recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe);
    log_report(recipe_path, &report);

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_recipe(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
    }
}

fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    let mut failures = 0usize;
    for recipe_path in recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe);
                log_report(recipe_path, &report);
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }
    info!("All recipe lint checks passed");
    Ok(())
}

fn list_presets() {
    println!("Available presets:");
    for preset in known_presets() {
        println!(
            "- {:<9} {:>2} fps, {:>4} px, quality {:>2}, {}, {}",
            preset.name,
            preset.fps,
            preset.width,
            preset.quality,
            if preset.audio { "audio" } else { "silent" },
            preset.description
        );
    }
}

#[derive(Parser)]
#[command(
    name = "mpgif",
    version,
    about = "Convert short videos to and from the MPGIF container"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a video, or every video in a directory, to .mpgif
    Encode {
        #[arg(value_hint = ValueHint::AnyPath)]
        input: PathBuf,
        /// Output file, or output directory when INPUT is a directory
        output: Option<PathBuf>,
        #[command(flatten)]
        settings: EncodeArgs,
        /// Files converted in parallel in directory mode
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
    },
    /// Decode an .mpgif file, or every .mpgif in a directory, to MP4
    Decode {
        #[arg(value_hint = ValueHint::AnyPath)]
        input: PathBuf,
        output: Option<PathBuf>,
        /// Image format for the intermediate frame files
        #[arg(long, default_value = "webp")]
        frame_extension: String,
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
    },
    /// Show the header, audio and metadata of an .mpgif file
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Encode every input matched by a YAML recipe
    Run {
        recipe: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
    },
    Validate {
        recipe: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    /// List the built-in presets
    Presets,
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
}

#[derive(clap::Args)]
struct EncodeArgs {
    /// gif-like, balanced, hq or archival; overrides fps, width, quality, loop and audio
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    quality: Option<u8>,
    /// Total number of plays; 0 loops forever
    #[arg(long = "loop")]
    loop_count: Option<u8>,
    #[arg(long)]
    no_audio: bool,
    #[arg(long, value_enum)]
    audio_format: Option<AudioFormat>,
    /// Start of the clip window in seconds
    #[arg(long)]
    start: Option<f64>,
    /// End of the clip window in seconds
    #[arg(long)]
    end: Option<f64>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    author: Option<String>,
    /// Comma-separated tags
    #[arg(long)]
    tags: Option<String>,
    /// Extra metadata entry, repeatable
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    meta: Vec<String>,
}

impl EncodeArgs {
    fn apply(self, mut options: EncodeOptions) -> Result<EncodeOptions> {
        if self.preset.is_some() {
            options.preset = self.preset;
        }
        if let Some(width) = self.width {
            options.width = width;
        }
        if self.height.is_some() {
            options.height = self.height;
        }
        if let Some(fps) = self.fps {
            options.fps = fps;
        }
        if let Some(quality) = self.quality {
            options.quality = quality;
        }
        if let Some(loop_count) = self.loop_count {
            options.loop_count = loop_count;
        }
        if self.no_audio {
            options.audio = false;
        }
        if let Some(format) = self.audio_format {
            options.audio_format = format;
        }
        if self.start.is_some() {
            options.start = self.start;
        }
        if self.end.is_some() {
            options.end = self.end;
        }

        let mut metadata = Metadata::new();
        if let Some(title) = self.title {
            metadata.insert("title", title);
        }
        if let Some(author) = self.author {
            metadata.insert("author", author);
        }
        if let Some(tags) = self.tags {
            let tags: Vec<&str> = tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect();
            metadata.insert("tags", tags.join(","));
        }
        for entry in self.meta {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("Metadata entry '{entry}' is not KEY=VALUE"))?;
            if key.trim().is_empty() {
                bail!("Metadata entry '{entry}' has an empty key");
            }
            metadata.insert(key.trim(), value);
        }
        options.metadata.extend(metadata);
        Ok(options)
    }
}
