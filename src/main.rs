use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use vidlift::capabilities::ffmpeg::check_tools;
use vidlift::capabilities::{CapabilitySet, FfmpegSettings, FrameSettings};
use vidlift::observability::{MetricsSnapshot, log_snapshot};
#[cfg(feature = "metrics-server")]
use vidlift::observability::server::MetricsServer;
use vidlift::pipeline::PipelineSequencer;
use vidlift::presets::{
    self, GIB, Preset, PresetName, VramFit, check_vram_compatibility, estimate_processing_time,
    generate_recipe,
};
use vidlift::queue::{JobEvent, JobEventKind, JobQueue, JobRequest, JobStatus, store};
use vidlift::recipe::{Limits, OutputSpec, Recipe};
use vidlift::runner::{BatchRunner, RunReport};
use vidlift::scheduler::{available_disk_space, detect_device_memory, gb_to_bytes};
use vidlift::validation::validate_recipe;
use vidlift::video::ContainerFormat;

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };
    configure_tracing(otlp_endpoint.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            recipe,
            dry_run,
            state_file,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint: _,
        } => run_recipe(
            &recipe,
            dry_run,
            state_file,
            MetricsOutputs {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
            },
            metrics_listen,
        ),
        Commands::Queue { action } => queue_command(action),
        Commands::Presets { vram_gb } => {
            list_presets(vram_gb);
            Ok(())
        }
        Commands::Validate { recipe } => validate_recipe_cmd(&recipe),
        Commands::Doctor { recipe } => doctor(recipe.as_deref()),
        Commands::Recipe { action } => recipe_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "vidlift", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "vidlift")],
                )))
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

fn run_recipe(
    recipe_path: &Path,
    dry_run: bool,
    state_file: Option<PathBuf>,
    outputs: MetricsOutputs,
    metrics_listen: Option<String>,
) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe);
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        bail!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let preset = presets::resolve(&recipe.preset)?;
    let inputs = recipe.expand_inputs()?;

    if dry_run {
        info!(
            preset = %preset.name,
            inputs = inputs.len(),
            "Dry run: recipe resolved"
        );
        for input in &inputs {
            println!("{} -> {}", input.display(), recipe.output_path(input).display());
        }
        return Ok(());
    }

    check_disk_space(&recipe.output.directory, recipe.limits.min_free_disk_gb)?;

    let capacity = detect_device_memory(recipe.device.vram_gb);
    let queue = Arc::new(JobQueue::new(capacity, recipe.device.max_concurrent_jobs));
    if let Some(path) = &state_file {
        let restored = queue.load(path)?;
        if restored > 0 {
            info!(restored, state = %path.display(), "Resumed pending jobs");
        }
    }
    for input in inputs {
        let output = recipe.output_path(&input);
        let request =
            JobRequest::new(input, output, preset.name).with_interpolation(recipe.interpolate);
        if let Err(err) = queue.enqueue(request) {
            warn!(error = %err, "Skipping input");
        }
    }
    queue.subscribe(render_progress);

    let capabilities = CapabilitySet::builtin(&recipe.ffmpeg, &recipe.frames);
    let sequencer = PipelineSequencer::new(&capabilities, &recipe.limits);
    let metrics = sequencer.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        let server = MetricsServer::start(addr, metrics.clone(), queue.clone())?;
        println!("Metrics available at http://{}/metrics", server.address());
        Some(server)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = metrics_listen {
        warn!("Metrics server feature not enabled; ignoring --metrics-listen={addr_str}.");
    }

    let mut runner = BatchRunner::new(queue.clone(), sequencer);
    if let Some(path) = &state_file {
        runner = runner.with_state_file(path);
    }
    let run = runner.run();
    print_report(&run);

    write_metrics(&metrics.snapshot(), &outputs)?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    if run.failed() > 0 {
        bail!("{} of {} job(s) failed", run.failed(), run.jobs.len());
    }
    Ok(())
}

fn render_progress(event: &JobEvent) {
    let job = &event.job;
    let label = job
        .input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match event.kind {
        JobEventKind::Progress | JobEventKind::StatusChanged => {
            let bar_width = 30usize;
            let fraction = job.progress.clamp(0.0, 1.0);
            let filled = ((fraction * bar_width as f64).round() as usize).min(bar_width);
            print!(
                "\r#{:<3} [{}{}] {:>3}% {:<13} {}",
                job.id,
                "=".repeat(filled),
                " ".repeat(bar_width - filled),
                (fraction * 100.0).round() as u32,
                job.status.as_str(),
                label
            );
            let _ = io::stdout().flush();
        }
        JobEventKind::Finished => {
            let colour = match job.status {
                JobStatus::Done => "\x1b[32m",
                JobStatus::Failed => "\x1b[31m",
                _ => "\x1b[33m",
            };
            println!("\r#{:<3} {colour}{}\x1b[0m {label}", job.id, job.status);
            if let Some(failure) = &job.error {
                println!("     {failure}");
            }
        }
        JobEventKind::Removed => println!("#{:<3} removed {label}", job.id),
        _ => {}
    }
}

fn print_report(run: &RunReport) {
    println!(
        "Processed {} job(s): {} done, {} failed, {} cancelled in {:.1}s",
        run.jobs.len(),
        run.completed(),
        run.failed(),
        run.cancelled(),
        run.duration_ms / 1_000.0
    );
}

fn write_metrics(snapshot: &MetricsSnapshot, outputs: &MetricsOutputs) -> Result<()> {
    if outputs.print {
        log_snapshot(snapshot);
    }
    if let Some(path) = &outputs.json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &outputs.prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

/// Refuses to start when the filesystem under `directory` has less than
/// `min_gb` free. Proceeds with a warning when free space is unknown.
fn check_disk_space(directory: &Path, min_gb: f64) -> Result<()> {
    if min_gb <= 0.0 {
        return Ok(());
    }
    match available_disk_space(directory) {
        Some(free) if free < gb_to_bytes(min_gb) => bail!(
            "Only {:.1} GB free under {}, below limits.min_free_disk_gb ({min_gb})",
            free as f64 / GIB as f64,
            directory.display()
        ),
        Some(free) => {
            info!(directory = %directory.display(), free_gb = free as f64 / GIB as f64, "Disk space checked");
            Ok(())
        }
        None => {
            warn!(directory = %directory.display(), "Could not determine free disk space");
            Ok(())
        }
    }
}

fn doctor(recipe_path: Option<&Path>) -> Result<()> {
    let recipe = recipe_path.map(Recipe::load).transpose()?;
    let ffmpeg = recipe
        .as_ref()
        .map(|r| r.ffmpeg.clone())
        .unwrap_or_default();
    let output_dir = recipe
        .as_ref()
        .map(|r| r.output.directory.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let vram_gb = recipe.as_ref().and_then(|r| r.device.vram_gb);

    let mut healthy = true;
    for tool in check_tools(&ffmpeg) {
        match (&tool.path, &tool.version) {
            (Some(path), Some(version)) => {
                println!("ok      {:<8} {} ({version})", tool.name, path.display())
            }
            (Some(path), None) => {
                healthy = false;
                println!("broken  {:<8} {} does not report a version", tool.name, path.display());
            }
            (None, _) => {
                healthy = false;
                println!("missing {:<8} not found on PATH", tool.name);
            }
        }
    }

    let memory = detect_device_memory(vram_gb);
    println!("device  {:.1} GB VRAM budget", memory as f64 / GIB as f64);
    for preset in Preset::all() {
        if check_vram_compatibility(memory, &preset) == VramFit::Insufficient {
            println!("        {} does not fit", preset.name);
        }
    }

    match available_disk_space(&output_dir) {
        Some(free) => println!(
            "disk    {:.1} GB free under {}",
            free as f64 / GIB as f64,
            output_dir.display()
        ),
        None => println!("disk    unknown under {}", output_dir.display()),
    }

    if !healthy {
        bail!("ffmpeg tooling is incomplete; video inputs and outputs will fail");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn queue_command(command: QueueCommands) -> Result<()> {
    match command {
        QueueCommands::Add {
            inputs,
            preset,
            output_dir,
            container,
            no_interpolate,
            state_file,
        } => {
            let output = OutputSpec {
                directory: output_dir,
                structure: "{stem}_{preset}.{ext}".into(),
                container,
            };
            let added = store::edit(&state_file, |file| {
                let mut added = Vec::with_capacity(inputs.len());
                for input in &inputs {
                    let target = output.render(input, preset.as_str());
                    let request = JobRequest::new(input.clone(), target, preset)
                        .with_interpolation(!no_interpolate);
                    added.push((file.add(request)?, input.clone()));
                }
                Ok(added)
            })?;
            for (id, input) in added {
                println!("#{id} queued {}", input.display());
            }
            Ok(())
        }
        QueueCommands::List { state_file, json } => {
            let records = store::load(&state_file)?;
            if json {
                serde_json::to_writer_pretty(io::stdout(), &records)?;
                println!();
            } else if records.is_empty() {
                println!("Queue is empty");
            } else {
                for record in records {
                    println!(
                        "#{:<3} {:<16} {:<13} {} -> {}",
                        record.id,
                        record.preset.as_str(),
                        record.status.as_str(),
                        record.input.display(),
                        record.output.display()
                    );
                    if let Some(failure) = &record.error {
                        println!("     {failure}");
                    }
                }
            }
            Ok(())
        }
        QueueCommands::Cancel { id, state_file } => {
            let finished = store::edit(&state_file, |file| {
                let status = file.get(id).map(|r| r.status);
                Ok(match file.cancel(id)? {
                    Some(_) => None,
                    None => status,
                })
            })?;
            match finished {
                Some(status) => println!("#{id} already {status}"),
                None => println!("#{id} cancelled"),
            }
            Ok(())
        }
        QueueCommands::Clear { state_file } => {
            let cleared = store::edit(&state_file, |file| Ok(file.clear_finished()))?;
            println!("Cleared {cleared} finished job(s)");
            Ok(())
        }
        QueueCommands::Process {
            state_file,
            vram_gb,
            max_concurrent,
            min_free_disk_gb,
        } => {
            let queue = Arc::new(JobQueue::new(detect_device_memory(vram_gb), max_concurrent));
            let restored = queue.load(&state_file)?;
            if restored == 0 {
                println!("Queue is empty");
                return Ok(());
            }
            let mut directories: Vec<PathBuf> = queue
                .jobs()
                .iter()
                .filter(|j| j.status == JobStatus::Queued)
                .filter_map(|j| j.output.parent().map(Path::to_path_buf))
                .collect();
            directories.sort();
            directories.dedup();
            for directory in &directories {
                check_disk_space(directory, min_free_disk_gb)?;
            }

            queue.subscribe(render_progress);
            let capabilities =
                CapabilitySet::builtin(&FfmpegSettings::default(), &FrameSettings::default());
            let sequencer = PipelineSequencer::new(&capabilities, &Limits::default());
            let run = BatchRunner::new(queue, sequencer)
                .with_state_file(&state_file)
                .run();
            print_report(&run);
            if run.failed() > 0 {
                bail!("{} of {} job(s) failed", run.failed(), run.jobs.len());
            }
            Ok(())
        }
    }
}

fn list_presets(vram_gb: Option<f64>) {
    let available = vram_gb.map(|gb| detect_device_memory(Some(gb)));
    println!("Available presets:");
    for preset in Preset::all() {
        print_preset(&preset, available);
    }
}

fn print_preset(preset: &Preset, available: Option<u64>) {
    let rate = preset
        .target_frame_rate
        .map(|r| format!("{:.0}fps", r.as_f64()))
        .unwrap_or_else(|| "source fps".into());
    // One minute of footage on a GPU.
    let minutes = estimate_processing_time(60.0, preset, true) / 60.0;
    println!(
        "- {:<16} {:>2}x up to {:<10} {:<10} {:.0} GB VRAM  ~{minutes:.1} min per footage minute",
        preset.name.as_str(),
        preset.scale_factor,
        preset.target_resolution.to_string(),
        rate,
        preset.vram_budget_gb()
    );
    println!("  {}", preset.description);
    if let Some(bytes) = available {
        let fit = match check_vram_compatibility(bytes, preset) {
            VramFit::Sufficient => "sufficient",
            VramFit::Tight => "tight, may fall back to smaller batches",
            VramFit::Insufficient => "insufficient",
        };
        println!("  {:.1} GB available: {fit}", bytes as f64 / GIB as f64);
    }
}

fn validate_recipe_cmd(recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
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
            let generated = generate_recipe(preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "vidlift",
    version,
    about = "Batch video upscaling and frame interpolation under a VRAM budget"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every input matched by a recipe.
    Run {
        recipe: PathBuf,
        #[arg(long)]
        dry_run: bool,
        /// Resume from and persist pending jobs to this file.
        #[arg(long = "state-file")]
        state_file: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Manage a persisted job queue.
    Queue {
        #[command(subcommand)]
        action: QueueCommands,
    },
    /// Show the quality presets.
    Presets {
        /// Check each preset against this much VRAM.
        #[arg(long = "vram-gb")]
        vram_gb: Option<f64>,
    },
    Validate {
        recipe: PathBuf,
    },
    /// Check that ffmpeg, device memory and disk space are ready for a run.
    Doctor {
        /// Check against this recipe's tools and output directory.
        recipe: Option<PathBuf>,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    Add {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = PresetName::Standard)]
        preset: PresetName,
        #[arg(long = "output-dir", default_value = "out")]
        output_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = ContainerFormat::Mp4)]
        container: ContainerFormat,
        /// Keep the source frame rate.
        #[arg(long = "no-interpolate")]
        no_interpolate: bool,
        #[arg(long = "state-file", default_value = "vidlift-queue.yaml")]
        state_file: PathBuf,
    },
    List {
        #[arg(long = "state-file", default_value = "vidlift-queue.yaml")]
        state_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a job. A running `queue process` stops it at the next batch.
    Cancel {
        id: u64,
        #[arg(long = "state-file", default_value = "vidlift-queue.yaml")]
        state_file: PathBuf,
    },
    /// Forget finished, failed and cancelled jobs.
    Clear {
        #[arg(long = "state-file", default_value = "vidlift-queue.yaml")]
        state_file: PathBuf,
    },
    Process {
        #[arg(long = "state-file", default_value = "vidlift-queue.yaml")]
        state_file: PathBuf,
        #[arg(long = "vram-gb")]
        vram_gb: Option<f64>,
        #[arg(long = "max-concurrent", default_value_t = 1)]
        max_concurrent: usize,
        /// Refuse to start with less free space than this under any
        /// output directory.
        #[arg(long = "min-free-disk-gb", default_value_t = 5.0)]
        min_free_disk_gb: f64,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long, value_enum)]
        preset: PresetName,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
