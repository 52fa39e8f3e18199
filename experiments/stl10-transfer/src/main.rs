use std::{
    fmt::Write,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn_autodiff::Autodiff;
use headtune_core::{
    color_hex, encode_rgb_png_data_url, ensure_report_file, load_or_init, render_loss_chart,
    render_terminal_chart, save_png, series_color, update_sections, EpochMetrics,
    ExperimentArgs, ExperimentMode, LossCurves, ReportSection, DEFAULT_REPORT_TEMPLATE,
};

mod data;
mod model;
mod pretrained;
mod registry;
mod resnet;
mod training;

use data::Stl10Dataset;
use registry::{ExperimentConfig, RunConfig};
use training::run_configuration;

const TEST_BATCHES_PER_EPOCH: usize = 4;
const CHART_WIDTH: u32 = 800;
const CHART_HEIGHT: u32 = 400;
const TERMINAL_CHART_WIDTH: u32 = 160;
const TERMINAL_CHART_HEIGHT: u32 = 48;

#[cfg(not(feature = "wgpu"))]
type ComputeBackend = burn_ndarray::NdArray<f32>;
#[cfg(feature = "wgpu")]
type ComputeBackend = burn_wgpu::Wgpu;

type TrainingBackend = Autodiff<ComputeBackend>;

struct ExperimentPaths {
    config: PathBuf,
    report: PathBuf,
    chart: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = ExperimentArgs::parse_from_env()?;
    if args.help_requested() {
        print_usage();
        return Ok(());
    }
    let mode = args.mode();

    let paths = initialize_paths()?;
    let config: ExperimentConfig = load_or_init(&paths.config, ExperimentConfig::default)?;
    config.validate()?;
    let runs = config.select_runs(args.runs())?;
    ensure_report_file(&paths.report, DEFAULT_REPORT_TEMPLATE)?;
    let cache_dir = config.cache_dir()?;

    println!(
        "running STL-10 transfer comparison in {} mode ({} configurations)",
        mode.label(),
        runs.len()
    );

    let device = <TrainingBackend as Backend>::Device::default();
    let train_set = Stl10Dataset::train(&cache_dir)?;
    log::info!("classes: {}", train_set.class_names().join(", "));
    let max_batches = mode.select(None, Some(TEST_BATCHES_PER_EPOCH));

    let mut curves = LossCurves::new();
    for run in &runs {
        println!("\nTraining configuration: {}", run.name);
        let history = run_configuration::<TrainingBackend>(
            run,
            &config,
            &train_set,
            max_batches,
            &cache_dir,
            &device,
        )?;
        curves.insert(run.name.clone(), history);
    }

    println!("\nTraining loss by epoch:");
    for (name, history) in curves.iter() {
        if let Some(last) = history.last() {
            println!("  {}: final loss {:.4}", name, last.loss);
        }
    }
    println!(
        "{}",
        render_terminal_chart(&curves, TERMINAL_CHART_WIDTH, TERMINAL_CHART_HEIGHT)?
    );

    let chart = render_loss_chart(&curves, CHART_WIDTH, CHART_HEIGHT)?;
    save_png(&chart, &paths.chart)?;
    let chart_url = encode_rgb_png_data_url(&chart)?;
    write_report(&paths.report, &config, &runs, mode, &curves, &chart_url)?;

    println!("\nloss curves written to {}", paths.chart.display());
    println!("report updated at {}", paths.report.display());

    Ok(())
}

fn print_usage() {
    println!(
        "Usage: cargo run -p headtune-experiment-stl10 -- [--mode full|test] [--run NAME]...\n\n\
         --mode test   cap every epoch at {TEST_BATCHES_PER_EPOCH} batches\n\
         --run NAME    train only the named configuration (repeatable)"
    );
}

fn initialize_paths() -> Result<ExperimentPaths> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("experiments/stl10_transfer");
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create experiment directory {}", dir.display()))?;

    Ok(ExperimentPaths {
        config: dir.join("config.json"),
        report: dir.join("report.md"),
        chart: dir.join("loss_curves.png"),
    })
}

fn write_report(
    report_path: &Path,
    config: &ExperimentConfig,
    runs: &[RunConfig],
    mode: ExperimentMode,
    curves: &LossCurves,
    chart_url: &str,
) -> Result<()> {
    let sections = [
        ReportSection::new("configuration", render_configuration_section(config, runs, mode)),
        ReportSection::new("metrics", render_metrics_section(curves)),
        ReportSection::new("curves", render_curves_section(curves, chart_url)),
    ];

    update_sections(report_path, &sections)
}

fn render_configuration_section(
    config: &ExperimentConfig,
    runs: &[RunConfig],
    mode: ExperimentMode,
) -> String {
    let mut output = String::new();
    let batches = mode.select(
        "all".to_string(),
        format!("first {TEST_BATCHES_PER_EPOCH}"),
    );
    let _ = writeln!(
        &mut output,
        "- Mode: {}\n- Seed: {}\n- Epochs: {}\n- Batch size: {}\n- Batches per epoch: {}\n- Input size: {}x{}\n- Normalization: mean {:?}, std {:?}\n- Optimizer: Adam over head parameters only\n",
        mode.label(),
        config.seed,
        config.epochs,
        config.batch_size,
        batches,
        config.image_size,
        config.image_size,
        config.mean,
        config.std
    );

    let _ = writeln!(&mut output, "| Configuration | Backbone | Learning rate | Head dropout |");
    let _ = writeln!(&mut output, "| --- | --- | --- | --- |");
    for run in runs {
        let dropout = run
            .head_dropout
            .map_or_else(|| "none".to_string(), |prob| format!("{prob}"));
        let _ = writeln!(
            &mut output,
            "| {} | {} | {:e} | {} |",
            run.name, run.backbone, run.learning_rate, dropout
        );
    }

    output
}

fn render_metrics_section(curves: &LossCurves) -> String {
    let mut output = String::new();

    for (name, history) in curves.iter() {
        let _ = writeln!(&mut output, "### {}\n", name);
        if let Some(last) = history.last() {
            let _ = writeln!(
                &mut output,
                "- Final train loss: {:.4}\n- Final train accuracy: {:.2}%\n",
                last.loss,
                last.accuracy * 100.0
            );
        }
        output.push_str(&render_history_table(history));
        output.push('\n');
    }

    output
}

fn render_history_table(history: &[EpochMetrics]) -> String {
    let mut output = String::new();
    let _ = writeln!(&mut output, "| Epoch | Train Loss | Train Accuracy (%) |");
    let _ = writeln!(&mut output, "| --- | --- | --- |");
    for metrics in history {
        let _ = writeln!(
            &mut output,
            "| {} | {:.4} | {:.2} |",
            metrics.epoch,
            metrics.loss,
            metrics.accuracy * 100.0
        );
    }
    output
}

fn render_curves_section(curves: &LossCurves, chart_url: &str) -> String {
    let mut output = String::new();
    let _ = writeln!(&mut output, "![Training loss curves]({})\n", chart_url);
    let _ = writeln!(&mut output, "| Color | Configuration | Losses by epoch |");
    let _ = writeln!(&mut output, "| --- | --- | --- |");

    for (index, (name, history)) in curves.iter().enumerate() {
        let losses: Vec<String> = history
            .iter()
            .map(|metrics| format!("{:.4}", metrics.loss))
            .collect();
        let _ = writeln!(
            &mut output,
            "| {} | {} Loss | {} |",
            color_hex(series_color(index)),
            name,
            losses.join(", ")
        );
    }

    output
}
