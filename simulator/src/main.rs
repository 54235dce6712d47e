use anyhow::Context;
use clap::Parser;
use generator::profile::generate;
use std::fs;
use std::path::PathBuf;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Synthetic pulsar reduction driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Dispersion measure of the synthetic pulsar, in pc/cm^3
    #[arg(long, default_value_t = 2.0)]
    dm: f64,
    #[arg(long, default_value_t = 32)]
    channelize: usize,
    #[arg(long, default_value_t = 4)]
    integrate: usize,
    #[arg(long, default_value_t = 64)]
    phase_bins: usize,
    /// Fold the dispersed signal as observed
    #[arg(long, default_value_t = false)]
    no_dedisperse: bool,
    /// Write the full result as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.dm, args.channelize, args.integrate, args.phase_bins)
    };
    if args.no_dedisperse {
        workflow_config.dedisperse = false;
    }

    let stream = generate(&workflow_config.signal).context("generating synthetic voltages")?;
    let runner = Runner::new(workflow_config);
    let result = runner.execute(stream)?;

    for stage in &result.stages {
        println!(
            "{:<11} rate {:>12.3} Hz  start {:.6} s  length {:>8}  shape {:?}",
            stage.name,
            stage.sample_rate,
            stage.start_time,
            stage.length.map_or_else(|| "-".to_string(), |n| n.to_string()),
            stage.sample_shape
        );
    }
    println!(
        "Folded {} bins -> peak bin {}, S/N {:.1} (dedispersed: {})",
        result.profile.len(),
        result.peak_bin,
        result.snr,
        runner.config().dedisperse
    );

    if let Some(report_path) = args.report {
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let report = serde_json::to_string_pretty(&result).context("serializing report")?;
        fs::write(&report_path, report)
            .with_context(|| format!("writing report {}", report_path.display()))?;
    }

    Ok(())
}
