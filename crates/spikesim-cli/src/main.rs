//! # spikesim CLI
//!
//! Command-line interface for the spiking network engine.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use spikesim_brian::{
    tonotopy_network, NetworkSpec, Recording, RunStatus, SignalKind, SignalSpec, SimError, Simulation, TonotopyParams,
};
use spikesim_core::{AdaptationWindows, PyloricPanels, PyloricTraces, SignalSource};
use spikesim_sound::{SignalSourceExt, ToneSource, WavSource};
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spikesim")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Discrete-time spiking network simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the audio-to-tonotopy network
    Tonotopy {
        /// 16-bit PCM WAV input (first channel); the synthetic C-major scale without it
        #[arg(long)]
        wav: Option<PathBuf>,
        /// Multiply the input before rectification
        #[arg(long, default_value_t = 1.0)]
        gain: f64,
        /// TonotopyParams JSON
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Simulated time (s)
        #[arg(short, long)]
        runtime: Option<f64>,
        /// Number of coincidence detectors
        #[arg(short, long)]
        neurons: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Write the recording as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Slice pre-computed pyloric traces into initial and adapted windows
    Pyloric {
        /// Traces JSON (times, membrane_potential, optional spike_trains)
        traces: PathBuf,
        #[arg(long)]
        init: f64,
        #[arg(long)]
        observe: f64,
        #[arg(long)]
        adapt: f64,
        /// Write both panels as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a network described in a JSON model file
    Run {
        model: PathBuf,
        /// Simulated time (s), overrides the model's duration
        #[arg(short, long)]
        duration: Option<f64>,
        /// Write the recording as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List built-in demos and signal kinds
    List,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tonotopy { wav, gain, config, runtime, neurons, seed, output } => {
            let mut params = match &config {
                Some(path) => {
                    let text = std::fs::read_to_string(path)
                        .with_context(|| format!("reading parameters {}", path.display()))?;
                    TonotopyParams::from_json(&text)?
                }
                None => TonotopyParams::default(),
            };
            if let Some(runtime) = runtime {
                params.runtime = runtime;
            }
            if let Some(neurons) = neurons {
                params.neurons = neurons;
            }
            if let Some(seed) = seed {
                params.seed = seed;
            }
            run_tonotopy(params, wav.as_deref(), gain, output.as_deref())?;
        }

        Commands::Pyloric { traces, init, observe, adapt, output } => {
            println!("{} {}", "Loading pyloric traces:".green().bold(), traces.display());
            let text = std::fs::read_to_string(&traces)
                .with_context(|| format!("reading traces {}", traces.display()))?;
            let traces: PyloricTraces = serde_json::from_str(&text)?;
            let windows = AdaptationWindows { init_time: init, observe_time: observe, adapt_time: adapt };
            let panels = traces.split(&windows)?;
            print_panels(&panels);
            if let Some(path) = output {
                write_json(&path, &panels)?;
            }
        }

        Commands::Run { model, duration, output } => {
            println!("{} {}", "Loading model:".green().bold(), model.display());
            let spec = NetworkSpec::load(&model)?;
            let duration = duration
                .or(spec.duration)
                .context("no duration given and the model does not define one")?;
            let base = model.parent().map(Path::to_path_buf).unwrap_or_default();
            let (net, monitors) = spec.into_network(|s| external_signal(s, &base))?;

            let mut sim = net.build()?;
            let outcome = run_with_bar(&mut sim, duration);
            let recording = sim.finish();
            println!();
            for (idx, id) in monitors.iter().enumerate() {
                if let Some(spikes) = recording.spikes(*id) {
                    println!(
                        "  monitor {} {} spikes of {}: {} ({:.2} Hz per neuron)",
                        idx,
                        "·".dimmed(),
                        spikes.group.cyan(),
                        spikes.total(),
                        spikes.mean_rate(recording.duration())
                    );
                } else if let Some(trace) = recording.state(*id) {
                    println!(
                        "  monitor {} {} {}.{} for {} neurons",
                        idx,
                        "·".dimmed(),
                        trace.group.cyan(),
                        trace.variable,
                        trace.indices.len()
                    );
                }
            }
            finish_run(outcome, &recording, output.as_deref())?;
        }

        Commands::List => {
            println!("{}", "Demos:".green().bold());
            println!();
            println!("  {} - receptor + coincidence detectors driven by audio", "tonotopy".cyan());
            println!("  {} - initial/adapted windows of pyloric traces", "pyloric".cyan());
            println!("  {} - any network from a JSON model file", "run".cyan());
            println!();
            println!("{}", "Signal kinds in model files:".green().bold());
            println!();
            println!("  {} - amplitude * sin(2 pi frequency t)", "sine".cyan());
            println!("  {} - fixed value", "constant".cyan());
            println!("  {} - C-major scale, 4.5 s", "scale".cyan());
            println!("  {} - 16-bit PCM file, optional gain and clip", "wav".cyan());
        }
    }

    Ok(())
}

/// Detector summary written next to the recording
#[derive(Serialize)]
struct TonotopyOutput<'a> {
    params: &'a TonotopyParams,
    preferred_frequencies: Vec<f64>,
    recording: &'a Recording,
}

fn run_tonotopy(mut params: TonotopyParams, wav: Option<&Path>, gain: f64, output: Option<&Path>) -> anyhow::Result<()> {
    let source: Box<dyn SignalSource> = match wav {
        Some(path) => {
            println!("{} {}", "Loading WAV file:".green().bold(), path.display());
            let source = WavSource::open(path)?;
            let rate = source.spec().sample_rate as f64;
            if rate != params.sample_rate {
                warn!(file = rate, configured = params.sample_rate, "using the file's sample rate");
                params.sample_rate = rate;
            }
            if source.duration() < params.runtime {
                warn!(file = source.duration(), runtime = params.runtime, "input is shorter than the runtime");
            }
            Box::new(source.gain(gain))
        }
        None => {
            println!("{}", "Using the synthetic C-major scale".green().bold());
            Box::new(ToneSource::c_major_scale().gain(gain))
        }
    };

    println!(
        "  {} detectors, {:.0}-{:.0} Hz, dt = {:.2} us, {} s",
        params.neurons,
        params.min_freq,
        params.max_freq,
        params.dt() * 1e6,
        params.runtime
    );
    let tono = tonotopy_network(&params, source)?;
    let spikes = tono.spikes;
    let mut sim = tono.network.build()?;
    let outcome = run_with_bar(&mut sim, params.runtime);
    let recording = sim.finish();

    let freqs = params.preferred_frequencies();
    if let Some(record) = recording.spikes(spikes) {
        println!();
        println!(
            "  {} detector spikes ({:.2} Hz per neuron)",
            record.total().to_string().bold(),
            record.mean_rate(recording.duration())
        );
        let mut ranked: Vec<(usize, usize)> = record.counts.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (neuron, count) in ranked.into_iter().take(5).filter(|(_, c)| *c > 0) {
            println!("    #{:<4} {:>8.1} Hz  {} spikes", neuron, freqs[neuron], count);
        }
    }

    if let Some(path) = output {
        let out = TonotopyOutput { params: &params, preferred_frequencies: freqs, recording: &recording };
        write_json(path, &out)?;
    }
    finish_run(outcome, &recording, None)
}

/// Build sources for `scale` and `wav` signals; paths are relative to the model file
fn external_signal(spec: &SignalSpec, base: &Path) -> spikesim_brian::Result<Box<dyn SignalSource>> {
    let source: Box<dyn SignalSource> = match &spec.kind {
        SignalKind::Scale {} => Box::new(ToneSource::c_major_scale()),
        SignalKind::Wav { path, gain, clip } => {
            let path = if path.is_absolute() { path.clone() } else { base.join(path) };
            let source = WavSource::open(&path)
                .map_err(|e| SimError::ConfigError(format!("signal '{}': {}", spec.name, e)))?
                .gain(*gain);
            match clip {
                Some(hi) => Box::new(source.clip(0.0, *hi)),
                None => Box::new(source),
            }
        }
        other => return Err(SimError::ConfigError(format!("signal '{}': {:?} is built in", spec.name, other))),
    };
    Ok(source)
}

fn run_with_bar(sim: &mut Simulation, duration: f64) -> spikesim_brian::Result<RunStatus> {
    let total = (duration / sim.dt()).round().max(0.0) as u64;
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(style);
    let result = sim.run_with_progress(duration, |p| bar.set_position(p.done));
    bar.finish_and_clear();
    result
}

/// Write the output and report how the run ended. Exhausted input ends a demo
/// normally; any other halt is an error once the partial recording is saved.
fn finish_run(
    outcome: spikesim_brian::Result<RunStatus>,
    recording: &Recording,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(path) = output {
        write_json(path, recording)?;
    }
    match outcome {
        Ok(RunStatus::Finished { steps }) => {
            println!("{} {} steps, {:.3} s", "Finished:".green().bold(), steps, recording.duration());
            Ok(())
        }
        Ok(RunStatus::Stopped { steps }) => {
            println!("{} after {} steps", "Stopped:".yellow().bold(), steps);
            Ok(())
        }
        Err(err @ SimError::SignalExhausted { .. }) => {
            println!("{} {} ({:.3} s recorded)", "Input ended:".yellow().bold(), err, recording.duration());
            Ok(())
        }
        Err(err) => {
            println!("{} {}", "Halted:".red().bold(), err);
            Err(err.into())
        }
    }
}

fn print_panels(panels: &PyloricPanels) {
    for panel in [&panels.initial, &panels.adapted] {
        println!("{} window from {:.3} s", panel.title.cyan().bold(), panel.start);
        for neuron in &panel.neurons {
            let spikes = neuron.spikes.as_ref().map(|s| s.len().to_string()).unwrap_or_else(|| "-".into());
            println!(
                "  {:<6} {} samples, {} spikes ({})",
                neuron.label,
                neuron.trace.len(),
                spikes,
                neuron.color.dimmed()
            );
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikesim_sound::write_pcm16;

    #[test]
    fn test_external_wav_relative_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::File::create(dir.path().join("in.wav")).unwrap();
        write_pcm16(file, 1000, 1, &[16384, -16384]).unwrap();

        let spec = SignalSpec {
            name: "song".into(),
            kind: SignalKind::Wav { path: "in.wav".into(), gain: 4.0, clip: Some(1.0) },
        };
        let mut source = external_signal(&spec, dir.path()).unwrap();
        assert_eq!(source.sample(0.0).unwrap(), 1.0);
        assert_eq!(source.sample(0.001).unwrap(), 0.0);
        assert!(source.sample(0.002).is_err());

        let missing = SignalSpec { name: "x".into(), kind: SignalKind::Wav { path: "nope.wav".into(), gain: 1.0, clip: None } };
        assert!(external_signal(&missing, dir.path()).is_err());
    }

    #[test]
    fn test_builtin_kinds_are_not_external() {
        let spec = SignalSpec { name: "c".into(), kind: SignalKind::Constant { value: 1.0 } };
        assert!(external_signal(&spec, Path::new(".")).is_err());
        let spec = SignalSpec { name: "s".into(), kind: SignalKind::Scale {} };
        assert!(external_signal(&spec, Path::new(".")).is_ok());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["spikesim", "tonotopy", "--runtime", "0.5", "-n", "50"]).unwrap();
        assert!(matches!(cli.command, Commands::Tonotopy { wav: None, neurons: Some(50), .. }));
        let cli = Cli::try_parse_from(["spikesim", "tonotopy", "--wav", "a.wav"]).unwrap();
        assert!(matches!(cli.command, Commands::Tonotopy { wav: Some(_), .. }));
        // the scale is the default input, not a flag
        assert!(Cli::try_parse_from(["spikesim", "tonotopy", "--scale"]).is_err());
        let cli = Cli::try_parse_from(["spikesim", "pyloric", "t.json", "--init", "1", "--observe", "2", "--adapt", "3"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Pyloric { init, .. } if init == 1.0));
    }
}
