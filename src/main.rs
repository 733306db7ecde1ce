// src/main.rs
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use percept_lfp::analysis::aligner::{align, AlignerInput};
use percept_lfp::analysis::plot::{render_psd_png, render_response_png, PlotStyle};
use percept_lfp::analysis::recording::{ChannelData, Recording, Therapy, TherapySettings};
use percept_lfp::analysis::RecordingAnalyzer;
use percept_lfp::types::AnalysisConfig;

const USAGE: &str = "usage: percept-lfp [CONFIG.json|-] [RECORDING.json|-] [PLOT_DIR]";

/// 60 s at 250 Hz, 20 Hz rhythm suppressed by a 0 / 1 / 2 mA step on each side.
fn synthetic_recording() -> Recording {
    let fs = 250u32;
    let n = 60 * fs as usize;
    let mut rng = StdRng::seed_from_u64(2024);
    let time: Vec<f64> = (0..n).map(|i| i as f64 / fs as f64).collect();
    let level = |t: f64| (t / 20.0).floor().min(2.0);
    let mut channel = |name: &str| {
        let samples: Vec<f64> = time
            .iter()
            .map(|&t| {
                let beta = 2.0 / (1.0 + level(t)) * (2.0 * PI * 20.0 * t).sin();
                beta + rng.gen_range(-0.5..0.5)
            })
            .collect();
        ChannelData {
            name: name.to_string(),
            missing: vec![false; n],
            samples,
        }
    };
    let channels = vec![channel("ZERO_THREE_LEFT"), channel("ZERO_THREE_RIGHT")];
    let settings = TherapySettings {
        frequency_hz: 130.0,
        pulse_width_us: 60.0,
    };
    Recording {
        sampling_rate: fs,
        start_time: 1_700_000_000.0,
        stimulation: Some(Array2::from_shape_fn((n, 2), |(i, _)| level(time[i]))),
        power_band: None,
        channels,
        time,
        therapy: Therapy {
            left: Some(settings.clone()),
            right: Some(settings),
        },
    }
}

fn load_recordings(path: &Path) -> Result<Vec<Recording>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match Recording::from_json(&text) {
        Ok(recording) => Ok(vec![recording]),
        Err(_) => {
            // not an aligned record; try raw captures plus telemetry
            let input: AlignerInput =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            Ok(align(&input)?)
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return Ok(());
    }
    let arg = |i: usize| args.get(i).filter(|a| a.as_str() != "-");

    let config = match arg(0) {
        Some(path) => AnalysisConfig::load(path).with_context(|| format!("loading config {path}"))?,
        None => AnalysisConfig::default(),
    };
    let recordings = match arg(1) {
        Some(path) => load_recordings(Path::new(path))?,
        None => {
            info!("no recording given; using the synthetic step scenario");
            vec![synthetic_recording()]
        }
    };
    let plot_dir = arg(2).map(PathBuf::from);
    if let Some(dir) = &plot_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut output = Vec::new();
    for (idx, recording) in recordings.into_iter().enumerate() {
        let analyzer = RecordingAnalyzer::new(recording, config.clone())?;
        for report in analyzer.analyze_all() {
            if let Some(dir) = &plot_dir {
                let style = PlotStyle::default();
                let stem = format!("{idx}_{}", report.channel);
                match render_psd_png(&report.rendering.stim_psd, &style) {
                    Ok(png) => std::fs::write(dir.join(format!("{stem}_psd.png")), png)?,
                    Err(err) => warn!("{stem}: psd plot skipped: {err}"),
                }
                match analyzer
                    .response_curve(&report.channel)
                    .and_then(|curve| render_response_png(&curve, &style))
                {
                    Ok(png) => std::fs::write(dir.join(format!("{stem}_response.png")), png)?,
                    Err(err) => warn!("{stem}: response plot skipped: {err}"),
                }
            }
            output.push(serde_json::json!({
                "Recording": idx,
                "Channel": report.channel,
                "CenterFrequency": report.frequency.center_frequency,
                "GoodnessOfFit": report.frequency.goodness_of_fit,
                "Prediction": report.prediction,
            }));
        }
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
