//! Synthetic Meter Fleet Simulation
//!
//! Generates realistic smart-meter telemetry for testing GRIDPULSE.
//! Simulates a regional meter fleet including:
//! - Diurnal household/industrial load curves with Gaussian noise
//! - Rooftop solar feed-in on a fraction of meters (midday bell curve)
//! - Consumption spikes (EV charging, industrial start-up)
//! - Meter outages (dark meters with an established baseline)
//! - Regional overload windows
//!
//! Emits one JSON reading per line, ready for the ingestion gateway:
//!
//! ```bash
//! ./simulate --meters 50 --minutes 10 | while read r; do
//!   curl -s -XPOST localhost:8080/telemetry -H 'content-type: application/json' -d "$r" >/dev/null
//! done
//! ```

use std::io::{self, Write};

use chrono::{DateTime, Duration, Timelike, Utc};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use gridpulse::types::{Reading, ReadingStatus};

// ============================================================================
// Fleet Constants
// ============================================================================

/// Baseline household draw (kW).
const BASE_HOUSEHOLD_KW: f64 = 1.8;
/// Baseline small-industrial draw (kW).
const BASE_INDUSTRIAL_KW: f64 = 24.0;
/// Fraction of meters that are industrial.
const INDUSTRIAL_FRACTION: f64 = 0.1;
/// Fraction of meters with rooftop solar feed-in.
const SOLAR_FRACTION: f64 = 0.2;
/// Line voltage nominal (V).
const NOMINAL_VOLTAGE: f64 = 230.0;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "simulate")]
#[command(about = "Synthetic meter fleet telemetry for GRIDPULSE testing")]
#[command(version)]
struct Args {
    /// Number of meters in the fleet
    #[arg(short, long, default_value = "50", value_parser = clap::value_parser!(u32).range(1..=100_000))]
    meters: u32,

    /// Simulated duration in minutes
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=1440))]
    minutes: u32,

    /// Seconds between samples per meter
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=300))]
    interval: u32,

    /// Regions to spread the fleet across (comma-separated)
    #[arg(long, value_delimiter = ',', default_values_t = vec![
        "Pune-West".to_string(),
        "Pune-East".to_string(),
        "Mumbai-North".to_string(),
    ])]
    regions: Vec<String>,

    /// Fraction of meters that spike mid-run (0.0-1.0)
    #[arg(long, default_value = "0.05")]
    spike_fraction: f64,

    /// Fraction of meters that go dark mid-run (0.0-1.0)
    #[arg(long, default_value = "0.02")]
    outage_fraction: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

// ============================================================================
// Meter Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fault {
    None,
    /// Sudden sustained spike starting at `at` fraction of the run.
    Spike { at: f64, factor: f64 },
    /// Meter goes dark at `at` fraction of the run.
    Outage { at: f64 },
}

struct Meter {
    id: String,
    region: String,
    base_kw: f64,
    /// Installed rooftop capacity (kW); `None` for meters without solar.
    solar_peak_kw: Option<f64>,
    fault: Fault,
    seq: u64,
}

impl Meter {
    /// Diurnal multiplier: trough near 04:00, evening peak near 19:00.
    fn diurnal(at: DateTime<Utc>) -> f64 {
        let hour = at.hour() as f64 + at.minute() as f64 / 60.0;
        let radians = (hour - 7.0) / 24.0 * std::f64::consts::TAU;
        1.0 + 0.45 * radians.sin()
    }

    /// Solar output fraction: bell around 12:30, zero outside 06:00-19:00.
    fn solar_curve(at: DateTime<Utc>) -> f64 {
        let hour = at.hour() as f64 + at.minute() as f64 / 60.0;
        if !(6.0..=19.0).contains(&hour) {
            return 0.0;
        }
        let offset = (hour - 12.5) / 3.5;
        (-offset * offset).exp()
    }

    fn sample(&mut self, at: DateTime<Utc>, progress: f64, rng: &mut StdRng) -> Reading {
        let noise = Normal::new(0.0, self.base_kw * 0.06)
            .map(|n| n.sample(rng))
            .unwrap_or(0.0);
        let mut power = (self.base_kw * Self::diurnal(at) + noise).max(0.0);

        match self.fault {
            Fault::Spike { at: start, factor } if progress >= start => {
                power *= factor;
            }
            Fault::Outage { at: start } if progress >= start => {
                power = 0.0;
            }
            _ => {}
        }

        let generation_kw = self.solar_peak_kw.map(|peak| {
            let output = peak * Self::solar_curve(at) * rng.gen_range(0.85..1.0);
            (output * 1000.0).round() / 1000.0
        });

        self.seq += 1;
        let interval_hours = 1.0 / 360.0; // 10 s nominal sampling
        Reading {
            reading_id: None,
            meter_id: self.id.clone(),
            region: self.region.clone(),
            timestamp: at,
            power_kw: (power * 1000.0).round() / 1000.0,
            voltage: Some(NOMINAL_VOLTAGE + rng.gen_range(-4.0..4.0)),
            current: Some(power * 1000.0 / NOMINAL_VOLTAGE),
            frequency: Some(50.0 + rng.gen_range(-0.05..0.05)),
            power_factor: Some(0.92 + rng.gen_range(0.0..0.06)),
            energy_kwh: Some((power * interval_hours * 1000.0).round() / 1000.0),
            generation_kw,
            seq: Some(self.seq),
            status: Some(ReadingStatus::Ok),
        }
    }
}

fn build_fleet(args: &Args, rng: &mut StdRng) -> Vec<Meter> {
    (0..args.meters)
        .map(|i| {
            let region = args.regions[i as usize % args.regions.len()].clone();
            let industrial = rng.gen_bool(INDUSTRIAL_FRACTION);
            let base = if industrial {
                BASE_INDUSTRIAL_KW * rng.gen_range(0.7..1.3)
            } else {
                BASE_HOUSEHOLD_KW * rng.gen_range(0.5..1.8)
            };

            let fault = if rng.gen_bool(args.spike_fraction.clamp(0.0, 1.0)) {
                Fault::Spike {
                    at: rng.gen_range(0.4..0.8),
                    factor: rng.gen_range(2.5..5.0),
                }
            } else if rng.gen_bool(args.outage_fraction.clamp(0.0, 1.0)) {
                Fault::Outage {
                    at: rng.gen_range(0.4..0.8),
                }
            } else {
                Fault::None
            };

            let solar_peak_kw = rng
                .gen_bool(SOLAR_FRACTION)
                .then(|| base * rng.gen_range(0.5..1.5));

            Meter {
                id: format!("MTR-{:05}", i + 1),
                region,
                base_kw: base,
                solar_peak_kw,
                fault,
                seq: 0,
            }
        })
        .collect()
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut fleet = build_fleet(&args, &mut rng);
    let faulted = fleet.iter().filter(|m| m.fault != Fault::None).count();
    let solar = fleet.iter().filter(|m| m.solar_peak_kw.is_some()).count();
    eprintln!(
        "# fleet: {} meters across {} regions ({} solar, {} faulted)",
        fleet.len(),
        args.regions.len(),
        solar,
        faulted
    );

    let start = Utc::now();
    let total_steps = (args.minutes as u64 * 60) / args.interval as u64;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for step in 0..total_steps {
        let at = start + Duration::seconds((step * args.interval as u64) as i64);
        let progress = step as f64 / total_steps.max(1) as f64;
        for meter in &mut fleet {
            let reading = meter.sample(at, progress, &mut rng);
            serde_json::to_writer(&mut out, &reading)?;
            out.write_all(b"\n")?;
        }
    }
    Ok(())
}
