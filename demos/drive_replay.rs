//! Replay a synthetic drive through the trip engine and print each transition.
//!
//! Run with: `RUST_LOG=info cargo run --example drive_replay`

use drivelog::{
    display_for, Effect, EngineEvent, GpsSample, TrackerConfig, TripEngine, TripType,
};

const T0: i64 = 1_700_000_000_000;
const DEG_PER_KM: f64 = 1.0 / 111.195;

fn main() {
    env_logger::init();

    let config = match TrackerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let mut engine = TripEngine::new(config);

    // Idle, pull away, 5 minutes of driving, park
    let mut samples = vec![(25.0330, 0.0, T0 - 20_000), (25.0330, 1.0, T0 - 10_000)];
    let mut lat = 25.0330;
    samples.push((lat, 12.0, T0));
    for i in 1..=30 {
        lat += (3.2 / 30.0) * DEG_PER_KM;
        samples.push((lat, 38.0, T0 + i * 10_000));
    }
    samples.push((lat, 0.5, T0 + 301_000));
    samples.push((lat, 0.0, T0 + 330_000));

    let mut armed = None;
    for (lat, speed, t) in samples {
        let effects = match engine.handle(
            EngineEvent::Sample(GpsSample::new(lat, 121.5654, speed, t)),
            t,
        ) {
            Ok(effects) => effects,
            Err(e) => {
                eprintln!("sample rejected: {}", e);
                continue;
            }
        };
        armed = track_timer(&effects).or(armed);
        let display = display_for(&engine, t);
        println!(
            "{:>7}s  {:<16} {:>6.2} {}  {}",
            (t - T0) / 1000,
            display.status.to_string(),
            display.distance,
            display.unit.suffix(),
            display.elapsed_label
        );
    }

    let Some(generation) = armed else {
        println!("no stop detected");
        return;
    };
    let fire_at = T0 + 301_000 + engine.config().stop_debounce_ms() as i64;
    if let Err(e) = engine.handle(EngineEvent::TimerFired { generation }, fire_at) {
        eprintln!("timer rejected: {}", e);
        return;
    }
    println!("auto-stop -> {}", engine.status());

    match engine.handle(
        EngineEvent::ConfirmSave {
            trip_id: uuid::Uuid::new_v4().to_string(),
            trip_type: TripType::Business,
            notes: "demo".to_string(),
        },
        fire_at + 5_000,
    ) {
        Ok(effects) => {
            for effect in effects {
                if let Effect::TripCompleted(trip) = effect {
                    match serde_json::to_string_pretty(&trip) {
                        Ok(json) => println!("{}", json),
                        Err(e) => eprintln!("could not serialize trip: {}", e),
                    }
                }
            }
        }
        Err(e) => eprintln!("save rejected: {}", e),
    }
}

fn track_timer(effects: &[Effect]) -> Option<u64> {
    effects.iter().find_map(|effect| match effect {
        Effect::ScheduleStopTimer { generation, .. } => Some(*generation),
        _ => None,
    })
}
