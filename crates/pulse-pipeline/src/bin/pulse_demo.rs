//! End-to-end demo: a simulation source feeding the dispatcher, a
//! processor subscribed to the generated packet stream, and a statistics
//! dump at the end.
//!
//! ```text
//! pulse-demo [config.toml] [seconds]
//! ```

use anyhow::Result;
use pulse_pipeline::config::PipelineConfig;
use pulse_pipeline::dispatcher::{DispatcherEvent, PacketDispatcher};
use pulse_pipeline::extract::{FieldType, StructDecl};
use pulse_pipeline::metrics::{render_prometheus, PipelineSnapshot};
use pulse_pipeline::processor::PacketProcessor;
use pulse_pipeline::source::{SimulationConfig, SimulationSource};
use pulse_pipeline::transform::TransformOp;
use pulse_wire::pool::BufferPool;
use pulse_wire::wire::Flags;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TELEMETRY_ID: u32 = 100;

fn telemetry_decl() -> StructDecl {
    StructDecl::new("VehicleTelemetry", 24)
        .nested(
            "position",
            0,
            StructDecl::new("Vec3", 12)
                .scalar("x", 0, FieldType::F32)
                .scalar("y", 4, FieldType::F32)
                .scalar("z", 8, FieldType::F32),
        )
        .scalar("status", 12, FieldType::U32)
        .scalar("battery_mv", 16, FieldType::U16)
        .bit_field("mode", 18, 1, 0, 4)
        .bit_field("armed", 18, 1, 4, 1)
        .array("tag", 19, FieldType::CharArray, 5, true)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };
    let seconds: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(3);

    let pool = BufferPool::with_defaults();
    let dispatcher = PacketDispatcher::new(config.dispatcher.clone(), config.router.clone());
    let processor = PacketProcessor::new(config.processor.clone(), config.statistics.clone());

    processor.extractor().bind(TELEMETRY_ID, &telemetry_decl());
    processor.transformer().set_chain(
        "battery_mv",
        vec![TransformOp::ToDouble, TransformOp::MovingAverage(32)],
    );
    processor.transformer().set_chain(
        "position.z",
        vec![TransformOp::Clamp {
            min: -1_000.0,
            max: 10_000.0,
        }],
    );

    dispatcher.subscribe(
        "processor",
        TELEMETRY_ID,
        PacketProcessor::subscriber(&processor),
        0,
    );
    dispatcher.add_observer(Arc::new(|event| {
        if let DispatcherEvent::BackPressure { queue_depth } = event {
            info!(queue_depth, "back-pressure signal");
        }
    }));

    let source = SimulationSource::new(
        "sim-vehicle",
        SimulationConfig {
            packet_ids: vec![TELEMETRY_ID],
            payload_size: 24,
            interval: Duration::from_micros(500),
            flags: Flags::SIMULATION,
        },
        Arc::clone(&pool),
    );
    dispatcher.register_source(Box::new(source))?;

    info!(seconds, "running demo pipeline");
    dispatcher.start();
    std::thread::sleep(Duration::from_secs(seconds));
    dispatcher.stop();

    processor.statistics().recompute_now();
    let snapshot = PipelineSnapshot {
        dispatcher: dispatcher.snapshot(),
        processor: Some(processor.snapshot()),
    };
    println!("{}", render_prometheus(&snapshot));
    println!("--- snapshot (json) ---");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    for path in ["position.x", "battery_mv", "mode"] {
        if let Some(stats) = processor.statistics().snapshot(path) {
            println!(
                "{path}: n={} mean={:.2} min={:.2} max={:.2} rate={:.0}/s",
                stats.count, stats.mean, stats.min, stats.max, stats.rate_hz
            );
        }
    }

    Ok(())
}
