//! # Prometheus Metrics
//!
//! Renders pipeline counters in Prometheus text exposition format for
//! scraping, and bundles the per-component snapshots for JSON export.

use crate::dispatcher::DispatcherSnapshot;
use crate::processor::ProcessorSnapshot;
use crate::router::Priority;
use serde::Serialize;
use std::fmt::Write;

/// Everything a scrape or status endpoint needs, in one value.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub dispatcher: DispatcherSnapshot,
    pub processor: Option<ProcessorSnapshot>,
}

/// Render a pipeline snapshot as Prometheus text exposition format.
pub fn render_prometheus(snapshot: &PipelineSnapshot) -> String {
    let mut out = String::with_capacity(2048);
    let d = &snapshot.dispatcher;
    let r = &d.router;

    // ── Dispatcher counters ─────────────────────────────────────

    writeln!(
        out,
        "# HELP pulse_dispatcher_received_total Packets received from all sources."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_dispatcher_received_total counter").unwrap();
    writeln!(out, "pulse_dispatcher_received_total {}", d.received).unwrap();

    writeln!(
        out,
        "# HELP pulse_dispatcher_routed_total Packets handed to the router."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_dispatcher_routed_total counter").unwrap();
    writeln!(out, "pulse_dispatcher_routed_total {}", d.routed).unwrap();

    writeln!(
        out,
        "# HELP pulse_dispatcher_dropped_total Packets dropped at ingest."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_dispatcher_dropped_total counter").unwrap();
    writeln!(out, "pulse_dispatcher_dropped_total {}", d.dropped).unwrap();

    writeln!(
        out,
        "# HELP pulse_dispatcher_back_pressure_total Packets shed by back-pressure."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_dispatcher_back_pressure_total counter").unwrap();
    writeln!(
        out,
        "pulse_dispatcher_back_pressure_total {}",
        d.back_pressure_events
    )
    .unwrap();

    writeln!(out, "# HELP pulse_dispatcher_sources Registered sources.").unwrap();
    writeln!(out, "# TYPE pulse_dispatcher_sources gauge").unwrap();
    writeln!(out, "pulse_dispatcher_sources {}", d.source_count).unwrap();

    writeln!(out, "# HELP pulse_dispatcher_subscribers Active subscriptions.").unwrap();
    writeln!(out, "# TYPE pulse_dispatcher_subscribers gauge").unwrap();
    writeln!(out, "pulse_dispatcher_subscribers {}", d.subscriber_count).unwrap();

    // ── Router counters ─────────────────────────────────────────

    writeln!(
        out,
        "# HELP pulse_router_routed_total Packets distributed to subscribers."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_routed_total counter").unwrap();
    writeln!(out, "pulse_router_routed_total {}", r.routed).unwrap();

    writeln!(
        out,
        "# HELP pulse_router_dropped_total Packets dropped by the router."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_dropped_total counter").unwrap();
    writeln!(out, "pulse_router_dropped_total {}", r.dropped).unwrap();

    writeln!(
        out,
        "# HELP pulse_router_queue_overflow_total Enqueues rejected by a full queue."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_queue_overflow_total counter").unwrap();
    writeln!(out, "pulse_router_queue_overflow_total {}", r.queue_overflows).unwrap();

    writeln!(
        out,
        "# HELP pulse_router_out_of_order_total Sequence regressions observed in order mode."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_out_of_order_total counter").unwrap();
    writeln!(out, "pulse_router_out_of_order_total {}", r.out_of_order).unwrap();

    writeln!(
        out,
        "# HELP pulse_router_packets_total Packets accepted per priority class."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_packets_total counter").unwrap();
    for (i, priority) in Priority::ALL.iter().enumerate() {
        writeln!(
            out,
            "pulse_router_packets_total{{priority=\"{}\"}} {}",
            priority.as_str(),
            r.per_priority[i]
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP pulse_router_queue_depth Entries pending per priority class."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_queue_depth gauge").unwrap();
    for (i, priority) in Priority::ALL.iter().enumerate() {
        writeln!(
            out,
            "pulse_router_queue_depth{{priority=\"{}\"}} {}",
            priority.as_str(),
            r.queue_depths[i]
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP pulse_router_latency_ns Routing latency, smoothed average and peak."
    )
    .unwrap();
    writeln!(out, "# TYPE pulse_router_latency_ns gauge").unwrap();
    writeln!(
        out,
        "pulse_router_latency_ns{{stat=\"avg\"}} {:.0}",
        r.avg_latency_ns
    )
    .unwrap();
    writeln!(
        out,
        "pulse_router_latency_ns{{stat=\"peak\"}} {}",
        r.peak_latency_ns
    )
    .unwrap();

    // ── Processor counters ──────────────────────────────────────

    if let Some(p) = &snapshot.processor {
        writeln!(
            out,
            "# HELP pulse_processor_processed_total Packets fully processed."
        )
        .unwrap();
        writeln!(out, "# TYPE pulse_processor_processed_total counter").unwrap();
        writeln!(out, "pulse_processor_processed_total {}", p.processed).unwrap();

        writeln!(
            out,
            "# HELP pulse_processor_failures_total Processing and callback failures."
        )
        .unwrap();
        writeln!(out, "# TYPE pulse_processor_failures_total counter").unwrap();
        writeln!(
            out,
            "pulse_processor_failures_total{{kind=\"process\"}} {}",
            p.failures
        )
        .unwrap();
        writeln!(
            out,
            "pulse_processor_failures_total{{kind=\"callback\"}} {}",
            p.callback_failures
        )
        .unwrap();

        writeln!(out, "# HELP pulse_processor_cache_total Result cache activity.").unwrap();
        writeln!(out, "# TYPE pulse_processor_cache_total counter").unwrap();
        writeln!(
            out,
            "pulse_processor_cache_total{{outcome=\"hit\"}} {}",
            p.cache_hits
        )
        .unwrap();
        writeln!(
            out,
            "pulse_processor_cache_total{{outcome=\"miss\"}} {}",
            p.cache_misses
        )
        .unwrap();

        writeln!(
            out,
            "# HELP pulse_processor_time_ns Per-packet processing time, smoothed average and peak."
        )
        .unwrap();
        writeln!(out, "# TYPE pulse_processor_time_ns gauge").unwrap();
        writeln!(out, "pulse_processor_time_ns{{stat=\"avg\"}} {:.0}", p.avg_ns).unwrap();
        writeln!(out, "pulse_processor_time_ns{{stat=\"peak\"}} {}", p.peak_ns).unwrap();
    }

    out
}
