/*!
 * Terminal tables for pool and simulation reports
 */

use crate::memory::MemoryBrokerStats;
use crate::pool::PoolStats;
use crate::simulate::SimulationReport;
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};

/// Create a minimal table (no outer borders)
pub fn create_minimal_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Create a key-value table for stats
pub fn stats_table(items: &[(&str, String)]) -> Table {
    let mut table = create_minimal_table();

    for (key, value) in items {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value)
                .fg(Color::White)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table
}

pub fn pool_stats_table(stats: &PoolStats) -> Table {
    stats_table(&[
        (
            "Connections",
            format!(
                "{} / {} ({:.0}%)",
                stats.total,
                stats.max_connections,
                stats.utilization()
            ),
        ),
        ("Idle / active", format!("{} / {}", stats.idle, stats.active)),
        ("Free permits", stats.available_permits.to_string()),
        ("Channels in use", stats.channels_in_use.to_string()),
        (
            "Connections created / reused / disposed",
            format!(
                "{} / {} / {}",
                stats.connections_created, stats.connections_reused, stats.connections_disposed
            ),
        ),
        (
            "Channels created / reused / discarded",
            format!(
                "{} / {} / {}",
                stats.channels_created, stats.channels_reused, stats.channels_discarded
            ),
        ),
        (
            "Health sweeps (evictions)",
            format!("{} ({})", stats.health_sweeps, stats.sweep_evictions),
        ),
    ])
}

pub fn broker_stats_table(stats: &MemoryBrokerStats) -> Table {
    stats_table(&[
        (
            "Connect attempts / opened",
            format!("{} / {}", stats.connect_attempts, stats.connections_opened),
        ),
        ("Peak open connections", stats.max_open_connections.to_string()),
        ("Peak open channels", stats.max_concurrent_channels.to_string()),
        ("Messages published", stats.messages_published.to_string()),
    ])
}

pub fn outcome_table(report: &SimulationReport) -> Table {
    let outcomes = &report.outcomes;
    let state_color = match report.circuit_state {
        "closed" => Color::Green,
        "half-open" => Color::Yellow,
        _ => Color::Red,
    };

    let mut table = stats_table(&[
        ("Succeeded", outcomes.succeeded.to_string()),
        ("Failed", outcomes.failed.to_string()),
        ("Rejected by circuit", outcomes.rejected.to_string()),
        ("Queued messages", report.queued_messages.to_string()),
        ("Elapsed", format!("{} ms", report.elapsed_ms)),
    ]);
    table.add_row(vec![
        Cell::new("Circuit").fg(Color::Cyan),
        Cell::new(report.circuit_state)
            .fg(state_color)
            .add_attribute(Attribute::Bold),
    ]);
    table
}
