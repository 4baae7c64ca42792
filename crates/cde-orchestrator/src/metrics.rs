//! Prometheus metrics collection and formatting.
//!
//! This module renders metrics in Prometheus text exposition format.

use std::fmt::Write;

use cde_core::{AgentHealth, RunStatus};

use crate::registry::AgentStats;
use crate::service::Orchestrator;

/// Collect all metrics from the orchestrator and format as Prometheus text.
pub async fn collect_metrics(orchestrator: &Orchestrator) -> String {
    let mut output = String::new();

    let stats = orchestrator.registry().stats().await;
    collect_agent_metrics(&stats, &mut output);
    collect_dispatch_metrics(&stats, &mut output);
    collect_run_metrics(orchestrator, &mut output).await;

    output
}

/// Agents by effective health.
fn collect_agent_metrics(stats: &[AgentStats], output: &mut String) {
    let mut healthy = 0u64;
    let mut degraded = 0u64;
    let mut unavailable = 0u64;

    for agent in stats {
        match agent.descriptor.health {
            AgentHealth::Healthy => healthy += 1,
            AgentHealth::Degraded => degraded += 1,
            AgentHealth::Unavailable => unavailable += 1,
        }
    }

    writeln!(output, "# HELP cde_agents Number of registered agents by health").ok();
    writeln!(output, "# TYPE cde_agents gauge").ok();
    writeln!(output, "cde_agents{{health=\"healthy\"}} {healthy}").ok();
    writeln!(output, "cde_agents{{health=\"degraded\"}} {degraded}").ok();
    writeln!(
        output,
        "cde_agents{{health=\"unavailable\"}} {unavailable}"
    )
    .ok();
}

/// Per-agent dispatch outcomes and in-flight dispatches.
fn collect_dispatch_metrics(stats: &[AgentStats], output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP cde_agent_dispatches_total Dispatch attempts by agent and outcome"
    )
    .ok();
    writeln!(output, "# TYPE cde_agent_dispatches_total counter").ok();
    for agent in stats {
        let id = &agent.descriptor.id;
        writeln!(
            output,
            "cde_agent_dispatches_total{{agent=\"{id}\",outcome=\"success\"}} {}",
            agent.successes
        )
        .ok();
        writeln!(
            output,
            "cde_agent_dispatches_total{{agent=\"{id}\",outcome=\"failure\"}} {}",
            agent.failures
        )
        .ok();
        writeln!(
            output,
            "cde_agent_dispatches_total{{agent=\"{id}\",outcome=\"timeout\"}} {}",
            agent.timeouts
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP cde_agent_in_flight Dispatches currently holding a concurrency slot"
    )
    .ok();
    writeln!(output, "# TYPE cde_agent_in_flight gauge").ok();
    for agent in stats {
        writeln!(
            output,
            "cde_agent_in_flight{{agent=\"{}\"}} {}",
            agent.descriptor.id, agent.in_flight
        )
        .ok();
    }
}

/// Runs held in memory, by status.
async fn collect_run_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let runs = orchestrator.list_runs().await;

    let mut pending = 0u64;
    let mut running = 0u64;
    let mut blocked = 0u64;
    let mut succeeded = 0u64;
    let mut failed = 0u64;

    for run in &runs {
        match run.status {
            RunStatus::Pending => pending += 1,
            RunStatus::Running => running += 1,
            RunStatus::Blocked => blocked += 1,
            RunStatus::Succeeded => succeeded += 1,
            RunStatus::Failed => failed += 1,
        }
    }

    writeln!(output).ok();
    writeln!(output, "# HELP cde_runs_total Number of retained runs by status").ok();
    writeln!(output, "# TYPE cde_runs_total gauge").ok();
    writeln!(output, "cde_runs_total{{status=\"pending\"}} {pending}").ok();
    writeln!(output, "cde_runs_total{{status=\"running\"}} {running}").ok();
    writeln!(output, "cde_runs_total{{status=\"blocked\"}} {blocked}").ok();
    writeln!(
        output,
        "cde_runs_total{{status=\"succeeded\"}} {succeeded}"
    )
    .ok();
    writeln!(output, "cde_runs_total{{status=\"failed\"}} {failed}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuiltinConfigProvider, Config};

    #[tokio::test]
    async fn test_collect_metrics_empty_orchestrator() {
        let orchestrator =
            Orchestrator::from_provider(&Config::default(), &BuiltinConfigProvider).unwrap();
        let output = collect_metrics(&orchestrator).await;

        // Should contain agent metrics
        assert!(output.contains("cde_agents{health=\"healthy\"} 0"));
        assert!(output.contains("cde_agents{health=\"unavailable\"} 0"));

        // Should contain run metrics
        assert!(output.contains("# TYPE cde_runs_total gauge"));
        assert!(output.contains("cde_runs_total{status=\"blocked\"} 0"));
    }

    #[test]
    fn test_dispatch_counters_per_agent() {
        let stats = vec![AgentStats {
            descriptor: cde_core::AgentDescriptor::new("local"),
            successes: 4,
            failures: 1,
            timeouts: 2,
            in_flight: 1,
        }];
        let mut output = String::new();
        collect_dispatch_metrics(&stats, &mut output);

        assert!(output.contains("cde_agent_dispatches_total{agent=\"local\",outcome=\"success\"} 4"));
        assert!(output.contains("cde_agent_dispatches_total{agent=\"local\",outcome=\"timeout\"} 2"));
        assert!(output.contains("cde_agent_in_flight{agent=\"local\"} 1"));
    }
}
