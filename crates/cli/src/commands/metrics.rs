//! `cops metrics`: cluster resource report

use anyhow::Result;
use colored::Colorize;
use ops_lib::quantity::{format_cores, format_memory};
use ops_lib::report::{NodeReport, ResourceTotals};
use ops_lib::ClusterMetricsOutcome;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_percent, print_json, print_table, print_warning, OutputFormat};

const METRICS_PATH: &str = "api/v1/cluster/metrics";

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "CPU Req")]
    cpu_requests: String,
    #[tabled(rename = "Mem Req")]
    memory_requests: String,
    #[tabled(rename = "CPU Used")]
    cpu_used: String,
    #[tabled(rename = "Mem Used")]
    memory_used: String,
}

impl From<&NodeReport> for NodeRow {
    fn from(node: &NodeReport) -> Self {
        Self {
            name: node.name.clone(),
            status: color_status(&node.status.to_string()),
            cpu_requests: format!(
                "{} / {} ({})",
                format_cores(node.cpu_requests),
                format_cores(node.cpu_allocatable),
                format_percent(node.cpu_requests_percent)
            ),
            memory_requests: format!(
                "{} / {} ({})",
                format_memory(node.memory_requests),
                format_memory(node.memory_allocatable),
                format_percent(node.memory_requests_percent)
            ),
            cpu_used: node.live.cpu().to_string(),
            memory_used: node.live.memory().to_string(),
        }
    }
}

fn print_totals(title: &str, totals: &ResourceTotals, render: fn(f64) -> String) {
    println!("{}", title.bold());
    println!("  Capacity:    {}", render(totals.capacity));
    println!("  Allocatable: {}", render(totals.allocatable));
    println!(
        "  Requests:    {} ({})",
        render(totals.requests),
        format_percent(totals.requests_percent)
    );
    println!(
        "  Limits:      {} ({})",
        render(totals.limits),
        format_percent(totals.limits_percent)
    );
    println!();
}

/// Show the cluster report; `text` prints the server's plain-text rendering
pub async fn show(client: &ApiClient, text: bool, format: OutputFormat) -> Result<()> {
    if text {
        let body = client.get_text(&format!("{}?format=text", METRICS_PATH)).await?;
        println!("{}", body);
        return Ok(());
    }

    let outcome: ClusterMetricsOutcome = client.get(METRICS_PATH).await?;

    match (format, outcome) {
        (OutputFormat::Json, outcome) => print_json(&outcome)?,
        (OutputFormat::Table, ClusterMetricsOutcome::NoNodes) => {
            print_warning("No nodes found in the cluster")
        }
        (OutputFormat::Table, ClusterMetricsOutcome::Report(report)) => {
            println!("{}", "Cluster Metrics".bold());
            println!("{}", "=".repeat(50));
            println!(
                "Generated: {}",
                report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!();

            print_totals("CPU", &report.cpu, format_cores);
            print_totals("Memory", &report.memory, format_memory);

            println!("{}", "Pods".bold());
            println!("  Capacity:    {}", report.pods.capacity);
            println!(
                "  Used:        {} ({})",
                report.pods.used,
                format_percent(report.pods.used_percent)
            );
            println!();

            print_table(report.nodes.iter().map(NodeRow::from).collect());

            if report.live_metrics_unavailable > 0 {
                print_warning(&format!(
                    "Live usage unavailable for {} node(s)",
                    report.live_metrics_unavailable
                ));
            }
        }
    }
    Ok(())
}
