//! `cops port-forward` commands

use anyhow::Result;
use chrono::Utc;
use ops_lib::tools::{render_pruned, render_started};
use ops_lib::{CloseOutcome, PortForwardRequest, SessionSummary, StopResponse};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_age, print_json, print_success, print_table, print_warning, OutputFormat,
};

const PORT_FORWARDS_PATH: &str = "api/v1/port-forwards";

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "Local Port")]
    local_port: u16,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Remote Port")]
    remote_port: u16,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Age")]
    age: String,
}

impl From<&SessionSummary> for SessionRow {
    fn from(session: &SessionSummary) -> Self {
        let status = if session.alive {
            session.state.to_string()
        } else {
            "Terminated".to_string()
        };

        Self {
            local_port: session.local_port,
            target: format!("{}/{}", session.resource_type, session.resource_name),
            remote_port: session.remote_port,
            namespace: session.namespace.clone(),
            status: color_status(&status),
            pid: session
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            age: format_age(session.started_at, Utc::now()),
        }
    }
}

/// Parse `LOCAL:REMOTE`, or a single port used for both
pub fn parse_port_pair(spec: &str) -> Result<(u16, u16), String> {
    let parse = |s: &str| -> Result<u16, String> {
        match s.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("invalid port {:?}", s)),
            Ok(port) => Ok(port),
        }
    };

    match spec.split_once(':') {
        Some((local, remote)) => Ok((parse(local)?, parse(remote)?)),
        None => {
            let port = parse(spec)?;
            Ok((port, port))
        }
    }
}

pub async fn open(
    client: &ApiClient,
    resource: String,
    ports: (u16, u16),
    namespace: Option<String>,
    resource_type: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let request = PortForwardRequest {
        resource,
        local_port: ports.0 as i64,
        remote_port: ports.1 as i64,
        namespace,
        resource_type,
    };
    let session: SessionSummary = client.post(PORT_FORWARDS_PATH, &request).await?;

    match format {
        OutputFormat::Json => print_json(&session)?,
        OutputFormat::Table => print_success(&render_started(&session)),
    }
    Ok(())
}

pub async fn stop(client: &ApiClient, local_port: u16, format: OutputFormat) -> Result<()> {
    let path = format!("{}/{}", PORT_FORWARDS_PATH, local_port);
    let stopped: StopResponse = client.delete(&path).await?;

    match format {
        OutputFormat::Json => print_json(&stopped)?,
        OutputFormat::Table => {
            if stopped.outcome == CloseOutcome::AlreadyExited {
                print_warning(&stopped.message);
            } else {
                print_success(&stopped.message);
            }
        }
    }
    Ok(())
}

pub async fn list(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let sessions: Vec<SessionSummary> = client.get(PORT_FORWARDS_PATH).await?;

    match format {
        OutputFormat::Json => print_json(&sessions)?,
        OutputFormat::Table => {
            if sessions.is_empty() {
                print_warning("No active port forwards");
                return Ok(());
            }
            print_table(sessions.iter().map(SessionRow::from).collect());
        }
    }
    Ok(())
}

pub async fn prune(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let path = format!("{}/prune", PORT_FORWARDS_PATH);
    let pruned: Vec<SessionSummary> = client.post(&path, &serde_json::json!({})).await?;

    match format {
        OutputFormat::Json => print_json(&pruned)?,
        OutputFormat::Table if pruned.is_empty() => print_warning(&render_pruned(&pruned)),
        OutputFormat::Table => print_success(&render_pruned(&pruned)),
    }
    Ok(())
}
