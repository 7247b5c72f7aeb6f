//! Compose CLI commands for managing a project.

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use convoy_core::manifest::ImageSource;
use convoy_core::{
    cancel_on_interrupt, Manifest, Orchestrator, ServiceState, ServiceStatus, StopOutcome,
    UpOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tracing::debug;

/// Load the manifest from `file`, or from the first well-known compose file
/// in the current directory.
pub fn load_manifest(file: Option<&Path>, project: Option<&str>) -> Result<Manifest> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            convoy_core::paths::find_manifest(&cwd).ok_or_else(|| {
                anyhow!(
                    "No compose file found in {} (tried {})",
                    cwd.display(),
                    convoy_core::paths::MANIFEST_NAMES.join(", ")
                )
            })?
        }
    };

    debug!(path = %path.display(), "Loading compose file");
    Manifest::load_file(&path, project)
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Create and start the project.
pub async fn up(orchestrator: &Orchestrator, detach: bool, build: bool) -> Result<()> {
    let manifest = orchestrator.manifest();

    println!(
        "{} Starting project {} with {} service(s)",
        "→".cyan().bold(),
        manifest.project().bold(),
        manifest.services().len()
    );
    println!();

    for service in manifest.services() {
        let image = match &service.image {
            ImageSource::Build { tag, .. } => format!("{} (build)", tag),
            ImageSource::Pull { reference } => reference.clone(),
        };
        println!("  {} {} {}", "•".dimmed(), service.name.bold(), image.dimmed());
    }
    println!();

    cancel_on_interrupt(orchestrator.cancel_handle());
    let options = UpOptions { detached: detach, build };

    if !detach {
        let report = orchestrator.up(options).await.context("Failed to run project")?;
        println!();
        match report.attached {
            Some(service) => {
                println!("{} Detached from {}, project stopped", "✓".green().bold(), service.bold())
            }
            None => println!("{} Project stopped", "✓".green().bold()),
        }
        return Ok(());
    }

    let spinner = spinner("green", "Resolving images and starting services...")?;
    let result = orchestrator.up(options).await;
    spinner.finish_and_clear();
    let report = result.context("Failed to start project")?;

    for (level, services) in report.levels.iter().enumerate() {
        println!("  {} level {}: {}", "•".dimmed(), level, services.join(", "));
    }
    println!("{} Project started: {}", "✓".green().bold(), manifest.project().bold());
    println!();

    let statuses = orchestrator.ps().await.context("Failed to read service status")?;
    print_status_table(&statuses);
    println!();
    println!("{}", "Project running in background".dimmed());

    Ok(())
}

/// Stop the project's services.
pub async fn stop(orchestrator: &Orchestrator) -> Result<()> {
    let spinner = spinner("yellow", "Stopping services...")?;
    let result = orchestrator.stop().await;
    spinner.finish_and_clear();
    let report = result.context("Failed to stop project")?;

    if report.stopped.is_empty() {
        println!("Nothing to stop");
        return Ok(());
    }
    for (service, outcome) in &report.stopped {
        println!("  {} {} {}", "•".dimmed(), service.bold(), colorize_outcome(*outcome));
    }
    for service in report.degraded() {
        println!(
            "{} {} did not stop within the grace period and was killed",
            "⚠".yellow().bold(),
            service.bold()
        );
    }
    println!("{} Project stopped: {}", "✓".green().bold(), orchestrator.manifest().project().bold());

    Ok(())
}

/// Stop and remove the project.
pub async fn down(orchestrator: &Orchestrator, remove_volumes: bool) -> Result<()> {
    let project = orchestrator.manifest().project();

    let spinner = spinner("yellow", &format!("Removing project '{}'...", project))?;
    let result = orchestrator.down(remove_volumes).await;
    spinner.finish_and_clear();
    let report = result.context("Failed to remove project")?;

    for service in &report.removed {
        println!("  {} {} {}", "•".dimmed(), service.bold(), "removed".dimmed());
    }
    if report.volumes_removed {
        println!("  {} {}", "•".dimmed(), "named volumes removed".dimmed());
    }
    println!("{} Project removed: {}", "✓".green().bold(), project.bold());

    Ok(())
}

/// List the project's services.
pub async fn ps(orchestrator: &Orchestrator) -> Result<()> {
    let statuses = orchestrator.ps().await.context("Failed to read service status")?;

    if statuses.iter().all(|s| s.container_id.is_none()) {
        println!("No containers for project {}", orchestrator.manifest().project().bold());
        return Ok(());
    }

    print_status_table(&statuses);

    for status in statuses.iter().filter(|s| s.state == ServiceState::Failed) {
        if let Some(reason) = &status.last_error {
            println!("{} {}: {}", "✗".red().bold(), status.service.bold(), reason);
        }
    }

    Ok(())
}

/// Print the resolved compose file.
pub fn config(orchestrator: &Orchestrator) -> Result<()> {
    let yaml = orchestrator.config().context("Failed to render compose file")?;
    print!("{}", yaml);
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn print_status_table(statuses: &[ServiceStatus]) {
    #[derive(Tabled)]
    struct ServiceRow {
        #[tabled(rename = "SERVICE")]
        service: String,
        #[tabled(rename = "CONTAINER")]
        container: String,
        #[tabled(rename = "IMAGE")]
        image: String,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "PORTS")]
        ports: String,
    }

    let rows: Vec<ServiceRow> = statuses
        .iter()
        .map(|s| ServiceRow {
            service: s.service.clone(),
            container: s.container_name.clone(),
            image: s.image.clone(),
            state: colorize_state(s.state),
            ports: format_ports(&s.ports),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
}

fn spinner(color: &str, message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template(&format!("{{spinner:.{}}} {{msg}}", color))?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

/// Colorize a service state.
fn colorize_state(state: ServiceState) -> String {
    let text = state.to_string();
    match state {
        ServiceState::Running | ServiceState::Healthy => text.green().to_string(),
        ServiceState::Stopped | ServiceState::Removed => text.red().to_string(),
        ServiceState::Failed => text.red().bold().to_string(),
        ServiceState::Created | ServiceState::Starting | ServiceState::Stopping => {
            text.yellow().to_string()
        }
        ServiceState::Pending => text.dimmed().to_string(),
    }
}

fn colorize_outcome(outcome: StopOutcome) -> String {
    match outcome {
        StopOutcome::Graceful => "stopped".green().to_string(),
        StopOutcome::TimedOut => "killed after timeout".yellow().to_string(),
        StopOutcome::Killed => "killed".yellow().to_string(),
        StopOutcome::NotRunning => "not running".dimmed().to_string(),
    }
}

/// Format published ports for a table cell.
fn format_ports(ports: &[String]) -> String {
    if ports.is_empty() {
        "-".to_string()
    } else {
        ports.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ports() {
        assert_eq!(format_ports(&[]), "-");
        assert_eq!(
            format_ports(&["3000:3000/tcp".to_string(), "127.0.0.1:8080:80/tcp".to_string()]),
            "3000:3000/tcp, 127.0.0.1:8080:80/tcp"
        );
    }

    #[test]
    fn test_colorize_state() {
        colored::control::set_override(false);
        assert_eq!(colorize_state(ServiceState::Running), "running");
        assert_eq!(colorize_state(ServiceState::Failed), "failed");
        assert_eq!(colorize_outcome(StopOutcome::TimedOut), "killed after timeout");
    }

    #[test]
    fn test_load_manifest_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yaml");
        std::fs::write(&path, "services:\n  web:\n    image: nginx\n").unwrap();

        let manifest = load_manifest(Some(&path), Some("Demo App")).unwrap();
        assert_eq!(manifest.project(), "demoapp");
        assert_eq!(manifest.container_name(manifest.services()[0].id), "demoapp-web-1");
    }

    #[test]
    fn test_load_manifest_missing_file() {
        let err = load_manifest(Some(Path::new("/nonexistent/compose.yaml")), None).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/compose.yaml"));
    }
}
