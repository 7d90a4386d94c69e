use std::path::PathBuf;
use std::sync::Arc;

use admiral_core::app::TaskDoc;
use admiral_core::domain::TaskStatusView;
use admiral_core::impls::{SandboxBehavior, SandboxRequestBroker};
use admiral_core::logging::init_tracing;
use admiral_core::tasks::resources::REQUEST_BROKER;
use admiral_core::tasks::{
    EndpointType, SELF_PROVISIONING_FACTORY_LINK, SelfProvisioningBody, SelfProvisioningTaskService,
};
use admiral_core::{AdmiralConfig, TaskHost, TaskService, TaskStage};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "admiral", about = "Self-driving task orchestration", version)]
struct Cli {
    /// TOML config file; environment overrides apply on top.
    #[arg(long, global = true, env = "ADMIRAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision an Admiral cluster against the sandbox request broker.
    Provision(ProvisionArgs),
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// AWS, Azure or GCP.
    #[arg(long, default_value = "AWS")]
    endpoint_type: EndpointType,
    #[arg(long, env = "ADMIRAL_ENDPOINT_AUTH_KEY")]
    auth_key: String,
    #[arg(long, env = "ADMIRAL_ENDPOINT_AUTH_PRIVATE_KEY", hide_env_values = true)]
    auth_private_key: String,
    #[arg(long, default_value = "us-east-1a")]
    availability_zone: String,
    #[arg(long, default_value = "admiral")]
    security_group: String,
    #[arg(long, default_value = "t2.micro")]
    instance_type: String,
    /// Number of container hosts; 0 means 1.
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    cluster_size: i64,
}

impl ProvisionArgs {
    fn into_body(self) -> SelfProvisioningBody {
        SelfProvisioningBody {
            endpoint_auth_key: self.auth_key,
            endpoint_auth_private_key: self.auth_private_key,
            availability_zone_id: self.availability_zone,
            security_group: self.security_group,
            endpoint_type: Some(self.endpoint_type),
            compute_instance_type: self.instance_type,
            cluster_size: self.cluster_size,
            ..SelfProvisioningBody::default()
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AdmiralConfig> {
    let config = match path {
        Some(path) => AdmiralConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AdmiralConfig::from_env().context("reading config from the environment")?,
    };
    Ok(config)
}

async fn provision(config: AdmiralConfig, args: ProvisionArgs) -> Result<TaskStatusView> {
    let host = TaskHost::builder()
        .config(config)
        .factory(
            REQUEST_BROKER,
            Arc::new(SandboxRequestBroker::new(SandboxBehavior::default())),
        )
        .task(SelfProvisioningTaskService)
        .build()?;

    let body = serde_json::to_value(args.into_body())?;
    let created = host
        .post(SELF_PROVISIONING_FACTORY_LINK, body)
        .await
        .context("self-provisioning request rejected")?;
    let link = created["document_self_link"]
        .as_str()
        .context("created task has no link")?
        .to_string();
    info!(task = %link, "self-provisioning started");

    // The terminal snapshot outlives a self-deleting task's document.
    let done = host.wait_for_terminal(&link).await?;
    let doc: TaskDoc<SelfProvisioningTaskService> =
        serde_json::from_value(done).context("decoding the final task state")?;
    host.shutdown();
    Ok(TaskStatusView::from_task(
        SelfProvisioningTaskService::DISPLAY_NAME,
        &doc,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    match cli.command {
        Command::Provision(args) => {
            let status = provision(config, args).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.stage != TaskStage::Finished {
                bail!(
                    "provisioning ended in {}: {}",
                    status.stage,
                    status.failure_message.as_deref().unwrap_or("no failure message")
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provision_args(cluster_size: &str) -> ProvisionArgs {
        let cli = Cli::try_parse_from([
            "admiral",
            "provision",
            "--auth-key",
            "AKIA",
            "--auth-private-key",
            "secret",
            "--cluster-size",
            cluster_size,
        ])
        .unwrap();
        match cli.command {
            Command::Provision(args) => args,
        }
    }

    fn quick_config(self_delete: bool) -> AdmiralConfig {
        let mut config = AdmiralConfig::default();
        config.orchestrator.self_delete = self_delete;
        config.provisioning.wait_delay_secs = 0;
        config
    }

    #[test]
    fn defaults_fill_the_request_body() {
        let body = provision_args("0").into_body();
        assert_eq!(body.endpoint_type, Some(EndpointType::Aws));
        assert_eq!(body.availability_zone_id, "us-east-1a");
        assert_eq!(body.compute_instance_type, "t2.micro");
        assert_eq!(body.cluster_size, 0);
    }

    #[tokio::test]
    async fn provision_reports_the_final_state() {
        let status = provision(quick_config(false), provision_args("2")).await.unwrap();
        assert_eq!(status.stage, TaskStage::Finished);
        assert_eq!(status.progress, 100);
        assert!(status.failure_message.is_none());
    }

    #[tokio::test]
    async fn provision_survives_a_self_deleting_task() {
        let status = provision(quick_config(true), provision_args("1")).await.unwrap();
        assert_eq!(status.stage, TaskStage::Finished);
        assert!(!status.resource_links.is_empty());
    }
}
