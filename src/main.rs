use clap::Parser;
use eyre::format_err;
use kube::{Client, runtime::watcher};
use log::{error, info};
use std::process::exit;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};

use kovn::{Tasks, nbdb, policy::Reconciler, watch};

pub mod config;

/// Kubernetes NetworkPolicy controller for OVN
#[derive(Parser)]
#[command(version, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "KOVN_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "KOVN_LOG_STYLE")]
    log_style: String,

    /// Config file path.
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: String,

    /// Test the config and exit.
    #[arg(long)]
    test_config: bool,
}

const ABOUT: &'static str = r#"
Kubernetes NetworkPolicy controller for OVN

Watch the Kubernetes API server and translate NetworkPolicy objects into
logical constructs in the OVN northbound database:
- one port group per policy, holding the pods the policy selects
- address sets tracking the pods its peer selectors match
- ACLs enforcing the allow rules and default-deny semantics
"#;

/// Tables the core reads or writes; dumped into the client cache at startup.
const NB_TABLES: &[&str] = &["Port_Group", "ACL", "Address_Set", "Logical_Switch_Port"];

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    use config::*;
    let config = tokio::fs::read(&cli.config)
        .await
        .map_err(|e| format_err!("read config failed: {}: {e}", cli.config))?;
    let config: Config =
        serde_yaml::from_slice(&config).map_err(|e| format_err!("parse config failed: {e}"))?;

    let cluster_url = config
        .cluster_url()
        .map_err(|e| format_err!("invalid cluster_url: {e}"))?;

    if cli.test_config {
        return Ok(());
    }

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        select! {
            _ = sigterm.recv() => println!("Received SIGTERM"),
            _ = sigint.recv() => println!("Received SIGINT"),
        };
        exit(0);
    });

    let mut kube_cfg = kube::Config::infer().await?;
    if let Some(cluster_url) = cluster_url {
        kube_cfg.cluster_url = cluster_url;
    }

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);
    let kube: Client = kube_cfg.try_into()?;

    match &config.namespace {
        None => info!("watching all namespaces"),
        Some(ns) => info!("watching policies in namespace {ns}"),
    };

    info!("northbound database at {}", config.nb_address);
    let nb = nbdb::Client::connect(&config.nb_address).await?;
    nb.warm_cache(NB_TABLES).await?;

    let mut tasks = Tasks::new();
    let factory = watch::Factory::start(
        kube.clone(),
        watcher::Config::default(),
        config.namespace.as_deref(),
        &mut tasks,
    );

    let reconciler = Reconciler::new(factory, nb);
    reconciler.start(&kube).await?;

    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => {
                error!("task wait failed: {e}");
            }
            Ok((name, Ok(_))) => {
                info!("task {name} finished");
                continue;
            }
            Ok((name, Err(e))) => {
                error!("task {name} finished with error: {e}");
            }
        }
        exit(1);
    }

    error!("all tasks finished");
    exit(1); // this is actually unexpected
}
