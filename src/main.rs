use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lxc_autoscaler::cli::Cli;
use lxc_autoscaler::clock::SystemClock;
use lxc_autoscaler::config::{find_config_file, load_config};
use lxc_autoscaler::controller::{
    create_pid_file, pid_file_path, remove_pid_file, run_health_loop, run_main_loop, Runtime,
};
use lxc_autoscaler::gateway::ProxmoxGateway;
use lxc_autoscaler::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = find_config_file(cli.config.as_deref())?;
    info!(path = %config_path.display(), "loading configuration");
    let mut config = load_config(&config_path)?;

    if cli.dry_run {
        config.global.dry_run = true;
    }

    if cli.validate_config {
        println!("configuration is valid");
        println!("monitoring {} containers", config.containers.len());
        println!(
            "gateway target: {}:{}",
            config.gateway.host, config.gateway.port
        );
        return Ok(());
    }

    let gateway: Arc<dyn lxc_autoscaler::gateway::ClusterGateway> =
        Arc::new(ProxmoxGateway::new(&config.gateway)?);

    let monitoring_interval = Duration::from_secs(config.global.monitoring_interval_s);
    let health_interval = Duration::from_secs(config.safety.resource_check_interval_s);
    let pid_path = pid_file_path(&config);

    let runtime = Arc::new(Runtime::new(gateway, config, SystemClock));

    if cli.once {
        runtime.run_cycle().await;
        return Ok(());
    }

    create_pid_file(&pid_path);
    let cancellation = CancellationToken::new();

    let main_loop = tokio::spawn(run_main_loop(
        Arc::clone(&runtime),
        monitoring_interval,
        cancellation.clone(),
    ));
    let health_loop = tokio::spawn(run_health_loop(
        Arc::clone(&runtime),
        health_interval,
        chrono::Duration::seconds(monitoring_interval.as_secs() as i64 * 3),
        cancellation.clone(),
    ));

    let signal_runtime = Arc::clone(&runtime);
    let signal_cancellation = cancellation.clone();
    let signal_config_path = config_path.clone();
    let signals = tokio::spawn(async move {
        lxc_autoscaler::controller::run_signal_handlers(signal_cancellation, || {
            let runtime = Arc::clone(&signal_runtime);
            let path = signal_config_path.clone();
            async move {
                match load_config(&path) {
                    Ok(new_config) => {
                        if let Err(e) = runtime.reload_config(new_config).await {
                            error!(error = %e, "rejected reloaded configuration, keeping previous");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to reload configuration"),
                }
            }
        })
        .await;
    });

    let _ = tokio::join!(main_loop, health_loop, signals);
    remove_pid_file(&pid_path);
    Ok(())
}
