use container_deployer::start_operator;
use deployer_defs::Configuration;
use deployer_utils::setup_logging;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client as KubeClient, Config};
use log::info;

const DEFAULT_CONFIG_PATH: &str = "/etc/container-deployer/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging()?;

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Configuration::from_yaml_file(&config_path)?;
    info!("Loaded configuration from {}", config_path);

    let control = KubeClient::try_default().await?;
    let host = match std::env::var("HOST_KUBECONFIG") {
        Ok(path) => {
            info!("Using host cluster from {}", path);
            let kubeconfig = Kubeconfig::read_from(&path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            KubeClient::try_from(config)?
        }
        Err(_) => control.clone(),
    };

    start_operator(control, host, config).await
}
