use consensusset::{config::OperatorConfig, crd::ConsensusSet, errors::*, manager::Manager};
use kube::{Client, CustomResourceExt};
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    // `consensusset crd | kubectl apply -f -` installs the definition
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!("{}", serde_yaml::to_string(&ConsensusSet::crd())?);
        return Ok(());
    }

    let config = OperatorConfig::load()?;
    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    info!("starting {}", config.controller_name);
    let (_manager, drainer) = Manager::new(client, config).await?;
    drainer.await;
    Ok(())
}
