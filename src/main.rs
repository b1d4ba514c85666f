use clap::Parser;
use eyre::{Result, eyre};
use itertools::Itertools;
use kdash::{
    ENCRYPTION_KEY_HOLDER_NAME, ObjectKey,
    auth::{
        AuthManager, AuthenticationMode, AuthenticationModes,
        client::ClusterClientManager,
        jwe::{JweTokenManager, KeyHolder},
    },
    sync::{
        self, SecretStore, SyncMode,
        memory::MemoryStore,
        overwatch::{Overwatch, RestartPolicy},
    },
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// namespace of the encryption key holder secret
    #[arg(short = 'n', long, default_value = "kubernetes-dashboard")]
    namespace: String,
    #[arg(long, default_value = "0.0.0.0:9090")]
    bind: std::net::SocketAddr,
    /// API server URL, overriding the inferred one
    #[arg(long)]
    apiserver_host: Option<String>,
    #[arg(long)]
    kubeconfig: Option<std::path::PathBuf>,
    #[arg(long, value_delimiter = ',', default_value = "token")]
    authentication_mode: Vec<AuthenticationMode>,
    #[arg(long)]
    enable_skip_login: bool,
    /// session token lifetime in seconds; 0 means tokens never expire
    #[arg(long, default_value_t = 900)]
    token_ttl: u64,
    #[arg(long, default_value = "watch")]
    sync_mode: SyncMode,
    /// seconds between two polls of the key holder secret
    #[arg(long, default_value_t = sync::SECRET_SYNC_PERIOD.as_secs(),
          value_parser = clap::value_parser!(u64).range(1..))]
    sync_period: u64,
    /// keep the encryption key in memory only (single replica)
    #[arg(long)]
    no_key_sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("RUST_LOG", "info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config = kube_config(&cli).await?;
    info!("using API server {}", config.cluster_url);

    let store = if cli.no_key_sync {
        warn!("encryption key is not synchronized, run a single replica only");
        SecretStore::Memory(MemoryStore::default())
    } else {
        SecretStore::Kube(config.clone().try_into()?)
    };

    let synchronizer = sync::Builder {
        store,
        key: ObjectKey::new(&cli.namespace, ENCRYPTION_KEY_HOLDER_NAME),
        mode: cli.sync_mode,
        poll_period: Duration::from_secs(cli.sync_period),
    }
    .build();

    let overwatch = Overwatch::new();
    overwatch
        .register_synchronizer(synchronizer.clone(), RestartPolicy::Always)
        .await;

    let key_holder = KeyHolder::new(synchronizer).await?;
    let token_manager = JweTokenManager::new(key_holder, Duration::from_secs(cli.token_ttl));
    let client_manager = ClusterClientManager::new(config);

    let modes: AuthenticationModes = cli.authentication_mode.iter().copied().collect();
    if modes.is_empty() {
        warn!("no authentication mode enabled, every login will be refused");
    } else {
        info!("authentication modes: {}", modes.iter().join(", "));
    }
    if cli.enable_skip_login {
        info!("login can be skipped");
    }

    let manager = AuthManager::new(
        Arc::new(client_manager),
        Arc::new(token_manager),
        modes,
        cli.enable_skip_login,
    );

    tokio::select! {
        e = overwatch.run() => {
            error!("overwatch failed: {e}");
            Err(e.into())
        }
        _ = kdash::api::serve(cli.bind, Arc::new(manager)) => {
            Err(eyre!("API server on {} stopped", cli.bind))
        }
    }
}

async fn kube_config(cli: &Cli) -> Result<kube::Config> {
    let mut config = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?
        }
        None => kube::Config::infer().await?,
    };

    if let Some(host) = &cli.apiserver_host {
        config.cluster_url = host.parse()?;
    }

    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sync_period() {
        let cli = Cli::try_parse_from(["kdash"]).unwrap();
        assert_eq!(sync::SECRET_SYNC_PERIOD.as_secs(), cli.sync_period);

        let cli = Cli::try_parse_from(["kdash", "--sync-period", "10"]).unwrap();
        assert_eq!(10, cli.sync_period);

        assert!(Cli::try_parse_from(["kdash", "--sync-period", "0"]).is_err());
    }
}
