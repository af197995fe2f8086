use clap::{Parser, Subcommand};
use kiot::device::{Device, DeviceInfo};
use kiot::gateway::Gateway;
use kiot::retry::RetryPolicy;

#[derive(Parser)]
#[command(name = "kiot")]
#[command(about = "Kuzzle IoT gateway CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Check that the server is reachable and print its server info.
    ServerInfo {
        /// Config file path (default: KIOT_CONFIG_PATH or ~/.kiot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Print the stored record of a device.
    Get {
        /// Config file path (default: KIOT_CONFIG_PATH or ~/.kiot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Device unique id.
        uid: String,
    },

    /// Create or replace a device record.
    Register {
        /// Config file path (default: KIOT_CONFIG_PATH or ~/.kiot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Device unique id.
        uid: String,

        /// Device type, e.g. "light".
        device_type: String,

        #[arg(long)]
        owner: Option<String>,

        #[arg(long, value_name = "NAME")]
        friendly_name: Option<String>,

        #[arg(long)]
        location: Option<String>,
    },

    /// Publish a device state (JSON object).
    Publish {
        /// Config file path (default: KIOT_CONFIG_PATH or ~/.kiot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        uid: String,

        device_type: String,

        /// State as JSON, e.g. '{"on":true}'.
        state: String,

        /// Mark the state as partial.
        #[arg(long)]
        partial: bool,
    },

    /// Print state changes of a device until interrupted.
    Watch {
        /// Config file path (default: KIOT_CONFIG_PATH or ~/.kiot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        uid: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let res = match cli.command {
        Some(Commands::Version) => {
            println!("kiot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::ServerInfo { config }) => run_server_info(config).await,
        Some(Commands::Get { config, uid }) => run_get(config, uid).await,
        Some(Commands::Register {
            config,
            uid,
            device_type,
            owner,
            friendly_name,
            location,
        }) => {
            let info = DeviceInfo {
                friendly_name,
                location,
                ..DeviceInfo::default()
            };
            run_register(config, uid, device_type, owner, info).await
        }
        Some(Commands::Publish {
            config,
            uid,
            device_type,
            state,
            partial,
        }) => run_publish(config, uid, device_type, state, partial).await,
        Some(Commands::Watch { config, uid }) => run_watch(config, uid).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = res {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn connect(
    config_path: Option<std::path::PathBuf>,
) -> anyhow::Result<(Gateway, RetryPolicy)> {
    let (config, path) = kiot::config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());
    let retry = RetryPolicy::from(&config.retry);
    let gateway = Gateway::connect(config.gateway).await?;
    Ok((gateway, retry))
}

async fn run_server_info(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = kiot::config::load_config(config_path)?;
    let info = kiot::gateway::server_info(&config.gateway).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn run_get(config_path: Option<std::path::PathBuf>, uid: String) -> anyhow::Result<()> {
    let (gateway, retry) = connect(config_path).await?;
    let device = Device::new(uid, "", gateway.clone()).with_retry(retry);
    match device.get_info().await? {
        Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
        None => println!("device {} is not registered", device.uid()),
    }
    gateway.disconnect().await?;
    Ok(())
}

async fn run_register(
    config_path: Option<std::path::PathBuf>,
    uid: String,
    device_type: String,
    owner: Option<String>,
    info: DeviceInfo,
) -> anyhow::Result<()> {
    let (gateway, retry) = connect(config_path).await?;
    let mut device = Device::new(uid, device_type, gateway.clone()).with_retry(retry);
    if let Some(owner) = owner {
        device = device.with_owner(owner);
    }
    device.register(Some(&info)).await?;
    println!("registered {}", device.uid());
    gateway.disconnect().await?;
    Ok(())
}

async fn run_publish(
    config_path: Option<std::path::PathBuf>,
    uid: String,
    device_type: String,
    state: String,
    partial: bool,
) -> anyhow::Result<()> {
    let state: serde_json::Value = serde_json::from_str(&state)?;
    let (gateway, _) = connect(config_path).await?;
    let device = Device::new(uid, device_type, gateway.clone());
    device.publish_state(state, partial).await?;
    gateway.disconnect().await?;
    Ok(())
}

async fn run_watch(config_path: Option<std::path::PathBuf>, uid: String) -> anyhow::Result<()> {
    let (gateway, _) = connect(config_path).await?;
    let device = Device::new(uid, "", gateway.clone());
    let mut sub = device.subscribe_state().await?;
    println!("watching {} (ctrl-c to stop)", device.uid());
    loop {
        tokio::select! {
            n = sub.next() => {
                let Some(n) = n else { break };
                let tag = if n.partial { " (partial)" } else { "" };
                println!("{} {}{}: {}", n.subject, n.action, tag, n.state);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    gateway.unsubscribe(sub).await?;
    gateway.disconnect().await?;
    Ok(())
}
