use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::info;

use raftpeer::{Config, Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("raftpeer")
        .version("0.1.0")
        .about("Raft consensus peer replicating a key/value store")
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON config file; flags override its values")
                .required(false),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Address other peers connect to, e.g. 127.0.0.1:7001")
                .required(false),
        )
        .arg(
            Arg::new("client-listen")
                .long("client-listen")
                .help("Address clients connect to")
                .required(false),
        )
        .arg(
            Arg::new("peers")
                .long("peers")
                .help("Comma-separated peer addresses (may include this peer)")
                .required(false),
        )
        .arg(
            Arg::new("election-timeout-min")
                .long("election-timeout-min")
                .help("Minimum election timeout in ms")
                .required(false),
        )
        .arg(
            Arg::new("election-timeout-max")
                .long("election-timeout-max")
                .help("Maximum election timeout in ms")
                .required(false),
        )
        .arg(
            Arg::new("heartbeat")
                .long("heartbeat")
                .help("Leader heartbeat interval in ms")
                .required(false),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("trace, debug, info, warn or error")
                .default_value("info"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Write logs to this file instead of stdout")
                .required(false),
        )
        .get_matches();

    init_logging(&matches)?;

    let mut config = load_config(&matches)?;
    config.validate().context("invalid configuration")?;
    info!("Node configuration: {:?}", config);

    let node = Node::new(config).await.context("failed to start peer")?;
    node.start().await?;

    Ok(())
}

fn init_logging(matches: &ArgMatches) -> anyhow::Result<()> {
    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let level: tracing::Level = level
        .parse()
        .with_context(|| format!("invalid log level {:?}", level))?;

    let builder = tracing_subscriber::fmt().with_max_level(level);
    match matches.get_one::<String>("log-file") {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("cannot create {}", path))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let listen = parse_addr(matches, "listen")?;
    let client = parse_addr(matches, "client-listen")?;

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path)?,
        None => match (listen, client) {
            (Some(listen), Some(client)) => Config::new(listen, client, Vec::new()),
            _ => bail!("either --config or both --listen and --client-listen are required"),
        },
    };

    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if let Some(client) = client {
        config.client_addr = client;
    }
    if let Some(peers) = matches.get_one::<String>("peers") {
        config.peers = peers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<SocketAddr>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid peer list {:?}", peers))?;
    }
    if let Some(ms) = parse_ms(matches, "election-timeout-min")? {
        config.election_timeout_min_ms = ms;
    }
    if let Some(ms) = parse_ms(matches, "election-timeout-max")? {
        config.election_timeout_max_ms = ms;
    }
    if let Some(ms) = parse_ms(matches, "heartbeat")? {
        config.heartbeat_interval_ms = ms;
    }
    Ok(config)
}

fn parse_addr(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<SocketAddr>> {
    matches
        .get_one::<String>(name)
        .map(|s| {
            s.parse::<SocketAddr>()
                .with_context(|| format!("invalid --{} address {:?}", name, s))
        })
        .transpose()
}

fn parse_ms(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<u64>> {
    matches
        .get_one::<String>(name)
        .map(|s| {
            s.parse::<u64>()
                .with_context(|| format!("invalid --{} value {:?}", name, s))
        })
        .transpose()
}
