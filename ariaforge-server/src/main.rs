//! AriaForge sync server.
//!
//! Runs the collaboration engine behind a WebSocket listener. Sessions are
//! persisted to RocksDB when `--storage` is given, otherwise kept in memory.
//!
//! Join tokens come from `--user TOKEN:ROLE[:USER_ID]` flags; the user ID is
//! generated when omitted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ariaforge_collab::identity::{Role, StaticIdentity};
use ariaforge_collab::oplog::LogConfig;
use ariaforge_collab::server::{ServerConfig, SyncServer};
use ariaforge_collab::session::SessionConfig;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use uuid::Uuid;

fn cli() -> Command {
    Command::new("ariaforge-server")
        .version("0.1.0")
        .about("AriaForge real-time collaboration server")
        .arg(
            Arg::new("bind")
                .long("bind")
                .default_value("127.0.0.1:9090")
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_parser(value_parser!(PathBuf))
                .help("RocksDB directory (in-memory store when omitted)"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .action(ArgAction::Append)
                .help("Join token as TOKEN:ROLE[:USER_ID], ROLE one of owner, editor, viewer"),
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .default_value("1800")
                .value_parser(value_parser!(u64))
                .help("Seconds an empty session stays loaded"),
        )
        .arg(
            Arg::new("submit-timeout-ms")
                .long("submit-timeout-ms")
                .default_value("5000")
                .value_parser(value_parser!(u64))
                .help("Milliseconds to wait for the sequencer before timing out a submit"),
        )
        .arg(
            Arg::new("max-retained-ops")
                .long("max-retained-ops")
                .default_value("1000")
                .value_parser(value_parser!(usize))
                .help("Log entries retained before compaction"),
        )
        .arg(
            Arg::new("min-retained-ops")
                .long("min-retained-ops")
                .default_value("200")
                .value_parser(value_parser!(usize))
                .help("Log entries kept after compaction"),
        )
        .arg(
            Arg::new("compaction-grace")
                .long("compaction-grace")
                .default_value("300")
                .value_parser(value_parser!(u64))
                .help("Seconds compaction waits for lagging members"),
        )
        .arg(
            Arg::new("outbox-capacity")
                .long("outbox-capacity")
                .default_value("256")
                .value_parser(value_parser!(usize))
                .help("Queued frames per connection before it is evicted"),
        )
        .arg(
            Arg::new("presence-interval-ms")
                .long("presence-interval-ms")
                .default_value("33")
                .value_parser(value_parser!(u64))
                .help("Minimum spacing of one user's cursor updates"),
        )
}

fn parse_role(role: &str) -> Option<Role> {
    match role.to_ascii_lowercase().as_str() {
        "owner" => Some(Role::Owner),
        "editor" => Some(Role::Editor),
        "viewer" => Some(Role::Viewer),
        _ => None,
    }
}

/// Parse `TOKEN:ROLE[:USER_ID]`.
fn parse_user(entry: &str) -> Result<(String, Uuid, Role), String> {
    let mut parts = entry.splitn(3, ':');
    let token = parts.next().filter(|t| !t.is_empty()).ok_or_else(|| format!("Missing token in '{entry}'"))?;
    let role = parts.next().ok_or_else(|| format!("Missing role in '{entry}'"))?;
    let role = parse_role(role).ok_or_else(|| format!("Unknown role '{role}'"))?;
    let user_id = match parts.next() {
        Some(id) => Uuid::parse_str(id).map_err(|e| format!("Bad user ID '{id}': {e}"))?,
        None => Uuid::new_v4(),
    };
    Ok((token.to_string(), user_id, role))
}

fn build_identity(matches: &ArgMatches) -> Result<StaticIdentity, String> {
    let mut identity = StaticIdentity::new();
    for entry in matches.get_many::<String>("user").into_iter().flatten() {
        let (token, user_id, role) = parse_user(entry)?;
        info!("Registered user {user_id} as {role:?}");
        identity.insert(token, user_id, role);
    }
    Ok(identity)
}

fn build_config(matches: &ArgMatches) -> ServerConfig {
    let arg = |name: &str| matches.get_one::<u64>(name).copied().unwrap_or_default();
    let count = |name: &str| matches.get_one::<usize>(name).copied().unwrap_or_default();

    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: matches.get_one::<String>("bind").cloned().unwrap_or(defaults.bind_addr),
        storage_path: matches.get_one::<PathBuf>("storage").cloned(),
        outbox_capacity: count("outbox-capacity"),
        submit_timeout: Duration::from_millis(arg("submit-timeout-ms")),
        session: SessionConfig {
            idle_timeout: Duration::from_secs(arg("idle-timeout")),
            compaction_grace: Duration::from_secs(arg("compaction-grace")),
            presence_interval: Duration::from_millis(arg("presence-interval-ms")),
            log: LogConfig {
                max_retained_ops: count("max-retained-ops"),
                min_retained_ops: count("min-retained-ops"),
            },
            ..defaults.session
        },
        ..defaults
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = cli().get_matches();
    let identity = match build_identity(&matches) {
        Ok(identity) => identity,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };
    if identity.is_empty() {
        log::warn!("No --user given; every join will be rejected");
    }

    let config = build_config(&matches);
    info!("Starting AriaForge sync server on {}...", config.bind_addr);

    let server = match SyncServer::open(config, Arc::new(identity)) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
