// CLI entry point for the Trellis relay.
//
// Starts a standalone relay server that game clients connect to. The relay
// forwards opaque payloads between the members of each session; it never
// looks inside them. See `server.rs` for the networking architecture and
// `session.rs` for the per-session state machine.
//
// Settings come from defaults, then the environment (`RELAY_PORT`,
// `RELAY_ADDRESS`, `JOIN_CODE_LENGTH`, `ENABLE_DESTROY_API`), then the flags
// below. Logging goes through `tracing`; `RUST_LOG` overrides the level.
//
// While running, the relay reads operator commands from stdin:
//   create           create a session and print its join code
//   list             print live sessions
//   destroy <CODE>   destroy a session (if the destroy API is enabled)
//   quit             stop the relay
// End of input (e.g. when run detached) leaves the relay running until the
// process is killed.

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trellis_relay::api::SessionApi;
use trellis_relay::config::{RelayConfig, parse_join_code_length};
use trellis_relay::start_relay;

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Session relay for NAT-bound game peers", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Listen port (overrides RELAY_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Interface to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Address advertised to clients (overrides RELAY_ADDRESS)
    #[arg(long)]
    public_address: Option<String>,

    /// Characters per join code (overrides JOIN_CODE_LENGTH)
    #[arg(long, value_parser = parse_join_code_length)]
    join_code_length: Option<usize>,

    /// Seconds an empty session is kept before it is dropped
    #[arg(long)]
    empty_session_grace: Option<u64>,

    /// Seconds a new connection has to present its join request
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Refuse session destruction requests
    #[arg(long)]
    disable_destroy_api: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("relay listening on {addr}; type `help` for operator commands");

    let api = handle.api();
    if operator_console(&api) {
        info!("shutting down");
        handle.stop();
    } else {
        // No console attached: serve until the process is killed.
        loop {
            thread::sleep(Duration::from_secs(3600));
        }
    }
    ExitCode::SUCCESS
}

fn build_config(cli: &Cli) -> Result<RelayConfig, trellis_relay::error::ConfigError> {
    let mut config = RelayConfig::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(address) = &cli.public_address {
        config.public_address = address.clone();
    }
    if let Some(length) = cli.join_code_length {
        config.join_code_length = length;
    }
    if let Some(secs) = cli.empty_session_grace {
        config.empty_session_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.handshake_timeout {
        config.handshake_timeout = Duration::from_secs(secs);
    }
    if cli.disable_destroy_api {
        config.enable_destroy_api = false;
    }
    config.validate()?;
    Ok(config)
}

/// Serve operator commands from stdin. Returns `true` on `quit`, `false`
/// when stdin closes.
fn operator_console(api: &SessionApi) -> bool {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            return false;
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("create"), None) => match api.create() {
                Ok(info) => println!(
                    "{} ({}:{})",
                    info.join_code, info.relay_address, info.relay_port
                ),
                Err(e) => println!("error: {e}"),
            },
            (Some("list"), None) => {
                let sessions = api.list();
                if sessions.is_empty() {
                    println!("no sessions");
                }
                for info in sessions {
                    println!("{}", info.join_code);
                }
            }
            (Some("destroy"), Some(code)) => match api.destroy(code) {
                Ok(()) => println!("destroyed {code}"),
                Err(e) => println!("error: {e}"),
            },
            (Some("quit" | "exit"), None) => return true,
            _ => println!("commands: create | list | destroy <CODE> | quit"),
        }
    }
    false
}
