use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use killswitch_core::{logging, Clock, Config, SystemClock};
use serde::Serialize;
use tracing::{error, info, warn};

mod node;

use node::Node;

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init_from_config(&config.logging);
    info!(
        platform_id = %config.node.platform_id,
        config = %config_path.display(),
        "killswitch-node starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let node = Node::open(&config, clock)?;

    let mode_changes = node.subscribe_mode_changes()?;
    std::thread::spawn(move || {
        for change in mode_changes {
            warn!(
                platform_id = %change.platform_id,
                from = %change.from,
                to = %change.to,
                reason = %change.reason,
                "Failsafe mode changed"
            );
        }
    });

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let decision = node.handle_line(&line);
        serde_json::to_writer(&mut stdout, &decision)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }

    if let Err(e) = node.audit_log().verify() {
        error!(error = %e, "Audit chain verification failed at shutdown");
        return Err(anyhow!("audit chain verification failed: {e}"));
    }
    info!("killswitch-node stopped");
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}
