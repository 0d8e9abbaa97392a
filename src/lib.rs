pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod logbook;
pub mod monitor;
pub mod profile;
pub mod service;
pub mod settings;
pub mod store;

pub use error::{ConvertError, CoreError, Result};
pub use profile::{Config, ConfigKind, CoreType, ListenerPort, ProfileItem, ProtocolType};
pub use service::{ActivationOrigin, CoreEvent, CoreState, CoreSupervisor, ImportOutcome};
pub use settings::SupervisorSettings;
pub use store::ProfileStore;

use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

const APP_LOG_NAME: &str = "coreward.log";

const USAGE: &str = "\
usage: coreward [--data-dir DIR] [--verbose] <command>

commands:
  list                                         show profiles
  add <name> <core-type> <config> <port>       add a custom profile
  import <name> <core-type> <yaml> [port]      import a Clash config
  select <id>                                  select the profile to run
  remove <id>                                  delete a profile
  convert <src> <dst> <start-port>             convert a Clash config
  run [id]                                     run a profile until Ctrl-C";

#[derive(Debug)]
struct Cli {
    data_dir: PathBuf,
    verbose: bool,
    command: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> std::result::Result<Cli, String> {
    let mut cli = Cli {
        data_dir: PathBuf::from("."),
        verbose: false,
        command: vec![],
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" | "-d" => {
                let dir = args.next().ok_or("--data-dir needs a value")?;
                cli.data_dir = PathBuf::from(dir);
            }
            "--verbose" | "-v" => cli.verbose = true,
            "--help" | "-h" => return Err(USAGE.to_string()),
            _ => {
                cli.command.push(arg);
                cli.command.extend(args.by_ref());
            }
        }
    }
    if cli.command.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok(cli)
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {}", value))
}

fn parse_core_type(value: &str) -> std::result::Result<CoreType, String> {
    value.parse::<CoreType>()
}

/// Entry point of the `coreward` binary.
pub fn run() -> std::result::Result<(), String> {
    let cli = parse_args(std::env::args().skip(1))?;
    let settings = SupervisorSettings::load(&cli.data_dir);

    let level = if cli.verbose { "debug" } else { "info" };
    // flushes the log worker when the command returns
    let _log_guard = match logbook::init(
        &settings.log_dir,
        APP_LOG_NAME,
        logbook::parse_rotation(&settings.log_rotation),
        settings.log_keep,
        level,
    ) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("logging disabled: {}", e);
            None
        }
    };

    let store = Arc::new(ProfileStore::in_dir(&cli.data_dir));
    let args: Vec<&str> = cli.command.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["list"] => {
            list_profiles(&store);
            Ok(())
        }
        ["add", name, core_type, config, port] => {
            let item = ProfileItem::new(name, parse_core_type(core_type)?, config, parse_port(port)?);
            let item = store.upsert(item);
            println!("{}", item.id);
            Ok(())
        }
        ["import", name, core_type, yaml, rest @ ..] if rest.len() <= 1 => {
            let port = rest.first().map(|p| parse_port(p)).transpose()?.unwrap_or(0);
            let supervisor = CoreSupervisor::new(settings, store);
            let outcome = supervisor
                .import_clash_profile(Path::new(yaml), name, parse_core_type(core_type)?, port)
                .map_err(|e| e.to_string())?;
            if let Some(e) = &outcome.conversion_error {
                println!("conversion failed, imported as custom profile: {}", e);
            }
            print_profile(&outcome.profile, false);
            Ok(())
        }
        ["select", id] => store.set_selected(id).map_err(|e| e.to_string()),
        ["remove", id] => {
            if store.get(id).is_none() {
                return Err(format!("no profile {}", id));
            }
            store.remove(id);
            Ok(())
        }
        ["convert", src, dst, port] => {
            let conversion = convert::convert_file(Path::new(src), Path::new(dst), parse_port(port)?)
                .map_err(|e| e.to_string())?;
            for listener in &conversion.listeners {
                println!("{}\t{}\t{}", listener.name, listener.port, listener.bound_proxy_name);
            }
            Ok(())
        }
        ["run", rest @ ..] if rest.len() <= 1 => {
            let supervisor = CoreSupervisor::new(settings, store);
            let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
            runtime.block_on(run_profile(supervisor, rest.first().map(|s| s.to_string())))
        }
        _ => Err(USAGE.to_string()),
    }
}

fn list_profiles(store: &ProfileStore) {
    let config = store.load();
    for item in &config.profile_items {
        print_profile(item, item.id == config.selected_profile_id);
    }
}

fn print_profile(item: &ProfileItem, selected: bool) {
    println!(
        "{} {}  {}  {}  port {}  {}",
        if selected { "*" } else { " " },
        item.id,
        item.display_name,
        item.core_type,
        item.primary_port,
        item.config_path
    );
    for listener in &item.listeners {
        println!(
            "      {} {:?} {} -> {}",
            listener.name, listener.protocol_type, listener.port, listener.bound_proxy_name
        );
    }
}

async fn run_profile(
    supervisor: CoreSupervisor,
    id: Option<String>,
) -> std::result::Result<(), String> {
    let orphans = supervisor.cleanup_orphans();
    if orphans > 0 {
        println!("killed {} leftover engine process(es)", orphans);
    }

    let mut events = supervisor.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => println!("... {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let started = match &id {
        Some(id) => supervisor.start(id).await,
        None => supervisor.start_selected().await,
    };
    if let Err(e) = started {
        error!("Start failed: {}", e);
        printer.abort();
        return Err(e.to_string());
    }

    info!("Running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {}", e);
    }
    supervisor.stop_all().await;
    printer.abort();
    Ok(())
}

fn print_event(event: &CoreEvent) {
    match event {
        CoreEvent::Log(record) => println!("{}", record.render()),
        CoreEvent::State {
            profile_id,
            state,
            reason,
        } => match reason {
            Some(reason) => println!("[{}] {} ({})", profile_id, state, reason),
            None => println!("[{}] {}", profile_id, state),
        },
        CoreEvent::PortActive {
            profile_id,
            port,
            origin,
        } => println!("[{}] port {} active ({:?})", profile_id, port, origin),
        CoreEvent::PortTimeout { profile_id, port } => {
            println!("[{}] port {} did not come up", profile_id, port)
        }
    }
}

mod lifecycle_test_mod;
