use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Arg, ArgAction, ArgMatches, Command};
use eyre::{WrapErr, bail, eyre};
use sshtun::{
    ClientConfig, ControlServer, Launcher, OrchestrationPlan, Orchestrator, ProcessLauncher,
    ServiceConfig, SessionLauncher, SshConnector, TunnelRegistry, TunnelStyle, ssh::SshCommand,
};
use tokio::{signal, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let matches = Command::new("sshtun")
        .version(env!("CARGO_PKG_VERSION"))
        .author("akagi201")
        .about("Ephemeral SSH tunnels to firewalled endpoints")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase logging verbosity"),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the HTTP control daemon")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Service configuration file"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16))
                        .help("HTTP listen port (default: 5600)"),
                )
                .arg(
                    Arg::new("bind")
                        .short('b')
                        .long("bind")
                        .value_name("ADDR")
                        .help("HTTP listen address (default: 0.0.0.0)"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Start the configured tunnels until Enter or Ctrl+C")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Client configuration file path")
                        .required(true),
                )
                .arg(
                    Arg::new("process")
                        .long("process")
                        .action(ArgAction::SetTrue)
                        .help("Carry each tunnel in an external ssh process"),
                ),
        )
        .get_matches();

    sshtun::init_logging(matches.get_count("verbose"))?;

    match matches.subcommand() {
        Some(("serve", args)) => serve(args).await,
        Some(("run", args)) => run(args).await,
        _ => Err(eyre!("unknown subcommand")),
    }
}

async fn serve(args: &ArgMatches) -> eyre::Result<()> {
    let mut config = ServiceConfig::load(args.get_one::<String>("config").map(Path::new))?;
    if let Some(port) = args.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(bind) = args.get_one::<String>("bind") {
        config.bind_address = bind.clone();
    }

    let connector = Arc::new(SshConnector::new(config.connect_timeout()));
    let registry = Arc::new(TunnelRegistry::new(connector));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                trigger.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    info!("Starting tunnel service. Press Ctrl+C to stop.");
    ControlServer::new(config, registry).run(shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}

async fn run(args: &ArgMatches) -> eyre::Result<()> {
    let config_path = args
        .get_one::<String>("config")
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("config argument is required"))?;

    let mut config = ClientConfig::from_file(&config_path)
        .wrap_err_with(|| format!("loading {}", config_path.display()))?;
    if args.get_flag("process") {
        config.style = TunnelStyle::Process;
    }

    info!("Loaded configuration from {}", config_path.display());
    info!("Style: {:?}", config.style);

    let specs = config.specs()?;
    if specs.is_empty() {
        println!("No tunnels to start: every configured tunnel has expired.");
        return Ok(());
    }

    for spec in &specs {
        println!(
            "Local: localhost:{} -> Remote: {} via {}",
            spec.local_port,
            spec.target(),
            spec.endpoint
        );
        if let Ok(command) = SshCommand::for_spec(config.ssh_binary.as_str(), spec) {
            debug!("Run manually if needed: {}", command.command_string());
        }
    }

    let launcher: Arc<dyn Launcher> = match config.style {
        TunnelStyle::InProcess => Arc::new(SessionLauncher::new(Arc::new(SshConnector::new(
            config.connect_timeout(),
        )))),
        TunnelStyle::Process => Arc::new(ProcessLauncher::new(
            config.ssh_binary.clone(),
            config.stop_grace(),
        )),
    };
    let orchestrator = Orchestrator::new(launcher);

    let stop = CancellationToken::new();
    tokio::spawn(stop_on_user_request(stop.clone()));
    println!("Press Enter or Ctrl+C to stop.");

    if let [spec] = specs.as_slice() {
        let outcome = orchestrator
            .run_single(spec, &config.retry_policy(), stop)
            .await?;
        println!("Tunnel {} {}", spec.id, outcome);
        return Ok(());
    }

    let plan = OrchestrationPlan::from_specs(specs);
    let running = orchestrator.start_all(&plan).await?;
    println!("All {} tunnels active.", running.len());

    let summary = running.run_until(stop).await;
    println!("Tunnel summary:\n{summary}");

    let failed = summary.failures().count();
    if failed > 0 {
        bail!("{} tunnel(s) exited with an error", failed);
    }
    Ok(())
}

/// Cancel `stop` on Enter or Ctrl+C
async fn stop_on_user_request(stop: CancellationToken) {
    let enter = async {
        // Closed stdin never fires; Ctrl+C still works
        if enter_pressed().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = enter => info!("Enter pressed, stopping tunnels..."),
        _ = ctrl_c => info!("Received Ctrl+C, stopping tunnels..."),
    }
    stop.cancel();
}

/// Resolves when a line is read from stdin; errors when stdin closes first
fn enter_pressed() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    // A plain thread, so a pending read never holds up runtime shutdown
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            let _ = tx.send(());
        }
    });
    rx
}
