use clap::{Arg, ArgAction, Command};
use quark::logging::{self, Severity};
use simcore::app::ArenaServer;
use simcore::config::SimConfig;
use tachyon::prelude::*;

fn main() {
    let matches = Command::new("simserver")
        .about("Tachyon demo arena server")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Override the listen port"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let log = logging::terminal(if matches.get_flag("verbose") {
        Severity::Trace
    } else {
        Severity::Info
    });

    let config = match matches.get_one::<String>("config") {
        Some(path) => SimConfig::load(path),
        None => SimConfig::default(),
    };

    let port = matches
        .get_one::<String>("port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.server.port);

    let server_config = ServerConfig {
        port,
        frames_per_second: config.server.fps,
        ..ServerConfig::default()
    };

    logging::info!(log, "starting arena server"; "port" => port, "fps" => config.server.fps);

    let mut server = match Server::bind(server_config, ArenaServer::new(), Some(&log)) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "bind failed"; "error" => ?err);
            std::process::exit(1);
        }
    };

    drop(server.start_logging());
    server.run();
}
