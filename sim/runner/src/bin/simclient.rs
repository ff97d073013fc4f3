use clap::{Arg, ArgAction, Command};
use quark::logging::{self, Severity};
use simcore::app::ArenaClient;
use simcore::config::SimConfig;
use simcore::pawn::Pawn;
use std::thread;
use std::time::Duration;
use tachyon::prelude::*;

fn main() {
    let matches = Command::new("simclient")
        .about("Tachyon demo arena client")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .value_name("HOST")
                .help("Override the server host"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .value_name("NAME")
                .help("Display name"),
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

    let client_config = ClientConfig {
        server: matches
            .get_one::<String>("server")
            .cloned()
            .unwrap_or(config.client.server),
        port: config.client.port,
        frames_per_second: config.client.fps,
        user_name: matches
            .get_one::<String>("user")
            .cloned()
            .unwrap_or(config.client.user),
        ..ClientConfig::default()
    };
    let prediction = client_config.prediction;

    logging::info!(log, "connecting";
                   "server" => &client_config.server,
                   "port" => client_config.port);

    // The id range the pawn claims only has to differ between clients; any
    // random tag will do.
    let range_tag: u16 = rand::random();
    let mut client = Client::connect(client_config, ArenaClient::new(range_tag), Some(&log));

    // Wait out the handshake.
    while client.connection_state() == ConnectionState::Connecting {
        thread::sleep(Duration::from_millis(50));
    }

    match client.connection_state() {
        ConnectionState::Connected => {
            logging::info!(log, "connected"; "attempts" => client.connect_attempts());
        }
        state => {
            logging::error!(log, "connection failed"; "state" => ?state);
            std::process::exit(1);
        }
    }

    client.submit_chat(0, "/ping");

    let clock = quark::time::Clock::new();
    while client.is_connected() {
        thread::sleep(Duration::from_secs(1));

        let now = clock.ticks();
        let drone = client.with_tree(|tree| {
            let (position_id, _, _) = Pawn::member_node_ids(100);
            tree.sample_vec3(position_id, now, &prediction)
        });

        if let Some(position) = drone {
            logging::info!(log, "drone";
                           "x" => position.x,
                           "y" => position.y,
                           "z" => position.z,
                           "network_good" => client.is_network_good());
        }

        for entry in client.roster() {
            logging::debug!(log, "roster";
                            "id" => entry.id,
                            "user" => &entry.user_name,
                            "self" => entry.is_self);
        }
    }

    logging::info!(log, "connection lost, shutting down");
    client.disconnect_and_wait();
}
