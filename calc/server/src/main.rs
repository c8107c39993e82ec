use calccore::config::ServerConfig;
use calccore::server::ComputeServer;
use clap::{App, Arg};
use photon::logging;
use photon::settings::ConnectionSettings;
use std::net::IpAddr;
use std::process;

fn main() {
    let matches = App::new("Compute Server")
        .version("1.0")
        .about("Runs the compute server.")
        .arg(
            Arg::with_name("HOST")
                .help("Server listen address")
                .required(true),
        )
        .arg(
            Arg::with_name("PORT")
                .help("Server listen port")
                .required(true),
        )
        .arg(
            Arg::with_name("CONFIG")
                .long("config")
                .takes_value(true)
                .help("Path to the config file"),
        )
        .get_matches();

    let host: IpAddr = match matches.value_of("HOST").unwrap().parse() {
        Ok(ip) => ip,
        Err(_) => {
            eprintln!("invalid listen address");
            process::exit(1);
        }
    };
    let port: u16 = match matches.value_of("PORT").unwrap().parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid listen port");
            process::exit(1);
        }
    };

    let config = match matches.value_of("CONFIG") {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::default(),
    };
    let log = logging::from_config(&config.log).expect("Error building logger");

    let mut server = ComputeServer::new(&config, log.clone());
    if server.open(&ConnectionSettings::listen(host, port)).is_err() {
        // The endpoint already logged the bind failure.
        process::exit(1);
    }

    logging::info!(log, "compute server running"; "host" => %host, "port" => port);
    server.run();
}
