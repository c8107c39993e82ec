use calccore::config::ClientConfig;
use clap::{App, Arg};
use conduit::{ClientEvent, TcpClient};
use photon::codec;
use photon::login::LoginData;
use photon::logging;
use photon::request::{EquationType, Request};
use photon::settings::ConnectionSettings;
use std::fmt::Display;
use std::io::{self, BufRead};
use std::net::IpAddr;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let matches = App::new("Compute Client")
        .version("1.0")
        .about("Connects to the compute server and submits tasks.")
        .arg(
            Arg::with_name("USERNAME")
                .help("Login username")
                .required(true),
        )
        .arg(
            Arg::with_name("PASSWORD")
                .help("Login password")
                .required(true),
        )
        .arg(
            Arg::with_name("HOST")
                .long("host")
                .takes_value(true)
                .help("Server address"),
        )
        .arg(
            Arg::with_name("PORT")
                .long("port")
                .takes_value(true)
                .help("Server port"),
        )
        .arg(
            Arg::with_name("CONFIG")
                .long("config")
                .takes_value(true)
                .help("Path to the config file"),
        )
        .get_matches();

    let mut config = match matches.value_of("CONFIG") {
        Some(path) => ClientConfig::load(path),
        None => ClientConfig::default(),
    };
    if let Some(host) = matches.value_of("HOST") {
        config.net.destination = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                eprintln!("invalid server address");
                process::exit(1);
            }
        };
    }
    if let Some(port) = matches.value_of("PORT") {
        config.net.port = match port.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("invalid server port");
                process::exit(1);
            }
        };
    }

    let log = logging::from_config(&config.log).expect("Error building logger");

    let (mut client, events) = TcpClient::new(log);
    client.set_login_data(LoginData::new(
        matches.value_of("USERNAME").unwrap(),
        matches.value_of("PASSWORD").unwrap(),
    ));
    client.set_reconnect(config.net.reconnect);
    client.set_wait_times(
        Duration::from_millis(config.net.reconnect_interval_ms),
        Duration::from_millis(config.net.wait_for_connected_ms),
    );

    let settings = ConnectionSettings::connect(config.net.destination, config.net.port);
    if client.open(&settings).is_err() {
        process::exit(1);
    }

    // Events render on their own thread so the prompt stays responsive.
    let renderer = thread::spawn(move || {
        for event in events.iter() {
            render_event(event);
        }
    });

    print_help();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if !handle_command(line.trim(), &client) {
            break;
        }
    }

    client.close();
    let _ = renderer.join();
}

fn print_help() {
    println!("commands:");
    println!("  sort <n> <n> ...                         sort an array of integers");
    println!("  primes <from> <to>                       primes within the range");
    println!("  calc linear <a> <b> <from> <to> <step>   tabulate a*x + b");
    println!("  calc quad <a> <b> <c> <from> <to> <step> tabulate a*x^2 + b*x + c");
    println!("  cancel                                   cancel the running task");
    println!("  status                                   connection state");
    println!("  quit");
}

/// Parses one command line and submits the matching request. Input errors
/// are reported locally without contacting the server. Returns false on
/// quit.
fn handle_command(line: &str, client: &TcpClient) -> bool {
    let mut words = line.split_whitespace();
    let command = match words.next() {
        Some(command) => command,
        None => return true,
    };
    let args: Vec<&str> = words.collect();

    match command {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "status" => println!("[state] {:?}", client.state()),
        "cancel" => submit(client, &Request::CancelTask),
        "sort" => match parse_numbers(&args) {
            Ok(numbers) if !numbers.is_empty() => {
                submit(client, &Request::SortArray { numbers })
            }
            _ => println!("[input] sort needs a list of integers"),
        },
        "primes" => match parse_numbers(&args) {
            Ok(ref bounds) if bounds.len() == 2 => {
                let (x_from, x_to) = (bounds[0], bounds[1]);
                if x_from > x_to {
                    println!("[input] from must not exceed to");
                } else {
                    submit(
                        client,
                        &Request::FindPrimes {
                            x_from,
                            x_to,
                            primes: Vec::new(),
                        },
                    );
                }
            }
            _ => println!("[input] primes needs: <from> <to>"),
        },
        "calc" => handle_calc(&args, client),
        _ => println!("[input] unknown command, try 'help'"),
    }
    true
}

fn handle_calc(args: &[&str], client: &TcpClient) {
    let (equation, params) = match args.split_first() {
        Some((&"linear", rest)) => (EquationType::Linear, rest),
        Some((&"quad", rest)) | Some((&"quadratic", rest)) => (EquationType::Quadratic, rest),
        _ => {
            println!("[input] calc needs: linear|quad ...");
            return;
        }
    };

    let expected = match equation {
        EquationType::Linear => 5,
        EquationType::Quadratic => 6,
    };
    let numbers = match parse_numbers(params) {
        Ok(numbers) if numbers.len() == expected => numbers,
        _ => {
            println!(
                "[input] calc {} needs {} integer arguments",
                equation, expected
            );
            return;
        }
    };

    let (a, b, c, rest) = match equation {
        EquationType::Linear => (numbers[0], numbers[1], 0, &numbers[2..]),
        EquationType::Quadratic => (numbers[0], numbers[1], numbers[2], &numbers[3..]),
    };
    let (x_from, x_to, x_step) = (rest[0], rest[1], rest[2]);

    if x_step < 1 {
        println!("[input] step must be at least 1");
        return;
    }
    if x_from > x_to {
        println!("[input] from must not exceed to");
        return;
    }

    submit(
        client,
        &Request::CalcFunction {
            equation,
            x_from,
            x_to,
            x_step,
            a,
            b,
            c,
            points: Vec::new(),
        },
    );
}

fn parse_numbers(args: &[&str]) -> Result<Vec<i32>, ()> {
    args.iter().map(|arg| arg.parse().map_err(|_| ())).collect()
}

fn submit(client: &TcpClient, request: &Request) {
    if !client.is_connected() {
        println!("[error] not connected");
        return;
    }
    if let Err(err) = client.send(&codec::encode(request)) {
        println!("[error] send failed: {:?}", err);
    }
}

fn render_event(event: ClientEvent) {
    match event {
        ClientEvent::StateChanged(state) => println!("[state] {:?}", state),
        ClientEvent::Connected => println!("[net] connected"),
        ClientEvent::Disconnected => println!("[net] disconnected"),
        ClientEvent::Opened(false) => println!("[net] connect attempt failed"),
        ClientEvent::Opened(true) => {}
        ClientEvent::WrotePartial { .. } => {}
        ClientEvent::Error { kind, detail } => println!("[error] {:?} {}", kind, detail),
        ClientEvent::Message { payload } => match codec::decode(&payload) {
            Ok(request) => render_request(request),
            Err(err) => println!("[error] undecodable frame from server: {:?}", err),
        },
    }
}

fn render_request(request: Request) {
    match request {
        Request::ProgressRange { minimum, maximum } => {
            println!("[progress] range {}..{}", minimum, maximum)
        }
        Request::ProgressValue { value } => println!("[progress] {}", value),
        Request::CancelTask => println!("[task] cancelled"),
        Request::Invalid { code, text } => println!("[server error] {:?}: {}", code, text),
        Request::SortArray { numbers } => {
            println!("[result] sorted {} numbers: {}", numbers.len(), preview(&numbers))
        }
        Request::FindPrimes { x_from, x_to, primes } => println!(
            "[result] {} primes in [{}, {}]: {}",
            primes.len(),
            x_from,
            x_to,
            preview(&primes)
        ),
        Request::CalcFunction { equation, points, .. } => {
            let rendered: Vec<String> = points
                .iter()
                .take(20)
                .map(|point| format!("({}, {})", point.x, point.y))
                .collect();
            println!(
                "[result] {} {} points: {}{}",
                points.len(),
                equation,
                rendered.join(", "),
                if points.len() > 20 { ", ..." } else { "" }
            );
        }
    }
}

fn preview<T: Display>(values: &[T]) -> String {
    let rendered: Vec<String> = values.iter().take(20).map(|value| value.to_string()).collect();
    if values.len() > 20 {
        format!("{}, ...", rendered.join(", "))
    } else {
        rendered.join(", ")
    }
}
