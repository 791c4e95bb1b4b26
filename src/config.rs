//! Server configuration.
//!
//! The storage core does not read any of this; the values are parsed
//! here and handed to the connection layer.

use std::time::Duration;

/// Settings consumed by the server loop.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind, as `host:port`.
    pub address: String,
    /// Maximum number of concurrently served clients.
    pub max_conn: usize,
    /// Per-connection idle timeout.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            max_conn: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Parses configuration from the process arguments.
    pub fn from_args() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::parse(&args)
    }

    /// Parses configuration from an argument list.
    fn parse(args: &[String]) -> Self {
        let mut config = Config::default();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--address" | "-a" => {
                    config.address = Self::value_of(args, i, "--address").to_string();
                    i += 2;
                }
                "--max-conn" => {
                    config.max_conn = Self::value_of(args, i, "--max-conn")
                        .parse()
                        .unwrap_or_else(|_| {
                            eprintln!("Error: invalid --max-conn value");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--timeout" => {
                    let secs: u64 = Self::value_of(args, i, "--timeout")
                        .parse()
                        .unwrap_or_else(|_| {
                            eprintln!("Error: invalid --timeout value");
                            std::process::exit(1);
                        });
                    config.timeout = Duration::from_secs(secs);
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("corekv version {}", crate::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
        match args.get(i + 1) {
            Some(value) => value,
            None => {
                eprintln!("Error: {flag} requires a value");
                std::process::exit(1);
            }
        }
    }
}

fn print_help() {
    println!(
        r#"
corekv - concurrent storage core and RESP server

USAGE:
    corekv [OPTIONS]

OPTIONS:
    -a, --address <HOST:PORT>   Address to bind (default: 127.0.0.1:6379)
        --max-conn <N>          Maximum concurrent clients (default: 1024)
        --timeout <SECONDS>     Per-connection idle timeout (default: 60)
    -v, --version               Print version information
        --help                  Print this help message
"#
    );
}
