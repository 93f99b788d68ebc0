use std::path::PathBuf;

use anyhow::Context;

pub(crate) struct Args {
    pub config_path: PathBuf,
    pub relay_url: Option<String>,
    pub name: Option<String>,
    pub auto_join: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    parse_from(std::env::args().collect())
}

fn parse_from(args: Vec<String>) -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("./config/duet.toml");
    let mut relay_url = None;
    let mut name = None;
    let mut auto_join = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("duet {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("duet - paired video chat client");
                println!();
                println!("USAGE:");
                println!("    duet [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <PATH>          Config file [default: ./config/duet.toml]");
                println!("    --relay-url <URL>            Matchmaking relay WebSocket URL");
                println!("    --name <NAME>                Guest display name [default: random]");
                println!("    --auto-join                  Join the queue as soon as identified");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                println!();
                println!("COMMANDS (stdin):");
                println!("    open, join, leave, next, forget, reset, quit");
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--relay-url" => {
                i += 1;
                relay_url = Some(args.get(i).context("Missing --relay-url value")?.clone());
            }
            "--name" => {
                i += 1;
                let value = args.get(i).context("Missing --name value")?;
                anyhow::ensure!(!value.trim().is_empty(), "--name must not be empty");
                name = Some(value.clone());
            }
            "--auto-join" => auto_join = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        relay_url,
        name,
        auto_join,
    })
}
