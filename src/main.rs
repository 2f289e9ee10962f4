//! Mitmock CLI

use std::path::Path;
use std::process;

use mitmock::config::InjectionConfig;
use mitmock::message::Fixture;
use mitmock::mock::RequestDescription;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        usage();
        process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "trim" | "check" => {
            if args.len() < 3 {
                eprintln!("Usage: mitmock {command} <fixture.json>");
                process::exit(1);
            }

            let path = Path::new(&args[2]);
            let result = if command == "trim" {
                trim(path)
            } else {
                check(path)
            };
            if let Err(e) = result {
                error!("{}: {}", path.display(), e);
                process::exit(1);
            }
        }
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'mitmock' for usage information.");
            process::exit(1);
        }
    }
}

fn usage() {
    eprintln!("Mitmock v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: mitmock <command> <fixture.json>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  trim     Re-canonicalize a fixture and print it");
    eprintln!("  check    Report how many request descriptions a fixture yields");
}

fn load(path: &Path) -> mitmock::Result<Fixture> {
    let text = std::fs::read_to_string(path)?;
    Fixture::parse(&text)
}

fn trim(path: &Path) -> mitmock::Result<()> {
    let fixture = load(path)?.trim();
    println!(
        "{}",
        fixture.to_pretty_json(InjectionConfig::default().indent_width)?
    );
    Ok(())
}

fn check(path: &Path) -> mitmock::Result<()> {
    let descriptions = RequestDescription::from_fixture(load(path)?);
    for description in &descriptions {
        description.validate()?;
    }
    info!("{}: {} request description(s)", path.display(), descriptions.len());
    println!("{}", descriptions.len());
    Ok(())
}
