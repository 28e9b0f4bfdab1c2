use std::path::Path;

use solar_audit::adapters::directory_db::{
    count_customers, open_connection, run_migrations, schema_version,
};

const DEFAULT_PATH: &str = "./data/directory.db";

struct Options {
    path: String,
    force: bool,
}

fn main() {
    match parse_args(std::env::args().skip(1).collect()) {
        Ok(Some(options)) => {
            if let Err(error) = create(&options) {
                eprintln!("failed to prepare directory db: {error}");
                std::process::exit(1);
            }
        }
        Ok(None) => print_help(),
        Err(error) => {
            eprintln!("{error}");
            print_help();
            std::process::exit(2);
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<Option<Options>, String> {
    let mut options = Options {
        path: DEFAULT_PATH.to_string(),
        force: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" => {
                options.path = args
                    .next()
                    .ok_or_else(|| "--path requires a value".to_string())?;
            }
            "--force" => options.force = true,
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Some(options))
}

fn create(options: &Options) -> Result<(), String> {
    let path = Path::new(&options.path);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if options.force && path.exists() {
        std::fs::remove_file(path)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&options.path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;
    let version = schema_version(&connection).map_err(|error| error.to_string())?;
    let customers = count_customers(&connection).map_err(|error| error.to_string())?;

    println!("directory db ready at: {}", options.path);
    println!("schema version: {version}");
    println!("linked customers: {customers}");
    Ok(())
}

fn print_help() {
    println!("create_directory_db");
    println!();
    println!("Usage:");
    println!("  create_directory_db [--path <file>] [--force]");
    println!();
    println!("Options:");
    println!("  --path <file>   target sqlite file (default: {DEFAULT_PATH})");
    println!("  --force         delete existing file before creating");
}
