use std::path::Path;

use charging_fleet::adapters::db;

const FALLBACK_PATH: &str = "./data/billing.db";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Init(InitOptions),
    Help,
}

#[derive(Debug, PartialEq, Eq)]
struct InitOptions {
    path: String,
    clear: bool,
    confirmed: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct InitReport {
    schema_version: u32,
    transactions: u64,
    cleared: usize,
}

fn main() {
    // A missing .env file is normal; DB_PATH may come from the environment.
    let _ = dotenvy::dotenv();
    let default_path = std::env::var("DB_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| FALLBACK_PATH.to_string());

    let outcome = parse_args(std::env::args().skip(1), default_path).and_then(|command| {
        match command {
            Command::Help => {
                print_help();
                Ok(())
            }
            Command::Init(options) => initialize(&options).map(|report| {
                println!("billing db ready at: {}", options.path);
                println!("schema version: {}", report.schema_version);
                if report.cleared > 0 {
                    println!("cleared transactions: {}", report.cleared);
                }
                println!("recorded transactions: {}", report.transactions);
            }),
        }
    });

    if let Err(error) = outcome {
        eprintln!("init_billing_db: {error}");
        std::process::exit(1);
    }
}

fn parse_args(
    args: impl IntoIterator<Item = String>,
    default_path: String,
) -> Result<Command, String> {
    let mut options = InitOptions {
        path: default_path,
        clear: false,
        confirmed: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" => {
                options.path = args
                    .next()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or("--path requires a value")?;
            }
            "--force" => options.clear = true,
            "--yes" | "-y" => options.confirmed = true,
            "--help" | "-h" => return Ok(Command::Help),
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Command::Init(options))
}

/// Creates or migrates the ledger. `--force` empties it, but only after
/// `--yes` when it already holds billed transactions.
fn initialize(options: &InitOptions) -> Result<InitReport, String> {
    if let Some(parent) = Path::new(&options.path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    let mut connection = db::open_connection(&options.path).map_err(|error| error.to_string())?;
    db::run_migrations(&mut connection).map_err(|error| error.to_string())?;

    let existing = db::count_transactions(&connection).map_err(|error| error.to_string())?;
    let cleared = if options.clear {
        if existing > 0 && !options.confirmed {
            return Err(format!(
                "{} holds {existing} recorded transactions; rerun with --force --yes to delete them",
                options.path
            ));
        }
        db::clear_transactions(&connection).map_err(|error| error.to_string())?
    } else {
        0
    };

    Ok(InitReport {
        schema_version: db::schema_version(&connection).map_err(|error| error.to_string())?,
        transactions: db::count_transactions(&connection).map_err(|error| error.to_string())?,
        cleared,
    })
}

fn print_help() {
    println!("init_billing_db");
    println!();
    println!("Usage:");
    println!("  init_billing_db [--path <file>] [--force [--yes]]");
    println!();
    println!("Options:");
    println!("  --path <file>   ledger file (default: $DB_PATH, else {FALLBACK_PATH})");
    println!("  --force         delete recorded transactions, keeping the schema");
    println!("  --yes, -y       confirm --force when the ledger is not empty");
}
