use clap::{crate_authors, crate_version, Arg, ArgMatches, Command};
use log::{error, info, trace, warn};
use std::path::{Path, PathBuf};
use tabular::{Row, Table};

use sluice::config::{self, Configuration};
use sluice::driver::{ConnectionDescriptor, Registry};
use sluice::engine::{self, Engine, MigrationResultTuple};
use sluice::exit_code;
use sluice::migration_files;
use sluice::migrations::{MigrationFile, Version};

fn main() {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .parse_env("SLUICE_LOG")
        .init();

    trace!("starting");

    let m = cli().get_matches();
    std::process::exit(run(&m));
}

fn cli() -> Command<'static> {
    let version_arg = |name: &'static str, help: &'static str| {
        Arg::new(name)
            .long(name)
            .takes_value(true)
            .value_name("VERSION")
            .help(help)
    };

    Command::new("sluice")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .about("Applies versioned SQL migrations")
        .subcommand_required(true)
        .arg(
            Arg::new("config_file")
                .long("config")
                .short('c')
                .global(true)
                .takes_value(true)
                .value_name("CONFIG FILE")
                .help("The configuration file to use"),
        )
        .arg(
            Arg::new("directory")
                .long("directory")
                .short('d')
                .global(true)
                .takes_value(true)
                .value_name("MIGRATION DIR")
                .help("The migrations directory, overrides the configuration"),
        )
        .arg(
            Arg::new("name")
                .long("driver")
                .short('n')
                .global(true)
                .takes_value(true)
                .value_name("DRIVER NAME")
                .help("Which configured driver to use"),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .global(true)
                .takes_value(true)
                .env("SLUICE_DATABASE_URL")
                .value_name("URL")
                .help("Connect here instead of to a configured driver"),
        )
        .subcommand(Command::new("init").about("creates configuration and migrations directory"))
        .subcommand(
            Command::new("create")
                .about("creates an empty up and down migration")
                .arg(
                    Arg::new("migration_name")
                        .long("name")
                        .takes_value(true)
                        .value_name("MIGRATION NAME")
                        .required(true)
                        .help("Name of the migration"),
                ),
        )
        .subcommand(Command::new("ls").about("list all migrations and their status"))
        .subcommand(
            Command::new("up")
                .about("apply all pending migrations")
                .arg(version_arg("to", "Stop after this version")),
        )
        .subcommand(
            Command::new("down")
                .about("reverse applied migrations")
                .arg(version_arg("to", "Keep this version and everything older applied")),
        )
        .subcommand(
            Command::new("steps")
                .about("apply the next N migrations, or reverse the last N when negative")
                .arg(
                    Arg::new("n")
                        .required(true)
                        .allow_hyphen_values(true)
                        .value_name("N"),
                ),
        )
        .subcommand(
            Command::new("goto")
                .about("migrate up or down to exactly this version")
                .arg(Arg::new("version").required(true).value_name("VERSION")),
        )
        .subcommand(Command::new("redo").about("reverse and re-apply the latest migration"))
        .subcommand(Command::new("version").about("print the latest applied version"))
        .subcommand(Command::new("drivers").about("list the drivers compiled in"))
}

fn run(m: &ArgMatches) -> i32 {
    let config_path = PathBuf::from(
        m.value_of("config_file")
            .unwrap_or(config::DEFAULT_CONFIG_FILE),
    );

    match m.subcommand() {
        Some(("init", _)) => init(m, &config_path),
        Some(("drivers", _)) => {
            let mut table = Table::new("{:<}");
            table.add_row(Row::new().with_cell("Scheme"));
            for scheme in Registry::with_defaults().schemes() {
                table.add_row(Row::new().with_cell(scheme));
            }
            print!("{}", table);
            0
        }
        Some(("create", sub_m)) => {
            let config = match load_config(m, &config_path) {
                Ok(c) => c,
                Err(code) => return code,
            };
            let name = sub_m.value_of("migration_name").unwrap_or_default();
            match migration_files::create(&config.migrations_directory, name, "sql", None) {
                Ok((up, down)) => {
                    println!("Created {}", up.display());
                    println!("Created {}", down.display());
                    0
                }
                Err(e) => {
                    error!("Could not create migration {}: {}", name, e);
                    exit_code::MIGRATION_DIR_PROBLEM
                }
            }
        }
        Some((command, sub_m)) => with_engine(m, &config_path, |engine, files| match command {
            "ls" => ls(engine, files),
            "version" => engine.version().map(|v| {
                match v {
                    Some(v) => println!("{}", v),
                    None => println!("No migrations applied"),
                }
                0
            }),
            "up" => match parse_version(sub_m.value_of("to")) {
                Ok(to) => engine.up(files, to).map(|r| report(&r)),
                Err(code) => Ok(code),
            },
            "down" => match parse_version(sub_m.value_of("to")) {
                Ok(to) => engine.down(files, to).map(|r| report(&r)),
                Err(code) => Ok(code),
            },
            "steps" => match sub_m.value_of("n").unwrap_or_default().parse::<i64>() {
                Ok(n) => engine.steps(files, n).map(|r| report(&r)),
                Err(e) => {
                    error!("N must be a whole number: {}", e);
                    Ok(exit_code::DISPATCH_PROBLEM)
                }
            },
            "goto" => match parse_version(sub_m.value_of("version")) {
                Ok(Some(v)) => engine.goto(files, v).map(|r| report(&r)),
                Ok(None) => Ok(exit_code::DISPATCH_PROBLEM),
                Err(code) => Ok(code),
            },
            "redo" => engine.redo(files).map(|r| report(&r)),
            other => {
                warn!("unknown command {}", other);
                Ok(0)
            }
        }),
        None => 0,
    }
}

fn init(m: &ArgMatches, config_path: &Path) -> i32 {
    let migrations_dir = m
        .value_of("directory")
        .unwrap_or(config::DEFAULT_MIGRATIONS_DIR);

    if !config_path.is_file() {
        match config::default_config_to_file(config_path) {
            Ok(_) => println!("Created config at {}", config_path.display()),
            Err(e) => {
                error!(
                    "Could not create config at {}: {}",
                    config_path.display(),
                    e
                );
                return exit_code::CONFIG_PROBLEM;
            }
        }
    } else {
        println!("The config file already exists.")
    }

    let dir = Path::new(migrations_dir);
    if dir.is_dir() {
        println!("Migrations directory already exists");
        return 0;
    }
    if let Err(e) = std::fs::create_dir_all(dir) {
        error!(
            "Could not create migrations directory at {}: {}",
            migrations_dir, e
        );
        return exit_code::MIGRATION_DIR_PROBLEM;
    }
    println!("Created migrations directory at {}", migrations_dir);

    let readme = format!(
        "# Migrations

Each change is a pair of files, `<version>_<name>.up.sql` and
`<version>_<name>.down.sql`. Versions are applied in numeric order.

```sh
# Getting the current state
sluice -c {} -d {} ls
# Writing a new migration
sluice -c {} -d {} create --name add_users
# See all commands
sluice --help
```
",
        config_path.display(),
        migrations_dir,
        config_path.display(),
        migrations_dir
    );
    match std::fs::write(dir.join("README.md"), readme) {
        Ok(_) => {
            println!(
                "For next steps see the README in {}/README.md",
                migrations_dir
            );
            0
        }
        Err(e) => {
            error!(
                "Could not create README in migrations directory at {}/README.md: {}",
                migrations_dir, e
            );
            exit_code::MIGRATION_DIR_PROBLEM
        }
    }
}

// A missing config file is fine when a URL was given.
fn load_config(m: &ArgMatches, config_path: &Path) -> Result<Configuration, i32> {
    let mut config = match Configuration::from_file(config_path) {
        Ok(c) => c,
        Err(config::ConfigError::Io(e)) if m.value_of("url").is_some() => {
            info!(
                "not reading {} ({}), using defaults",
                config_path.display(),
                e
            );
            Configuration::default()
        }
        Err(e) => {
            error!(
                "Problem reading configuration file {}: {}",
                config_path.display(),
                e
            );
            return Err(exit_code::CONFIG_PROBLEM);
        }
    };
    if let Some(dir) = m.value_of("directory") {
        config.migrations_directory = PathBuf::from(dir);
    }
    Ok(config)
}

fn with_engine<F>(m: &ArgMatches, config_path: &Path, f: F) -> i32
where
    F: FnOnce(&mut Engine, &[MigrationFile]) -> Result<i32, engine::Error>,
{
    let config = match load_config(m, config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let target = match m.value_of("url") {
        Some(url) => ConnectionDescriptor::new(url),
        None => {
            let name = m.value_of("name").unwrap_or(config::DEFAULT_DRIVER_NAME);
            match config.descriptor(name) {
                Ok(d) => d,
                Err(e) => {
                    error!("{} (configured: {:?})", e, config.names());
                    return exit_code::CONFIG_PROBLEM;
                }
            }
        }
    };

    let mut engine = match Engine::connect(&Registry::with_defaults(), &target) {
        Ok(e) => e,
        Err(e) => {
            error!("Could not open {}: {}", target, e);
            return exit_code::CONNECTION_PROBLEM;
        }
    };

    let files = match migration_files::from_disk(
        &config.migrations_directory,
        engine.filename_extension(),
    ) {
        Ok(files) => files,
        Err(e) => {
            error!("{}", e);
            return exit_code::MIGRATION_DIR_PROBLEM;
        }
    };

    let code = match f(&mut engine, &files) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            match e {
                engine::Error::Driver(_) => exit_code::CONNECTION_PROBLEM,
                _ => exit_code::DISPATCH_PROBLEM,
            }
        }
    };
    if let Err(e) = engine.close() {
        warn!("closing {} failed: {}", target, e);
    }
    code
}

fn parse_version(v: Option<&str>) -> Result<Option<Version>, i32> {
    match v.map(str::parse::<Version>) {
        None => Ok(None),
        Some(Ok(v)) => Ok(Some(v)),
        Some(Err(e)) => {
            error!("{}", e);
            Err(exit_code::DISPATCH_PROBLEM)
        }
    }
}

fn ls(engine: &mut Engine, files: &[MigrationFile]) -> Result<i32, engine::Error> {
    let mut table = Table::new("{:<} {:>} {:<} {:<}");
    table.add_row(
        Row::new()
            .with_cell("Status")
            .with_cell("Version")
            .with_cell("Name")
            .with_cell("Filename"),
    );
    for (state, f) in engine.diff(files)? {
        table.add_row(
            Row::new()
                .with_cell(state)
                .with_cell(f.version)
                .with_cell(&f.name)
                .with_cell(f.path.display()),
        );
    }
    print!("{}", table);
    Ok(0)
}

fn report(results: &[MigrationResultTuple]) -> i32 {
    if results.is_empty() {
        println!("Nothing to do");
        return 0;
    }
    let mut table = Table::new("{:>}  {:<}  {:<}");
    for (result, f) in results {
        table.add_row(
            Row::new()
                .with_cell(f.version)
                .with_cell(&f.file_name)
                .with_cell(result),
        );
    }
    print!("{}", table);
    if results.iter().all(|(r, _)| r.is_success()) {
        0
    } else {
        exit_code::MIGRATION_FAILED
    }
}
