use clap::{Args, Parser, Subcommand};
use serde_json::json;
use sshjob::commands::CommandStatus;
use sshjob::config::{self, JobFile};
use sshjob::error::AppResult;
use sshjob::files::{FileHandler, FileHandlerFactory};
use sshjob::logging::{self, JournalFilter, LogLevel};
use sshjob::state::AppState;
use std::path::PathBuf;

/// Stage files and run jobs on local or remote hosts over SSH
#[derive(Parser, Debug)]
#[command(name = "sshjob")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Configuration directory (default: the platform config dir)
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a job described by a TOML file
    Run {
        #[arg(value_name = "JOB")]
        job: PathBuf,
    },
    /// Check whether a path exists
    Exists {
        path: String,
        #[command(flatten)]
        hosts: HostArgs,
    },
    /// Copy a file or directory
    Copy(TransferArgs),
    /// Move a file or directory
    Move(TransferArgs),
    /// List files (or directories) below a directory
    Ls {
        directory: String,
        #[command(flatten)]
        hosts: HostArgs,
        /// List directories instead of files
        #[arg(long)]
        dirs: bool,
    },
    /// Show recent job journal entries
    Journal {
        /// Only entries for this command id
        #[arg(long, value_name = "ID")]
        id: Option<i64>,
        /// Only failures
        #[arg(long)]
        failures: bool,
        /// Case-insensitive text to look for in messages
        #[arg(long)]
        search: Option<String>,
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Host profile the paths refer to
    #[arg(long, value_name = "NAME")]
    host: Option<String>,

    /// Second host profile for transfers between two remote hosts
    #[arg(long, value_name = "NAME")]
    to_host: Option<String>,
}

#[derive(Args, Debug)]
struct TransferArgs {
    source: String,
    destination: String,
    #[command(flatten)]
    hosts: HostArgs,
    /// Octal permissions for a remote destination, e.g. 755
    #[arg(long, value_name = "OCTAL")]
    permissions: Option<String>,
}

fn main() {
    logging::init_tracing();
    let cli = Cli::parse();

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            if cli.json {
                println!("{}", serde_json::to_string(&e).unwrap_or_else(|_| e.to_string()));
            } else {
                eprintln!("sshjob: {}", e);
            }
            e.status().exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> AppResult<i32> {
    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => config::get_config_dir()?,
    };
    let state = AppState::new(&config_dir)?;
    let result = dispatch(cli, &state);
    state.shutdown();
    result
}

fn dispatch(cli: &Cli, state: &AppState) -> AppResult<i32> {
    match &cli.command {
        Cmd::Run { job } => {
            let job = JobFile::load(job)?;
            let mut command = state.command_for(job)?;
            let status = command.execute();
            let config = command.configuration();
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "command_id": config.command_id(),
                        "status": status,
                        "stdout": config.std_output(),
                        "stderr": config.err_output(),
                    })
                );
            } else {
                print!("{}", config.std_output());
                eprint!("{}", config.err_output());
                eprintln!("{}", status);
            }
            Ok(status.exit_code())
        }
        Cmd::Exists { path, hosts } => {
            let handler = file_handler(state, hosts)?;
            let exists = handler.exists(path)?;
            if cli.json {
                println!("{}", json!({ "path": path, "exists": exists }));
            } else {
                println!("{}", exists);
            }
            Ok(if exists { 0 } else { 1 })
        }
        Cmd::Copy(args) => transfer(cli, state, args, false),
        Cmd::Move(args) => transfer(cli, state, args, true),
        Cmd::Ls {
            directory,
            hosts,
            dirs,
        } => {
            let handler = file_handler(state, hosts)?;
            let entries = if *dirs {
                handler.list_directories(directory)?
            } else {
                handler.list_files(directory)?
            };
            if cli.json {
                println!("{}", json!(entries));
            } else {
                for entry in entries {
                    println!("{}", entry);
                }
            }
            Ok(0)
        }
        Cmd::Journal {
            id,
            failures,
            search,
            limit,
        } => {
            let Some(journal) = &state.journal else {
                eprintln!("sshjob: job journal is disabled");
                return Ok(1);
            };
            let filter = JournalFilter {
                command_id: *id,
                level: failures.then_some(LogLevel::Error),
                search: search.clone(),
                ..Default::default()
            };
            let entries = journal.recent(*limit, Some(&filter));
            if cli.json {
                println!("{}", json!(entries));
            } else {
                for entry in entries {
                    let when = chrono::DateTime::from_timestamp_millis(entry.timestamp)
                        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!(
                        "{} {:>6} {:<8} {:<10} {}",
                        when, entry.command_id, entry.stage, entry.status, entry.message
                    );
                }
            }
            Ok(0)
        }
    }
}

fn transfer(cli: &Cli, state: &AppState, args: &TransferArgs, is_move: bool) -> AppResult<i32> {
    let mut handler = file_handler(state, &args.hosts)?;
    if let Some(permissions) = &args.permissions {
        handler.set_permissions(permissions)?;
    }
    let status = if is_move {
        handler.move_file(&args.source, &args.destination)?
    } else {
        handler.copy(&args.source, &args.destination)?
    };
    report_status(cli, status);
    Ok(status.exit_code())
}

fn report_status(cli: &Cli, status: CommandStatus) {
    if cli.json {
        println!("{}", json!({ "status": status }));
    } else {
        println!("{}", status);
    }
}

fn file_handler(state: &AppState, hosts: &HostArgs) -> AppResult<FileHandler> {
    let book = state.hosts.read();
    match (hosts.host.as_deref(), hosts.to_host.as_deref()) {
        (Some(source), Some(destination)) => FileHandlerFactory::between(
            &state.connections,
            book.resolve(source)?,
            book.resolve(destination)?,
        ),
        (Some(name), None) | (None, Some(name)) => {
            FileHandlerFactory::for_configuration(&state.connections, Some(book.resolve(name)?))
        }
        (None, None) => Ok(FileHandlerFactory::local()),
    }
}

