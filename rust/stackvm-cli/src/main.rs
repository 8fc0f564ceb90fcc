//! StackVM CLI — run and inspect stack-machine programs.

use clap::{Parser as ClapParser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use stackvm::{ExitCode, Machine, Program, VmError};
use stackvm_cli::colors::{bold, gray, green, red, status_label, yellow};
use stackvm_cli::config::StackvmConfig;
use stackvm_cli::inspect;

#[derive(ClapParser)]
#[command(name = "stackvm", version, about = "Run stack-machine bytecode programs")]
struct Cli {
    /// Configuration file (default: nearest stackvm.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program from its JSON listing
    Run {
        /// Path to the program JSON
        #[arg()]
        file: PathBuf,

        /// Dump machine state before every instruction
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show the effective resource limits
    Config {
        /// Print a default stackvm.toml instead
        #[arg(long)]
        template: bool,
    },
    /// List decoded functions and jump blocks
    Inspect {
        /// Path to the program JSON
        #[arg()]
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    match cli.command {
        Commands::Run { file, verbose } => {
            let verbose = verbose || config.run.verbose;
            init_tracing(config.run.log.as_deref(), verbose);
            cmd_run(&file, &config, verbose)
        }
        Commands::Config { template } => cmd_config(&config, cli.config.as_deref(), template),
        Commands::Inspect { file } => cmd_inspect(&file),
    }
}

fn init_tracing(configured: Option<&str>, verbose: bool) {
    let fallback = configured.unwrap_or(if verbose { "debug" } else { "warn" });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_with(code: ExitCode) -> ! {
    std::process::exit(code.code())
}

fn load_config(path: Option<&Path>) -> StackvmConfig {
    let loaded = match path {
        Some(path) => StackvmConfig::load_from(path),
        None => StackvmConfig::load(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("{} {}", red("error:"), e);
        exit_with(ExitCode::FileErr);
    })
}

fn read_program(path: &Path) -> Program {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!(
            "{} cannot read file '{}': {}",
            red("error:"),
            bold(&path.display().to_string()),
            e
        );
        exit_with(ExitCode::FileErr);
    });
    Program::from_json(&text).unwrap_or_else(|e| {
        eprintln!(
            "{} invalid program in '{}': {}",
            red("error:"),
            bold(&path.display().to_string()),
            e
        );
        exit_with(ExitCode::FileErr);
    })
}

fn report(err: &VmError) -> ! {
    let code = err.exit_code();
    eprintln!("{} {}", red("error:"), err);
    eprintln!("{} {} ({})", gray("exit:"), code, code.code());
    exit_with(code);
}

/// Step until finished, dumping state before each step.
fn run_traced(vm: &mut Machine) -> Result<(), VmError> {
    while !vm.is_finished() {
        eprint!("{}", gray(&vm.dump_state()));
        if let Err(err) = vm.step() {
            let frames = vm.capture_stack_trace();
            return Err(err.with_stack_trace(frames));
        }
    }
    eprint!("{}", gray(&vm.dump_state()));
    Ok(())
}

fn cmd_run(file: &Path, config: &StackvmConfig, verbose: bool) {
    let program = read_program(file);
    let limits = config.limits.clone().validated().unwrap_or_else(|e| {
        eprintln!("{} invalid configuration: {}", red("error:"), e);
        exit_with(ExitCode::VmErr);
    });

    let mut vm = Machine::new(&program, &limits).unwrap_or_else(|e| report(&e));
    let outcome = if verbose {
        run_traced(&mut vm)
    } else {
        vm.run()
    };
    if let Err(e) = outcome {
        report(&e);
    }
    if verbose {
        eprintln!("{} {} steps", status_label("Finished"), vm.steps());
    }
    if let Some(result) = vm.result() {
        tracing::debug!(result = %result, "entry point returned");
    }
}

fn cmd_config(config: &StackvmConfig, explicit: Option<&Path>, template: bool) {
    if template {
        print!("{}", StackvmConfig::default_template());
        return;
    }
    match explicit.map(Path::to_path_buf).or_else(StackvmConfig::discover) {
        Some(path) => println!("{} {}", gray("config:"), path.display()),
        None => println!("{} {}", gray("config:"), gray("defaults")),
    }
    print!("{}", config.limits);
    let problems = config.problems();
    if problems.is_empty() {
        println!("{} limits are valid", green("✓"));
        return;
    }
    for problem in &problems {
        eprintln!("{} {}", yellow("warning:"), problem);
    }
    exit_with(ExitCode::VmErr);
}

fn cmd_inspect(file: &Path) {
    let program = read_program(file);
    print!("{}", inspect::describe(&program));
    let broken = inspect::undecodable(&program);
    if !broken.is_empty() {
        eprintln!(
            "{} undecodable instructions in {}",
            red("error:"),
            broken.join(", ")
        );
        exit_with(ExitCode::UnknownBytecode);
    }
}
