pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use ipcoder_core::config::{CoderConfig, LogFormat};
use ipcoder_core::hybrid::MergePolicy;

use crate::commands::code::CodeOptions;
use crate::commands::GlobalOptions;

#[derive(Debug, Parser)]
#[command(
    name = "ipcoder",
    about = "Interventional pulmonology CPT coding CLI",
    long_about = "Code procedure evidence into CPT codes, validate knowledge tables \
                  and inspect configuration.",
    after_help = concat!(
        "Examples:\n",
        "  ipcoder code --input note.json\n",
        "  ipcoder code --input note.json --policy rules_only\n",
        "  ipcoder knowledge\n",
        "  ipcoder config"
    )
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to an ipcoder.toml config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override the configured log level")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    RulesOnly,
    SmartHybrid,
}

impl From<PolicyArg> for MergePolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::RulesOnly => Self::RulesOnly,
            PolicyArg::SmartHybrid => Self::SmartHybrid,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Code one evidence file and print the coding report as JSON")]
    Code {
        #[arg(long, help = "Evidence context or coding request JSON file")]
        input: PathBuf,
        #[arg(long, value_enum, help = "Merge policy for this request")]
        policy: Option<PolicyArg>,
        #[arg(long, help = "Knowledge TOML file to use instead of the configured one")]
        knowledge: Option<PathBuf>,
    },
    #[command(about = "Validate the knowledge base and print its fingerprint and counts")]
    Knowledge {
        #[arg(long, help = "Knowledge TOML file to validate instead of the configured one")]
        path: Option<PathBuf>,
    },
    #[command(about = "Inspect effective configuration with source attribution and redaction")]
    Config,
}

pub fn init_logging(config: &CoderConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    // Command output owns stdout; a second init is ignored.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let global = GlobalOptions { config_path: cli.config, log_level: cli.log_level };

    if let Ok(config) = global.load_config(Default::default()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Code { input, policy, knowledge } => commands::code::run(
            &global,
            CodeOptions { input, policy: policy.map(MergePolicy::from), knowledge_path: knowledge },
        ),
        Command::Knowledge { path } => commands::knowledge::run(&global, path),
        Command::Config => commands::config::run(&global),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
