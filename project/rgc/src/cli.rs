use crate::protocol::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rgc", version, about = "Owner-reference garbage collector CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the garbage collector with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate something
    Gen {
        #[clap(subcommand)]
        sub: GenCommand,
    },
}

#[derive(Subcommand)]
pub enum GenCommand {
    /// Print the default configuration as YAML
    Config,
}

impl GenCommand {
    pub fn handle(&self) -> anyhow::Result<()> {
        match self {
            Self::Config => {
                print!("{}", serde_yaml::to_string(&Config::default())?);
                Ok(())
            }
        }
    }
}
