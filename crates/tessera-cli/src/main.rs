use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

mod chat;
mod config;
mod config_cmd;
mod logging;
mod paths;

use chat::ChatArgs;

#[derive(Parser, Debug)]
#[command(name = "tessera", version, about = "Stream and assemble chat completions")]
struct Cli {
    #[arg(long, global = true)]
    conf_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<RootCommand>,
    #[command(flatten)]
    chat: ChatArgs,
}

#[derive(Subcommand, Debug, Clone)]
enum RootCommand {
    Chat(ChatArgs),
    Config(ConfigArgs),
    /// List known provider ids and the variable each reads its key from.
    Providers,
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigSubcommand {
    /// Create the home directory and a sample tessera.toml.
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let conf_dir = cli.conf_dir.clone();
    let result = match cli.command {
        Some(RootCommand::Chat(args)) => chat::run_chat(args, conf_dir).await,
        Some(RootCommand::Config(args)) => match args.command {
            ConfigSubcommand::Init => config_cmd::run_config_init(conf_dir),
        },
        Some(RootCommand::Providers) => config_cmd::run_list_providers(),
        None => chat::run_chat(cli.chat, conf_dir).await,
    };

    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
