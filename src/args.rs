use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "shortsmith", version, about = "Turns one queued item into a short vertical video and publishes it")]
pub struct Args {
    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug)]
pub struct ChannelArg {
    /// Channel config (TOML)
    #[arg(short, long)]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render and publish the head of the channel queue
    Run {
        #[command(flatten)]
        channel: ChannelArg,

        /// Reduced resolution and a fast preset
        #[arg(long)]
        test: bool,

        /// Compose only; no publishing, queue untouched
        #[arg(long)]
        dry_run: bool,

        /// Keep the job scratch directory
        #[arg(long)]
        keep_artifacts: bool,
    },

    /// Render the caption overlay of the queue head to a PNG
    Caption {
        #[command(flatten)]
        channel: ChannelArg,

        #[arg(long, default_value = "caption_preview.png")]
        out: PathBuf,
    },

    /// Forget the cached YouTube token and run the consent flow again
    Auth {
        #[command(flatten)]
        channel: ChannelArg,
    },

    /// Print the cached YouTube token as base64 for a CI secret
    ExportToken {
        #[command(flatten)]
        channel: ChannelArg,
    },

    /// List Instagram business accounts reachable with the configured token
    FindIgId {
        #[command(flatten)]
        channel: ChannelArg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let args = Args::parse_from(["shortsmith", "-v", "run", "--config", "channels/quotes.toml", "--test", "--dry-run"]);
        assert!(args.verbose);
        match args.command {
            Command::Run {
                channel,
                test,
                dry_run,
                keep_artifacts,
            } => {
                assert_eq!(channel.config, PathBuf::from("channels/quotes.toml"));
                assert!(test && dry_run && !keep_artifacts);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn subcommand_names_are_kebab_case() {
        let args = Args::parse_from(["shortsmith", "export-token", "-c", "a.toml"]);
        assert!(matches!(args.command, Command::ExportToken { .. }));
        let args = Args::parse_from(["shortsmith", "find-ig-id", "-c", "a.toml"]);
        assert!(matches!(args.command, Command::FindIgId { .. }));
    }
}
