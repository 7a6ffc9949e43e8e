mod commands;
mod config;
mod data;
mod distributed;
mod model;
mod schedule;
mod trainer;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{FashionArgs, MnistArgs};

/// mnode: data-parallel training of image classifiers across processes,
/// GPUs or threads
#[derive(Parser, Debug)]
#[command(name = "mnode")]
#[command(about = "Multi-node data-parallel MNIST / Fashion-MNIST training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the conv net on MNIST
    Mnist(MnistArgs),
    /// Train WideResNet-16-10 on Fashion-MNIST
    #[command(name = "fashion-mnist")]
    FashionMnist(FashionArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::init();

    match cli.command {
        Command::Mnist(args) => commands::run_mnist(args),
        Command::FashionMnist(args) => commands::run_fashion(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fashion_flags() {
        let cli = Cli::try_parse_from([
            "mnode",
            "fashion-mnist",
            "--epochs",
            "2",
            "--savegraph",
            "--profrun",
            "--backend",
            "local",
            "--nproc",
            "2",
            "--no-cuda",
        ])
        .unwrap();
        let Command::FashionMnist(args) = cli.command else {
            panic!("expected fashion-mnist");
        };
        assert_eq!(args.epochs, Some(2));
        assert_eq!(args.savegraph.as_deref(), Some("graphdef"));
        assert!(args.profrun);
        assert_eq!(args.dist.nproc, Some(2));
        assert!(args.dist.no_cuda);
    }

    #[test]
    fn test_parse_mnist_local_rank() {
        let cli = Cli::try_parse_from(["mnode", "mnist", "--local_rank", "3", "--lr", "0.1"]).unwrap();
        let Command::Mnist(args) = cli.command else {
            panic!("expected mnist");
        };
        assert_eq!(args.dist.local_rank, 3);
        assert_eq!(args.lr, Some(0.1));
    }
}
