use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = mbti_kernel_cli::Cli::parse();
    mbti_kernel_cli::init_logging(cli.log_format());
    mbti_kernel_cli::run_cli(cli)
}
