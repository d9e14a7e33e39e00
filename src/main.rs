use anyhow::Result;
use clap::Parser;

use fray::app::{self, Args};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    app::run(args)
}
