use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(help = "Path to the action graph file")]
    pub graph: String,
    #[arg(short, long, help = "Seed for random number generation")]
    pub seed: Option<u64>,
    #[arg(
        long,
        default_value_t = 5,
        help = "Heartbeat log period in seconds (0 disables it)"
    )]
    pub heartbeat: u64,
}
