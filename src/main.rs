use clap::Parser;
use color_eyre::eyre::ensure;
use color_eyre::Result;
use std::time::Duration;

use ubank::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(long, default_value_t = 9000)]
    port: u16,

    #[clap(
        long,
        default_value_t = 0.0,
        help = "probability of dropping an incoming request"
    )]
    loss_req: f64,

    #[clap(
        long,
        default_value_t = 0.0,
        help = "probability of dropping an outgoing reply"
    )]
    loss_rep: f64,

    #[clap(
        long,
        default_value_t = 60,
        help = "seconds a cached reply stays replayable for at-most-once retries"
    )]
    dedup_ttl: u64,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    ensure!(
        (0.0..1.0).contains(&args.loss_req),
        "--loss-req must be in [0,1)"
    );
    ensure!(
        (0.0..1.0).contains(&args.loss_rep),
        "--loss-rep must be in [0,1)"
    );

    let config = ServerConfig {
        loss_req: args.loss_req,
        loss_rep: args.loss_rep,
        dedup_ttl: Duration::from_secs(args.dedup_ttl),
    };
    let server = Server::bind(("0.0.0.0", args.port), config)?;
    server.run()
}
