use tgen::driver::Driver;
use tgen::graph::ActionGraph;

mod cmd;

use std::process;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cmd::Args::parse();

    let graph = match ActionGraph::from_file(&args.graph) {
        Ok(graph) => graph,
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    };

    let mut driver = match Driver::new(graph, args.seed) {
        Ok(driver) => driver,
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    };
    driver.set_heartbeat(Duration::from_secs(args.heartbeat));

    // Handle ctrl+C: first press drains, second press aborts
    let stop = driver.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        if stop.load(Ordering::Relaxed) {
            log::warn!("Ending immediately");
            process::abort();
        }
        log::warn!("Ending the run, please wait a few seconds");
        stop.store(true, Ordering::Relaxed);
    }) {
        log::warn!("Error setting Ctrl-C handler: {e}");
    }

    if let Err(e) = driver.run() {
        log::error!("{e}");
        process::exit(2);
    }
}
