use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use slick_queue::{QueueConfig, SlickQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "slick-producer.toml")]
    config: String,
    #[clap(long = "count", default_value_t = 10_000_000)]
    count: u64,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ProducerConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: ProducerConfig = confy::load_path(&opts.config)?;
    let queue = SlickQueue::<u64>::create(cfg.queue.capacity, &cfg.queue.segment_path())?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    run(&queue, opts.count, &stop)?;
    Ok(())
}

fn run(queue: &SlickQueue<u64>, count: u64, stop: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut published = 0u64;

    while published < count && !stop.load(Ordering::Relaxed) {
        let index = queue.reserve(1)?;
        unsafe { *queue.at(index) = published };
        queue.publish(index, 1);
        if published % 1_000_000 == 0 {
            eprint!("\rTotal {} ops (published at index {})", published, index);
        }
        published += 1;
    }

    let duration = start.elapsed();
    let iops = (published as f64) / (duration.as_millis().max(1) as f64) * 1_000f64;
    println!(
        "\n{:#?}K messages write/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
