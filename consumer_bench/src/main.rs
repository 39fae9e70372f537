use std::error::Error;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use slick_queue::{QueueConfig, SlickQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "slick-consumer.toml")]
    config: String,
    #[clap(long = "count", default_value_t = 10_000_000)]
    count: u64,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    let queue = SlickQueue::<u64>::open(&cfg.queue.segment_path())?;
    run(&queue, opts.count)?;
    Ok(())
}

fn run(queue: &SlickQueue<u64>, count: u64) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut cursor = queue.initial_reading_index();
    let mut records = 0u64;

    while records < count {
        match queue.read(&mut cursor) {
            Some((data, _size)) => {
                let value = unsafe { *data };
                if records % 500_000 == 0 {
                    eprint!("\rTotal {} ops (current value: {})", records, value);
                }
                records += 1;
            }
            None => std::hint::spin_loop(),
        }
    }

    let duration = start.elapsed();
    let iops = (records as f64) / (duration.as_millis().max(1) as f64) * 1_000f64;
    println!(
        "\n{:#?}K messages read/s. Lost: {}. Total time: {:#?}",
        (iops / 1000f64) as u64,
        queue.loss_count(),
        duration
    );
    Ok(())
}
