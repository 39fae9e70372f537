use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use slick_queue::{QueueConfig, SlickQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "slick-consumer.toml")]
    config: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ConsumerConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: ConsumerConfig = confy::load_path(&opts.config)?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    // The producer may not have created the segment yet.
    let path = cfg.queue.segment_path();
    let queue = loop {
        match SlickQueue::<u64>::open(&path) {
            Ok(queue) => break queue,
            Err(e) => {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                eprintln!("waiting for queue at {}: {}", path, e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    };

    run(&queue, &stop)?;
    Ok(())
}

fn run(queue: &SlickQueue<u64>, stop: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut cursor = queue.initial_reading_index();
    let mut records = 0u64;

    while !stop.load(Ordering::Relaxed) {
        match queue.read(&mut cursor) {
            Some((data, _size)) => {
                let value = unsafe { *data };
                if records % 1_000_000 == 0 {
                    eprint!("\rTotal {} ops (current value: {})", records, value);
                }
                records += 1;
            }
            None => thread::yield_now(),
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
