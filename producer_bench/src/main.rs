use std::error::Error;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use slick_queue::{QueueConfig, SlickQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "slick-producer.toml")]
    config: String,
    #[clap(long = "count", default_value_t = 10_000_000)]
    count: u64,
    #[clap(long)]
    read_after_write: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    let queue = SlickQueue::<u64>::create(cfg.queue.capacity, &cfg.queue.segment_path())?;

    // Verification runs keep the record count below capacity so nothing is
    // overwritten before the read phase.
    let count = if opts.read_after_write {
        10.min(u64::from(queue.capacity()))
    } else {
        opts.count
    };

    println!("[Write Phase] Will write {} messages for this run.", count);
    let written = write_phase(&queue, count, opts.read_after_write)?;

    if opts.read_after_write {
        read_phase(&queue, &written)?;
    }
    Ok(())
}

fn write_phase(
    queue: &SlickQueue<u64>,
    count: u64,
    verbose: bool,
) -> Result<Vec<u64>, Box<dyn Error>> {
    let start = Instant::now();
    let mut written = Vec::new();

    for sequence in 0..count {
        let index = queue.reserve(1)?;
        unsafe { *queue.at(index) = sequence };
        queue.publish(index, 1);
        if verbose {
            println!("[Write Phase] Message '{}' published at index {}", sequence, index);
            written.push(sequence);
        } else if sequence % 1_000_000 == 0 {
            eprint!("\rTotal {} ops (published at index {})", sequence, index);
        }
    }

    let duration = start.elapsed();
    let iops = (count as f64) / (duration.as_millis().max(1) as f64) * 1_000f64;
    println!(
        "\n{:#?}K messages write/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(written)
}

fn read_phase(queue: &SlickQueue<u64>, expected: &[u64]) -> Result<(), Box<dyn Error>> {
    println!("\n--- Read After Write Phase ---");

    let mut cursor = 0u64;
    let mut mismatches = 0usize;
    for (position, expected_value) in expected.iter().enumerate() {
        match queue.read(&mut cursor) {
            Some((data, _size)) => {
                let value = unsafe { *data };
                if value != *expected_value {
                    eprintln!(
                        "[Read Phase] MISMATCH at position {}: GOT {}, EXPECTED {}",
                        position, value, expected_value
                    );
                    mismatches += 1;
                } else {
                    println!("[Read Phase] Position {} matches ({})", position, value);
                }
            }
            None => {
                eprintln!("[Read Phase] No record at position {}", position);
                mismatches += 1;
            }
        }
    }

    match queue.read_last() {
        Some((data, _size)) => {
            let value = unsafe { *data };
            let expected_last = *expected.last().unwrap();
            if value == expected_last {
                println!("[Read Phase] read_last matches ({})", value);
            } else {
                eprintln!(
                    "[Read Phase] read_last MISMATCH: GOT {}, EXPECTED {}",
                    value, expected_last
                );
                mismatches += 1;
            }
        }
        None => {
            eprintln!("[Read Phase] read_last returned nothing");
            mismatches += 1;
        }
    }

    if mismatches == 0 {
        println!("[Read Phase] All read messages verified successfully!");
        Ok(())
    } else {
        Err(format!("{} mismatches during read-after-write", mismatches).into())
    }
}
