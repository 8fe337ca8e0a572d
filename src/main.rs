use clap::Parser;
use color_eyre::eyre;
use parking_lot::Mutex;
use spasim::compute_unit::CounterUnit;
use spasim::config::{TickConversion, STREAM_DELAY};
use spasim::copy::FunctionalCopyEngine;
use spasim::device::FixedLatency;
use spasim::host::{HostThread, SimThread, ThreadStatus};
use spasim::streams::{StreamOperation, StreamQueue};
use spasim::{Config, KernelId, StreamProcessorArray};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// YAML configuration of the stream processor array
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of kernels to launch
    #[arg(short = 'n', long = "kernels", default_value_t = 4)]
    num_kernels: u64,

    /// Device cycles each kernel takes
    #[arg(long = "kernel-cycles", default_value_t = 1000)]
    kernel_cycles: u64,

    /// Size of the buffers copied before every kernel
    #[arg(long = "buffer-size", default_value_t = 4096)]
    buffer_size: u64,

    #[arg(long = "launch-delay")]
    launch_delay: Option<f64>,

    #[arg(long = "return-delay")]
    return_delay: Option<f64>,

    #[arg(long = "tick-conversion")]
    gpu_tick_conversion: Option<f64>,

    /// Directory to write the statistics report to
    #[arg(short, long = "stats-dir")]
    stats_dir: Option<PathBuf>,

    /// Print the statistics as JSON
    #[arg(long)]
    json: bool,
}

#[cfg(feature = "deadlock_detection")]
fn spawn_lock_watchdog() {
    std::thread::spawn(move || loop {
        // check for deadlocked collaborator locks every 10s
        std::thread::sleep(std::time::Duration::from_secs(10));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        log::error!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            log::error!("Deadlock #{i}");
            for t in threads {
                log::error!("Thread Id {:#?}", t.thread_id());
                log::error!("{:#?}", t.backtrace());
            }
        }
    });
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    #[cfg(feature = "deadlock_detection")]
    spawn_lock_watchdog();

    let options = Options::parse();
    let mut config = match &options.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(delay) = options.launch_delay {
        config.launch_delay = delay;
    }
    if let Some(delay) = options.return_delay {
        config.return_delay = delay;
    }
    if let Some(ratio) = options.gpu_tick_conversion {
        config.gpu_tick_conversion = TickConversion::new(ratio)?;
    }
    log::debug!("config: {config:#?}");

    let mut spa = StreamProcessorArray::new(config)?;
    spa.register_compute_unit(Arc::new(Mutex::new(CounterUnit::new())));

    let thread = Arc::new(Mutex::new(SimThread::new()));
    let streams = Arc::new(Mutex::new(StreamQueue::new()));
    spa.start(
        thread.clone(),
        Arc::new(Mutex::new(FixedLatency::new(options.kernel_cycles))),
        streams.clone(),
        Arc::new(Mutex::new(FunctionalCopyEngine::new())),
    );

    let input = spa.allocate_named(options.buffer_size, Some("input".to_string()))?;
    let output = spa.allocate_named(options.buffer_size, Some("output".to_string()))?;
    let data: Vec<u8> = (0..options.buffer_size).map(|i| (i % 256) as u8).collect();
    spa.write_functional(input, &data)?;

    {
        let mut streams = streams.lock();
        for id in 1..=options.num_kernels {
            let stream = id % 2;
            streams.push(StreamOperation::Memcpy {
                src: input,
                dst: output,
                num_bytes: options.buffer_size,
                stream,
            });
            streams.push(StreamOperation::KernelLaunch {
                kernel: KernelId::new(id)?,
                stream,
                launch_time: spa.now(),
            });
        }
    }
    spa.request_stream_tick(STREAM_DELAY)?;

    if spa.request_block()? {
        thread.lock().suspend();
    }

    let start = Instant::now();
    spa.run()?;
    log::info!(
        "simulated {} host ticks in {:?}",
        spa.now(),
        start.elapsed()
    );
    eyre::ensure!(
        thread.lock().status() != ThreadStatus::Suspended,
        "host thread is still blocked at tick {}",
        spa.now()
    );

    let mut stdout = std::io::stdout().lock();
    if options.json {
        serde_json::to_writer_pretty(&mut stdout, &spa.stats())?;
        writeln!(stdout)?;
    } else {
        spa.print_stats(&mut stdout)?;
    }

    if let Some(stats_dir) = &options.stats_dir {
        spa.write_stats_file(stats_dir)?;
    }
    Ok(())
}
