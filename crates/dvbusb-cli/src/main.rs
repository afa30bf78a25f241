//! `dvbusb`: command-line interface for DVB-USB receivers.
//!
//! ```text
//! USAGE:
//!   dvbusb enumerate                 List USB devices, marking supported receivers
//!   dvbusb ids                       Print the cold/warm id table
//!   dvbusb simulate [options]        Stream from a simulated receiver
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dvbusb_driver::backends::{LocalDvbCore, SimulatedDriver, SoftwareBus, SoftwareBusConfig};
use dvbusb_driver::{
    AdapterProperties, BusSpeed, DeviceConfig, DeviceProperties, DvbUsbDevice, FeedDescriptor,
    FrontendSlotProperties, PidFilterCaps, StreamProperties,
};
use dvbusb_hw::ids::KNOWN_DEVICES;
use dvbusb_hw::ts;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dvbusb", about = "DVB-USB receiver CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List USB devices from sysfs and mark the ones in the device table.
    Enumerate {
        /// Only show supported receivers.
        #[arg(long)]
        known: bool,
    },
    /// Print the supported cold/warm USB ids.
    Ids,
    /// Bring up a simulated receiver on the software bus and stream from it.
    Simulate {
        /// Number of adapters (1 or 2).
        #[arg(long, default_value_t = 1)]
        adapters: usize,
        /// PIDs to carry and feed (decimal or 0x-prefixed hex).
        #[arg(long, value_delimiter = ',', value_parser = parse_pid, default_value = "0x0,0x100")]
        pids: Vec<u16>,
        /// How long to stream, in milliseconds.
        #[arg(long, default_value_t = 500)]
        duration_ms: u64,
        /// Use isochronous instead of bulk transfers.
        #[arg(long)]
        isoc: bool,
        /// Fail every n-th isochronous frame.
        #[arg(long)]
        iso_error_every: Option<usize>,
        /// Hardware PID filter capability of the simulated receiver.
        #[arg(long, value_enum, default_value_t = FilterArg::None)]
        pid_filter: FilterArg,
        /// Reported link speed.
        #[arg(long, value_enum, default_value_t = SpeedArg::High)]
        speed: SpeedArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FilterArg {
    None,
    Required,
    Optional,
}

#[derive(Clone, Copy, ValueEnum)]
enum SpeedArg {
    Full,
    High,
}

fn parse_pid(s: &str) -> Result<u16, String> {
    let pid = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{s}: {e}"))?;
    if pid > ts::NULL_PID {
        return Err(format!("{s}: PID above {:#x}", ts::NULL_PID));
    }
    Ok(pid)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate { known } => cmd_enumerate(known)?,
        Cmd::Ids => cmd_ids(),
        Cmd::Simulate {
            adapters,
            pids,
            duration_ms,
            isoc,
            iso_error_every,
            pid_filter,
            speed,
        } => cmd_simulate(&SimulateArgs {
            adapters,
            pids,
            duration: Duration::from_millis(duration_ms),
            isoc,
            iso_error_every,
            pid_filter,
            speed,
        })?,
    }

    Ok(())
}

fn cmd_enumerate(known_only: bool) -> Result<()> {
    let devices = dvbusb_driver::discovery::enumerate().context("scanning USB devices")?;

    let mut shown = 0;
    for dev in &devices {
        match &dev.known {
            Some(identified) => {
                let state = if identified.cold { "cold" } else { "warm" };
                println!(
                    "Bus {:03} Device {:03}: ID {}  {} ({state})",
                    dev.busnum, dev.devnum, dev.id, identified.description.name
                );
            }
            None if known_only => continue,
            None => println!("Bus {:03} Device {:03}: ID {}", dev.busnum, dev.devnum, dev.id),
        }
        shown += 1;
    }

    if shown == 0 {
        println!("No matching USB devices.");
    }
    Ok(())
}

fn cmd_ids() {
    for desc in KNOWN_DEVICES {
        println!("{}", desc.name);
        for id in desc.cold_ids {
            println!("    cold {id}");
        }
        for id in desc.warm_ids {
            println!("    warm {id}");
        }
    }
}

struct SimulateArgs {
    adapters: usize,
    pids: Vec<u16>,
    duration: Duration,
    isoc: bool,
    iso_error_every: Option<usize>,
    pid_filter: FilterArg,
    speed: SpeedArg,
}

fn cmd_simulate(args: &SimulateArgs) -> Result<()> {
    let stream = if args.isoc {
        StreamProperties::isoc(4, 2, 8, 4 * ts::PACKET_SIZE, 1)
    } else {
        StreamProperties::bulk(4, 2, 16 * ts::PACKET_SIZE)
    };
    let pid_filter = match args.pid_filter {
        FilterArg::None => PidFilterCaps::None,
        FilterArg::Required => PidFilterCaps::Required { count: 32 },
        FilterArg::Optional => PidFilterCaps::Optional { count: 32 },
    };
    let description = KNOWN_DEVICES[2];
    let driver = Arc::new(SimulatedDriver::new(DeviceProperties {
        devices: vec![description],
        firmware: None,
        adapters: vec![
            AdapterProperties {
                frontends: vec![FrontendSlotProperties { pid_filter, stream }],
            };
            args.adapters
        ],
        remote: None,
    }));

    let bus = SoftwareBus::new(SoftwareBusConfig {
        speed: match args.speed {
            SpeedArg::Full => BusSpeed::Full,
            SpeedArg::High => BusSpeed::High,
        },
        pids: args.pids.clone(),
        completion_delay: Duration::from_millis(1),
        iso_error_every: args.iso_error_every,
    })?;
    let core = Arc::new(LocalDvbCore::new());

    let mut device = DvbUsbDevice::init(
        description,
        bus.clone(),
        driver,
        core.clone(),
        DeviceConfig::from_env(),
    )?;
    println!("{} ready, {} adapter(s)", device.name(), device.adapters().len());

    for adapter in device.adapters() {
        let frontend = adapter
            .frontend(0)
            .with_context(|| format!("adapter {} has no frontend", adapter.id()))?;
        frontend.init()?;
        for (index, &pid) in args.pids.iter().enumerate() {
            adapter.start_feed(&FeedDescriptor::new(pid, index))?;
        }
        println!(
            "adapter {}: {} feed(s), filtering {:?}",
            adapter.id(),
            adapter.feed_count(),
            adapter.pid_filtering(0)
        );
    }

    tracing::info!("streaming for {:?}", args.duration);
    let deadline = Instant::now() + args.duration;
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
        for id in 0..device.adapters().len() {
            if let Some(demux) = core.demux(id) {
                demux.drain();
            }
        }
    }

    for adapter in device.adapters() {
        for (index, &pid) in args.pids.iter().enumerate().rev() {
            adapter.stop_feed(&FeedDescriptor::new(pid, index))?;
        }
        if let Some(frontend) = adapter.frontend(0) {
            frontend.sleep()?;
        }
    }

    for adapter in device.adapters() {
        let id = adapter.id();
        if let Some(demux) = core.demux(id) {
            demux.drain();
            let stats = demux.stats();
            if let Some(s) = adapter.stream_stats(0) {
                println!(
                    "adapter {id}: {} transfers, {} bytes, {} frame errors, {} transport errors",
                    s.completed, s.bytes_delivered, s.frame_errors, s.transport_errors
                );
            }
            for (pid, p) in &stats.pids {
                println!(
                    "    pid {pid:#06x}: {} packets, {} continuity errors",
                    p.packets, p.cc_errors
                );
            }
            if stats.dropped_chunks > 0 || stats.resync_bytes > 0 {
                println!(
                    "    dropped {} chunks, skipped {} bytes resyncing",
                    stats.dropped_chunks, stats.resync_bytes
                );
            }
        }
    }

    device.exit();
    println!(
        "bus: {} completions, {} allocations, {} frees",
        bus.completions(),
        bus.allocations(),
        bus.frees()
    );
    Ok(())
}
