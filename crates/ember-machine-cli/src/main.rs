//! Demo driver: wires a machine, exercises the cached/uncached and
//! interrupt paths with a small scripted workload, and prints statistics.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ember_cache::CacheLevel;
use ember_cpu::{InterruptBits, CAUSE_MTI};
use ember_machine::{Machine, MachineConfig, TIMER_IRQ, UART_IRQ};
use ember_mmu::PageAttrs;

#[derive(Parser)]
#[command(name = "ember-machine", about = "ember system simulator demo")]
struct Args {
    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 16)]
    ram_mib: u64,

    /// Raw image loaded to the start of RAM.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Text the UART "receives" and echoes back.
    #[arg(long, default_value = "hello, ember")]
    echo: String,

    /// Timebase steps to run after the scripted workload.
    #[arg(long, default_value_t = 1000)]
    steps: u64,

    /// Log filter, e.g. "debug" or "ember_cache=trace".
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log.clone())
        .init();

    let config = MachineConfig {
        ram_size: args.ram_mib * 1024 * 1024,
        ..Default::default()
    };
    let ram_base = config.ram_base;
    let mut m = Machine::new(config).context("wiring machine")?;

    if let Some(path) = &args.image {
        let image = std::fs::read(path).with_context(|| format!("reading {path:?}"))?;
        m.load_image(0, &image).context("loading image")?;
        println!("loaded {} bytes at {ram_base:#x}", image.len());
    }

    // Identity-map the first RAM pages and run a cached store/load loop.
    let page_size = m.cpu().mmu().page_size();
    let first_vpn = ram_base / page_size;
    for vpn in first_vpn..first_vpn + 4 {
        m.cpu_mut().map_page(vpn, Some(vpn), PageAttrs::default(), None)?;
    }
    for i in 0..1024u64 {
        m.cpu_mut().store(ram_base + i * 8, 8, i * 0x1_0001)?;
    }
    let mut checksum = 0u64;
    for i in 0..1024u64 {
        checksum = checksum.wrapping_add(m.cpu_mut().load(ram_base + i * 8, 8, false)?);
    }
    println!("cached workload checksum: {checksum:#x}");

    // UART echo through the interrupt path.
    {
        let plic = m.plic();
        let mut p = plic.borrow_mut();
        p.set_priority(UART_IRQ, 1);
        p.set_priority(TIMER_IRQ, 2);
        p.set_enabled(0, UART_IRQ, true);
        p.set_enabled(0, TIMER_IRQ, true);
    }
    if let Some(uart) = m.uart() {
        for b in args.echo.bytes() {
            uart.borrow_mut().push_rx(b);
        }
        let uart_for_handler = uart.clone();
        let mut echo = move |_id: u32| {
            use ember_mem::Device;
            loop {
                let byte = {
                    let mut u = uart_for_handler.borrow_mut();
                    if u.rx_len() == 0 {
                        break;
                    }
                    u.read(0, 1)?[0]
                };
                uart_for_handler.borrow_mut().write(0, &[byte])?;
            }
            Ok(())
        };
        // Enable the RX interrupt, then service it.
        m.write_physical(0x1000_0008, &1u32.to_le_bytes())?;
        m.cpu_mut().poll_interrupts(0, Some(&mut echo))?;
        let out = m.uart_take_output();
        println!("uart echoed: {}", String::from_utf8_lossy(&out));
    }

    // Timer interrupt off the CLINT timebase.
    m.cpu_mut().csr_mut().mie_enabled = true;
    m.cpu_mut().csr_mut().mie = InterruptBits::MTI;
    m.clint().borrow_mut().set_mtimecmp(0, args.steps);
    m.advance(args.steps);
    match m.cpu_mut().maybe_take_interrupt() {
        Some(CAUSE_MTI) => {
            println!("timer interrupt delivered at mtime {}", m.clint().borrow().mtime());
            m.cpu_mut().complete_trap();
        }
        other => println!("no timer interrupt (cause {other:?})"),
    }

    // Push everything back to memory and report.
    m.cpu_mut().flush_dcache()?;
    m.cpu_mut().flush_l2()?;
    m.cpu_mut().flush_l3()?;

    let bus = m.bus_stats();
    println!(
        "bus: {} reads / {} writes / {} faults ({} B in, {} B out)",
        bus.reads, bus.writes, bus.faults, bus.read_bytes, bus.write_bytes
    );
    for level in [CacheLevel::L1d, CacheLevel::L1i, CacheLevel::L2, CacheLevel::L3] {
        let s = m.cache().borrow().stats(level);
        let rate = s
            .hit_rate()
            .map(|r| format!("{:.1}%", r * 100.0))
            .unwrap_or_else(|| "n/a".into());
        println!(
            "{level}: {} hits / {} misses ({rate}), {} fills, {} evictions, {} writebacks",
            s.hits, s.misses, s.fills, s.evictions, s.writebacks
        );
    }
    let mmu = m.cpu().mmu().stats();
    println!(
        "tlb: {} hits / {} misses, {} page faults",
        mmu.tlb_hits, mmu.tlb_misses, mmu.page_faults
    );
    Ok(())
}
