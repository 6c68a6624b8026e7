//! Machine wiring: builds the DRAM, bus, cache hierarchy, MMU, CPU,
//! interrupt controllers, and peripherals into one object graph and
//! drives their shared timebase.

use std::cell::RefCell;
use std::rc::Rc;

use ember_cache::{CacheConfig, CacheController};
use ember_cpu::{Cpu, PrefetchPolicy, Target};
use ember_devices::{DmaEngine, Rom, SysTimer, Uart};
use ember_firmware::BootAllocator;
use ember_interrupts::{Clint, IrqLine, Plic, PlicConfig};
use ember_mem::{Bus, BusStats, Device, Dram};
use ember_mmu::{Mmu, MmuConfig};
use ember_types::{PhysAddr, Result};
use tracing::debug;

/// Interrupt source ids the stock wiring assigns.
pub const UART_IRQ: u32 = 1;
pub const TIMER_IRQ: u32 = 2;
pub const DMA_IRQ: u32 = 3;

#[derive(Clone)]
pub struct MachineConfig {
    pub ram_size: u64,
    pub ram_base: PhysAddr,
    pub dram_fill: u8,
    pub cache: CacheConfig,
    pub mmu: MmuConfig,
    pub target: Target,
    pub prefetch: PrefetchPolicy,
    pub strict_mmio: bool,
    pub plic: PlicConfig,
    pub clint_base: PhysAddr,
    pub clint_tick: u64,
    pub enable_uart: bool,
    pub uart_base: PhysAddr,
    pub enable_timer: bool,
    pub timer_base: PhysAddr,
    pub enable_dma: bool,
    pub dma_base: PhysAddr,
    pub dma_ram_only: bool,
    /// Optional boot ROM image; registered when non-empty.
    pub rom_image: Option<Vec<u8>>,
    pub rom_base: PhysAddr,
    pub rom_strict: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 16 * 1024 * 1024,
            ram_base: 0x8000_0000,
            dram_fill: 0x00,
            cache: CacheConfig::default(),
            mmu: MmuConfig::default(),
            target: Target::default(),
            prefetch: PrefetchPolicy::default(),
            strict_mmio: true,
            plic: PlicConfig::default(),
            clint_base: 0x0200_0000,
            clint_tick: 1,
            enable_uart: true,
            uart_base: 0x1000_0000,
            enable_timer: true,
            timer_base: 0x1001_0000,
            enable_dma: true,
            dma_base: 0x1002_0000,
            dma_ram_only: true,
            rom_image: None,
            rom_base: 0x0000_1000,
            rom_strict: true,
        }
    }
}

/// The assembled system. Everything is constructed once in `new` and
/// lives for the machine's lifetime; the CPU owns the MMU/CSR state while
/// the bus owns the devices.
pub struct Machine {
    dram: Rc<RefCell<Dram>>,
    bus: Rc<RefCell<Bus>>,
    cache: Rc<RefCell<CacheController>>,
    cpu: Cpu,
    plic: Rc<RefCell<Plic>>,
    clint: Rc<RefCell<Clint>>,
    uart: Option<Rc<RefCell<Uart>>>,
    uart_output: Rc<RefCell<Vec<u8>>>,
    timer: Option<Rc<RefCell<SysTimer>>>,
    dma: Option<Rc<RefCell<DmaEngine>>>,
    ram_base: PhysAddr,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self> {
        let dram = Rc::new(RefCell::new(Dram::new(config.ram_size, config.dram_fill)));
        let bus = Rc::new(RefCell::new(Bus::new()));
        bus.borrow().set_strict_mmio(config.strict_mmio);
        bus.borrow_mut()
            .map_ram("ram", config.ram_base, config.ram_size, dram.clone(), 0)?;

        let cache = Rc::new(RefCell::new(CacheController::new(
            config.cache,
            bus.clone(),
        )?));

        // Point the auto-allocation frame pool at guest RAM unless the
        // caller picked a base already. Invalid page sizes fall through to
        // the MMU's own validation.
        let mut mmu_config = config.mmu.clone();
        if mmu_config.frame_pool_base == 0
            && mmu_config.page_size != 0
            && mmu_config.page_size.is_power_of_two()
        {
            mmu_config.frame_pool_base = config.ram_base >> mmu_config.page_size.trailing_zeros();
        }
        let mmu = Mmu::new(mmu_config)?;

        let plic = Rc::new(RefCell::new(Plic::new(config.plic.clone())?));
        bus.borrow_mut()
            .register_mmio("plic", plic.clone() as Rc<RefCell<dyn Device>>)?;

        let clint = Rc::new(RefCell::new(Clint::new(
            config.clint_base,
            1,
            config.clint_tick,
        )?));
        bus.borrow_mut()
            .register_mmio("clint", clint.clone() as Rc<RefCell<dyn Device>>)?;

        let uart_output = Rc::new(RefCell::new(Vec::new()));
        let uart = if config.enable_uart {
            let dev = Rc::new(RefCell::new(Uart::new(config.uart_base)));
            let sink = uart_output.clone();
            dev.borrow_mut().set_tx(move |b| sink.borrow_mut().push(b));
            dev.borrow_mut().set_irq(IrqLine::new(&plic, UART_IRQ));
            bus.borrow_mut()
                .register_mmio("uart", dev.clone() as Rc<RefCell<dyn Device>>)?;
            Some(dev)
        } else {
            None
        };

        let timer = if config.enable_timer {
            let dev = Rc::new(RefCell::new(SysTimer::new(config.timer_base)));
            dev.borrow_mut().set_irq(IrqLine::new(&plic, TIMER_IRQ));
            bus.borrow_mut()
                .register_mmio("timer", dev.clone() as Rc<RefCell<dyn Device>>)?;
            Some(dev)
        } else {
            None
        };

        let dma = if config.enable_dma {
            let dev = Rc::new(RefCell::new(DmaEngine::new(
                config.dma_base,
                Rc::downgrade(&bus),
                config.dma_ram_only,
            )));
            dev.borrow_mut().set_irq(IrqLine::new(&plic, DMA_IRQ));
            bus.borrow_mut()
                .register_mmio("dma", dev.clone() as Rc<RefCell<dyn Device>>)?;
            Some(dev)
        } else {
            None
        };

        if let Some(image) = &config.rom_image {
            if !image.is_empty() {
                let rom = Rc::new(RefCell::new(Rom::new(
                    config.rom_base,
                    image.clone(),
                    config.rom_strict,
                )));
                bus.borrow_mut()
                    .register_mmio("rom", rom as Rc<RefCell<dyn Device>>)?;
            }
        }

        let mut cpu = Cpu::new(config.target, bus.clone(), mmu, cache.clone());
        cpu.set_prefetch_policy(config.prefetch);
        cpu.attach_plic(plic.clone(), 0);
        cpu.attach_clint(clint.clone(), 0);

        debug!(
            ram_base = format_args!("{:#x}", config.ram_base),
            ram_size = config.ram_size,
            "machine wired"
        );

        Ok(Self {
            dram,
            bus,
            cache,
            cpu,
            plic,
            clint,
            uart,
            uart_output,
            timer,
            dma,
            ram_base: config.ram_base,
        })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> Rc<RefCell<Bus>> {
        self.bus.clone()
    }

    pub fn dram(&self) -> Rc<RefCell<Dram>> {
        self.dram.clone()
    }

    pub fn cache(&self) -> Rc<RefCell<CacheController>> {
        self.cache.clone()
    }

    pub fn plic(&self) -> Rc<RefCell<Plic>> {
        self.plic.clone()
    }

    pub fn clint(&self) -> Rc<RefCell<Clint>> {
        self.clint.clone()
    }

    pub fn uart(&self) -> Option<Rc<RefCell<Uart>>> {
        self.uart.clone()
    }

    pub fn timer(&self) -> Option<Rc<RefCell<SysTimer>>> {
        self.timer.clone()
    }

    pub fn dma(&self) -> Option<Rc<RefCell<DmaEngine>>> {
        self.dma.clone()
    }

    pub fn ram_base(&self) -> PhysAddr {
        self.ram_base
    }

    /// Bytes the UART transmitted since the last call.
    pub fn uart_take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.uart_output.borrow_mut())
    }

    /// Uncached physical read through the bus.
    pub fn read_physical(&self, pa: PhysAddr, n: usize) -> Result<Vec<u8>> {
        self.bus.borrow().read_bytes(pa, n)
    }

    /// Uncached physical write through the bus.
    pub fn write_physical(&self, pa: PhysAddr, bytes: &[u8]) -> Result<()> {
        self.bus.borrow().write_bytes(pa, bytes)
    }

    /// Copies an image into DRAM at an offset from the RAM base.
    pub fn load_image(&self, offset: u64, image: &[u8]) -> Result<()> {
        self.dram.borrow_mut().load_image(offset, image)
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.borrow().stats()
    }

    /// A boot allocator over this machine's RAM regions.
    pub fn boot_allocator(&self) -> Result<BootAllocator> {
        BootAllocator::new(&self.bus.borrow(), self.cpu.mmu().page_size())
    }

    /// Advances the shared timebase: CLINT `mtime`, the system timer, and
    /// a fresh interrupt sample on the CPU.
    pub fn advance(&mut self, steps: u64) {
        self.clint.borrow_mut().advance(steps);
        if let Some(timer) = &self.timer {
            timer.borrow_mut().advance(steps);
        }
        self.cpu.sample_irqs();
    }
}
