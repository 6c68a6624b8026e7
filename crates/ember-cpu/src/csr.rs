use bitflags::bitflags;

/// Machine-mode interrupt cause codes.
pub const CAUSE_MSI: u64 = 3;
pub const CAUSE_MTI: u64 = 7;
pub const CAUSE_MEI: u64 = 11;

bitflags! {
    /// Machine interrupt enable/pending bits, at their architectural
    /// positions (bit = cause code).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptBits: u64 {
        const MSI = 1 << CAUSE_MSI;
        const MTI = 1 << CAUSE_MTI;
        const MEI = 1 << CAUSE_MEI;
    }
}

/// Minimal machine-mode CSR block: the mstatus interrupt-enable pair,
/// mie/mip, and mcause.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsrFile {
    /// mstatus.MIE: global machine interrupt enable.
    pub mie_enabled: bool,
    /// mstatus.MPIE: previous MIE, restored by mret.
    pub mpie: bool,
    /// Individually enabled interrupts.
    pub mie: InterruptBits,
    /// Currently pending interrupts, refreshed by `sample_irqs`.
    pub mip: InterruptBits,
    /// Trap cause, set on entry and cleared by mret. The flag records
    /// whether the cause was an interrupt.
    pub mcause: Option<(u64, bool)>,
}

impl CsrFile {
    /// Highest-priority enabled-and-pending interrupt cause, provided the
    /// global enable is set. Machine-mode priority: external, then timer,
    /// then software.
    pub fn should_take_interrupt(&self) -> Option<u64> {
        if !self.mie_enabled {
            return None;
        }
        let ready = self.mie & self.mip;
        if ready.contains(InterruptBits::MEI) {
            Some(CAUSE_MEI)
        } else if ready.contains(InterruptBits::MTI) {
            Some(CAUSE_MTI)
        } else if ready.contains(InterruptBits::MSI) {
            Some(CAUSE_MSI)
        } else {
            None
        }
    }

    /// Trap entry: stash MIE into MPIE, mask interrupts, record the cause.
    pub fn trap_enter(&mut self, cause: u64, is_interrupt: bool) {
        self.mpie = self.mie_enabled;
        self.mie_enabled = false;
        self.mcause = Some((cause, is_interrupt));
    }

    /// Return from trap: restore MIE from MPIE, set MPIE, clear the cause.
    pub fn mret(&mut self) {
        self.mie_enabled = self.mpie;
        self.mpie = true;
        self.mcause = None;
    }
}
