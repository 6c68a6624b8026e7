//! UART RX interrupt flow: injected bytes raise the PLIC line, a polled
//! handler drains and echoes them, and the line falls when the FIFO
//! empties.

use ember_machine::{Machine, MachineConfig, UART_IRQ};
use ember_mem::Device;
use ember_mmu::{MemType, PageAttrs, PagePerms};
use pretty_assertions::assert_eq;

const UART_BASE: u64 = 0x1000_0000;
const REG_DATA: u64 = 0x00;
const REG_CTRL: u64 = 0x08;
const CTRL_RX_IRQ_EN: u32 = 1;

fn machine() -> Machine {
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    {
        let plic = m.plic();
        let mut p = plic.borrow_mut();
        p.set_priority(UART_IRQ, 1);
        p.set_enabled(0, UART_IRQ, true);
    }
    // Map the UART page as device memory for guest-style access.
    let page_size = m.cpu().mmu().page_size();
    let vpn = UART_BASE / page_size;
    m.cpu_mut()
        .map_page(
            vpn,
            Some(vpn),
            PageAttrs {
                perms: PagePerms::WRITE,
                memtype: MemType::Device,
                cached: None,
            },
            None,
        )
        .unwrap();
    m
}

#[test]
fn rx_bytes_raise_the_line_only_with_irq_enabled() {
    let m = machine();

    m.uart().unwrap().borrow_mut().push_rx(b'x');
    assert!(!m.plic().borrow().get_context_irq(0));

    m.write_physical(UART_BASE + REG_CTRL, &CTRL_RX_IRQ_EN.to_le_bytes())
        .unwrap();
    assert!(m.plic().borrow().get_context_irq(0));
}

#[test]
fn polled_handler_echoes_rx_to_tx_and_line_falls() {
    let mut m = machine();
    m.write_physical(UART_BASE + REG_CTRL, &CTRL_RX_IRQ_EN.to_le_bytes())
        .unwrap();

    for b in b"echo" {
        m.uart().unwrap().borrow_mut().push_rx(*b);
    }

    // Claim, drain the FIFO through 1-byte device loads, retransmit.
    let uart = m.uart().unwrap();
    let uart_for_handler = uart.clone();
    let mut handler = move |_id: u32| {
        loop {
            let byte = {
                let mut u = uart_for_handler.borrow_mut();
                if u.rx_len() == 0 {
                    break;
                }
                u.read(REG_DATA, 1).unwrap()[0]
            };
            uart_for_handler.borrow_mut().write(REG_DATA, &[byte]).unwrap();
        }
        Ok(())
    };
    let id = m.cpu_mut().poll_interrupts(0, Some(&mut handler)).unwrap();
    assert_eq!(id, UART_IRQ);

    assert_eq!(m.uart_take_output(), b"echo".to_vec());
    // FIFO drained: the level line is back down.
    assert!(!m.plic().borrow().get_context_irq(0));
}

#[test]
fn guest_side_data_access_transmits_and_receives() {
    let mut m = machine();
    m.uart().unwrap().borrow_mut().push_rx(0x5A);

    let got = m.cpu_mut().load(UART_BASE + REG_DATA, 1, false).unwrap();
    assert_eq!(got, 0x5A);

    m.cpu_mut().store(UART_BASE + REG_DATA, 1, b'!' as u64).unwrap();
    assert_eq!(m.uart_take_output(), vec![b'!']);
}
