//! PS/2 keyboard on IRQ 1. Keys are decoded and logged; nothing reads them.

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86_64::instructions::port::Port;

use super::X86Hal;
use crate::kernel::Kernel;

const DATA_PORT: u16 = 0x60;

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::Ignore
    ));
}

pub fn on_irq(_kernel: &Kernel<X86Hal>, _irq: u8) {
    let mut port: Port<u8> = Port::new(DATA_PORT);
    let scancode = unsafe { port.read() };

    let mut keyboard = KEYBOARD.lock();
    if let Ok(Some(event)) = keyboard.add_byte(scancode) {
        match keyboard.process_keyevent(event) {
            Some(DecodedKey::Unicode(c)) => log::info!("key {:?}", c),
            Some(DecodedKey::RawKey(key)) => log::debug!("key {:?}", key),
            None => {}
        }
    }
}
