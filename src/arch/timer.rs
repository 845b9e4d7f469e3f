//! PIT channel 0 as the scheduler tick.

use x86_64::instructions::port::Port;

const PIT_CHANNEL0_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;
const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Channel 0, low/high byte access, mode 3 (square wave).
const PIT_MODE: u8 = 0x36;

pub fn init(frequency_hz: u32) {
    let divisor = (PIT_BASE_FREQUENCY / frequency_hz).clamp(1, u16::MAX as u32) as u16;
    let mut command: Port<u8> = Port::new(PIT_COMMAND_PORT);
    let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0_PORT);
    unsafe {
        command.write(PIT_MODE);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    log::info!(
        "PIT at {} Hz (divisor {}, actual {} Hz)",
        frequency_hz,
        divisor,
        PIT_BASE_FREQUENCY / divisor as u32
    );
}
