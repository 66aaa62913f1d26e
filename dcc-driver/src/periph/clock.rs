//! Clock manager registers for the PWM clock.

use super::Registers;

// register word offsets within the clock manager block
const PWMCTL: usize = 0x28;
const PWMDIV: usize = 0x29;

const PASSWD: u32 = 0x5A << 24;

const CTL_SRC_OSC: u32 = 0x1;
const CTL_ENAB: u32 = 1 << 4;
const CTL_BUSY: u32 = 1 << 7;

const DIVI_SHIFT: u32 = 12;

/// Crystal oscillator feeding the clock generator, in MHz.
pub const OSCILLATOR_MHZ: f32 = 19.2;

pub struct Clock<'a> {
    registers: Registers<'a>,
}

impl<'a> Clock<'a> {
    pub(crate) fn new(base: *mut u32) -> Clock<'a> {
        Clock {
            registers: Registers::new(base),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.registers.read(PWMCTL) & CTL_BUSY != 0
    }

    /// Stop the PWM clock and wait for the generator to settle.
    pub fn stop(&mut self) {
        let value = self.registers.read(PWMCTL) & !CTL_ENAB;
        self.registers.write(PWMCTL, PASSWD | (value & !PASSWD));
        while self.is_busy() {
            std::thread::yield_now();
        }
    }

    /// Run the PWM clock from the oscillator with an integer divisor.
    pub fn start_pwm(&mut self, divisor: u32) {
        self.stop();
        self.registers.write(PWMDIV, PASSWD | (divisor << DIVI_SHIFT));
        self.registers.write(PWMCTL, PASSWD | CTL_SRC_OSC);
        self.registers
            .write(PWMCTL, PASSWD | CTL_SRC_OSC | CTL_ENAB);
    }
}

/// Integer divisor producing roughly `bit_duration` microseconds per
/// serialized bit from the 19.2 MHz oscillator.
pub(crate) fn divisor_for(bit_duration: f32) -> u32 {
    (bit_duration * OSCILLATOR_MHZ).round() as u32
}
