use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, info};

use super::{HalError, ModemPower};

/// Modem power key wired to a GPIO output (BCM numbering).
pub struct GpioPowerKey {
    pin: OutputPin,
}

impl GpioPowerKey {
    pub fn open(bcm_pin: u8) -> Result<Self, HalError> {
        let pin = Gpio::new()?.get(bcm_pin)?.into_output_low();
        info!("Modem power key on GPIO {}", bcm_pin);
        Ok(Self { pin })
    }
}

impl ModemPower for GpioPowerKey {
    fn set_level(&mut self, high: bool) -> Result<(), HalError> {
        if high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }
}

/// Stand-in when the power key is not wired; only logs the requested levels.
#[derive(Debug, Default)]
pub struct NoPowerKey;

impl ModemPower for NoPowerKey {
    fn set_level(&mut self, high: bool) -> Result<(), HalError> {
        debug!("Power key level {} (not wired)", if high { "high" } else { "low" });
        Ok(())
    }
}
