//! Reset strategies driving the EN and IO0 pins through the DTR and RTS lines

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, transport::Transport};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// Some strategy for resetting a target device
pub trait ResetStrategy: Send {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error>;

    fn set_dtr(&self, transport: &mut dyn Transport, level: bool) -> Result<(), Error> {
        transport.set_dtr(level)?;

        Ok(())
    }

    fn set_rts(&self, transport: &mut dyn Transport, level: bool) -> Result<(), Error> {
        transport.set_rts(level)?;

        Ok(())
    }
}

/// Classic reset sequence, sets DTR and RTS sequentially and leaves the chip
/// in its serial download mode.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        self.set_dtr(transport, false)?; // IO0 = HIGH
        self.set_rts(transport, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr(transport, true)?; // IO0 = LOW
        self.set_rts(transport, false)?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_dtr(transport, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Reset the chip by pulsing EN, booting whatever application is in flash
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using HardReset reset strategy");

        self.set_rts(transport, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_rts(transport, false)?; // EN = HIGH, chip out of reset

        Ok(())
    }
}

/// The reset strategies tried, in order, while connecting
pub fn construct_reset_strategy_sequence() -> Vec<Box<dyn ResetStrategy>> {
    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(ClassicReset::new(true)),
    ]
}
