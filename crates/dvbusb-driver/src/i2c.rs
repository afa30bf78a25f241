//! I2C adapter for demodulator and tuner access
//!
//! Drivers whose devices tunnel I2C over USB control messages provide an
//! [`I2cAlgorithm`]; the device lifecycle wraps it in an [`I2cAdapter`] that
//! frontend and tuner attach hooks use.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{DvbUsbError, Result};
use crate::sync::lock;

/// Direction of one I2C message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cDirection {
    /// Master writes `buf`
    Write,
    /// Master reads into `buf`
    Read,
}

/// One segment of a combined I2C transfer
#[derive(Debug)]
pub struct I2cMsg<'a> {
    /// 7-bit slave address
    pub addr: u16,
    /// Transfer direction
    pub direction: I2cDirection,
    /// Data to write or space to read into
    pub buf: &'a mut [u8],
}

/// Bus-specific I2C master
pub trait I2cAlgorithm: Send + Sync {
    /// Run `msgs` as one combined transfer; returns messages completed
    ///
    /// # Errors
    ///
    /// Device-specific failure.
    fn master_xfer(&self, msgs: &mut [I2cMsg<'_>]) -> Result<usize>;
}

/// Registered I2C adapter of a device
///
/// Transfers are serialized: the demodulator and tuner share the bus.
pub struct I2cAdapter {
    name: String,
    algorithm: Arc<dyn I2cAlgorithm>,
    bus: Mutex<()>,
}

impl I2cAdapter {
    /// Wrap `algorithm` under `name`
    pub fn new(name: impl Into<String>, algorithm: Arc<dyn I2cAlgorithm>) -> Self {
        Self {
            name: name.into(),
            algorithm,
            bus: Mutex::new(()),
        }
    }

    /// Adapter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a combined transfer
    ///
    /// # Errors
    ///
    /// `DeviceError` if fewer messages than requested completed, or whatever
    /// the algorithm reports.
    pub fn transfer(&self, msgs: &mut [I2cMsg<'_>]) -> Result<()> {
        let _bus = lock(&self.bus);
        let done = self.algorithm.master_xfer(msgs)?;
        if done != msgs.len() {
            return Err(DvbUsbError::device_error(format!(
                "{}: i2c transfer completed {done} of {} messages",
                self.name,
                msgs.len()
            )));
        }
        Ok(())
    }

    /// Write `data` to `addr`
    ///
    /// # Errors
    ///
    /// See [`transfer`](Self::transfer).
    pub fn write(&self, addr: u16, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        self.transfer(&mut [I2cMsg {
            addr,
            direction: I2cDirection::Write,
            buf: &mut buf,
        }])
    }

    /// Write register address `reg` then read `out.len()` bytes
    ///
    /// # Errors
    ///
    /// See [`transfer`](Self::transfer).
    pub fn read_reg(&self, addr: u16, reg: &[u8], out: &mut [u8]) -> Result<()> {
        let mut reg = reg.to_vec();
        self.transfer(&mut [
            I2cMsg {
                addr,
                direction: I2cDirection::Write,
                buf: &mut reg,
            },
            I2cMsg {
                addr,
                direction: I2cDirection::Read,
                buf: out,
            },
        ])
    }
}

impl fmt::Debug for I2cAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2cAdapter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl I2cAlgorithm for Echo {
        fn master_xfer(&self, msgs: &mut [I2cMsg<'_>]) -> Result<usize> {
            let mut last = 0;
            for msg in msgs.iter_mut() {
                match msg.direction {
                    I2cDirection::Write => last = msg.buf.first().copied().unwrap_or(0),
                    I2cDirection::Read => msg.buf.fill(last),
                }
            }
            Ok(msgs.len())
        }
    }

    struct Short;

    impl I2cAlgorithm for Short {
        fn master_xfer(&self, _msgs: &mut [I2cMsg<'_>]) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn read_reg_is_a_combined_transfer() {
        let adapter = I2cAdapter::new("test i2c", Arc::new(Echo));
        let mut out = [0u8; 2];
        adapter.read_reg(0x60, &[0x5a], &mut out).unwrap();
        assert_eq!(out, [0x5a, 0x5a]);
    }

    #[test]
    fn short_transfer_is_an_error() {
        let adapter = I2cAdapter::new("test i2c", Arc::new(Short));
        assert!(matches!(
            adapter.write(0x60, &[1]),
            Err(DvbUsbError::DeviceError { .. })
        ));
    }
}
