/*!
 * Instrument serial numbers.
 *
 * The serial number is a 48-bit value kept in the last six EEPROM cells,
 * least significant byte at address 16383:
 *
 * | bits  | field        |
 * |-------|--------------|
 * | 0-15  | board number |
 * | 16-21 | week         |
 * | 22-29 | year - 2000  |
 * | 30-37 | model        |
 * | 38-47 | product      |
 */
use std::fmt;

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::CallOptions;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::format::{Format, Response};

/// Highest EEPROM address; the serial number occupies the six cells below and including it
pub const EEPROM_SERIAL_BASE: u16 = 16383;

/// Number of bytes in a packed serial number
pub const SERIAL_BYTES: usize = 6;

const BOARD_MASK: u64 = 0xffff;
const WEEK_MASK: u64 = 0x3f;
const YEAR_MASK: u64 = 0xff;
const MODEL_MASK: u64 = 0xff;
const PRODUCT_MASK: u64 = 0x3ff;

/// A decoded serial number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialNumber {
    /// Board number
    pub board_number: u16,
    /// Week of manufacture (Monday-based week of the year)
    pub week: u8,
    /// Year of manufacture, offset from 2000
    pub year: u8,
    /// Model
    pub model: u8,
    /// Product
    pub product: u16,
}

impl SerialNumber {
    /// Decode a packed 48-bit value
    pub fn from_raw(raw: u64) -> Self {
        Self {
            board_number: (raw & BOARD_MASK) as u16,
            week: ((raw >> 16) & WEEK_MASK) as u8,
            year: ((raw >> 22) & YEAR_MASK) as u8,
            model: ((raw >> 30) & MODEL_MASK) as u8,
            product: ((raw >> 38) & PRODUCT_MASK) as u16,
        }
    }

    /// Pack into a 48-bit value. Out-of-range fields are truncated to their width.
    pub fn to_raw(&self) -> u64 {
        (u64::from(self.board_number) & BOARD_MASK)
            | ((u64::from(self.week) & WEEK_MASK) << 16)
            | ((u64::from(self.year) & YEAR_MASK) << 22)
            | ((u64::from(self.model) & MODEL_MASK) << 30)
            | ((u64::from(self.product) & PRODUCT_MASK) << 38)
    }

    /// Parse the instrument's hexadecimal `serial` reply
    pub fn from_hex(text: &str) -> Result<Self> {
        let digits = text.trim();
        let digits = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits);
        let raw = u64::from_str_radix(digits, 16)
            .map_err(|e| DeviceError::parse(format!("invalid serial number {:?}: {}", text, e)))?;
        Ok(Self::from_raw(raw))
    }

    /// The six EEPROM bytes, least significant first
    pub fn to_bytes(&self) -> [u8; SERIAL_BYTES] {
        let raw = self.to_raw().to_le_bytes();
        let mut bytes = [0u8; SERIAL_BYTES];
        bytes.copy_from_slice(&raw[..SERIAL_BYTES]);
        bytes
    }

    /// Calendar year of manufacture
    pub fn full_year(&self) -> u16 {
        2000 + u16::from(self.year)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.to_raw())
    }
}

/// Fields to write; unset ones take defaults from the current date or zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialNumberFields {
    /// Board number, default 0
    pub board_number: Option<u16>,
    /// Week, default the current Monday-based week of the year
    pub week: Option<u8>,
    /// Year offset from 2000, default the current year
    pub year: Option<u8>,
    /// Model, default 0
    pub model: Option<u8>,
    /// Product, default 0
    pub product: Option<u16>,
}

impl SerialNumberFields {
    /// Fill in defaults for unset fields
    pub fn resolve(&self) -> SerialNumber {
        let today = Local::now();
        let week = self.week.unwrap_or_else(|| {
            // `%W`: weeks start on Monday, days before the first Monday are week 0
            let days_from_monday = today.weekday().num_days_from_monday();
            ((today.ordinal0() + 7 - days_from_monday) / 7) as u8
        });
        let year = self
            .year
            .unwrap_or_else(|| (today.year() - 2000).clamp(0, i32::from(u8::MAX)) as u8);

        SerialNumber {
            board_number: self.board_number.unwrap_or(0),
            week,
            year,
            model: self.model.unwrap_or(0),
            product: self.product.unwrap_or(0),
        }
    }
}

impl From<SerialNumber> for SerialNumberFields {
    fn from(serial: SerialNumber) -> Self {
        Self {
            board_number: Some(serial.board_number),
            week: Some(serial.week),
            year: Some(serial.year),
            model: Some(serial.model),
            product: Some(serial.product),
        }
    }
}

impl Device {
    /// Read and decode the serial number
    pub async fn serial_number(&self) -> Result<SerialNumber> {
        let options = CallOptions::new().with_format(Format::None);
        match self.call(["serial"], options).await? {
            Response::Text(text) => SerialNumber::from_hex(&text),
            other => Err(DeviceError::protocol(format!(
                "unexpected serial number reply: {:?}",
                other
            ))),
        }
    }

    /// Write a serial number to EEPROM, then read it back
    pub async fn set_serial_number(&self, fields: SerialNumberFields) -> Result<SerialNumber> {
        let serial = fields.resolve();
        let settle = self.dispatch_config().eeprom_write_delay();
        info!(serial = %serial, "Writing serial number");

        for (offset, byte) in serial.to_bytes().into_iter().enumerate() {
            let address = EEPROM_SERIAL_BASE - offset as u16;
            debug!(address = address, byte = byte, "Writing EEPROM cell");
            self.step("eeprom")
                .step("set")
                .step(address)
                .call_with([byte], CallOptions::new().no_response())
                .await?;
            tokio::time::sleep(settle).await;
        }

        self.serial_number().await
    }
}
