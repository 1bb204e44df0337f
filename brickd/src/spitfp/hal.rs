//! Thin hardware abstraction for the SPI link: a full-duplex bus and a
//! chip-select line. The Linux implementations sit on spidev and the GPIO
//! character device; tests plug in mocks.

use anyhow::Context;
use gpio_cdev::{Line, LineHandle, LineRequestFlags};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

/// Bricklet co-processors talk SPI mode 3 at 1.4 MHz.
const SPI_MAX_SPEED_HZ: u32 = 1_400_000;
const SPI_BITS_PER_WORD: u8 = 8;

pub trait SpiBus: Send {
    /// Clock `tx` out and `rx` in simultaneously. Both slices have the
    /// same length.
    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> anyhow::Result<()>;
}

pub trait ChipSelect: Send {
    fn select(&mut self, enable: bool) -> anyhow::Result<()>;
}

pub struct SpidevBus {
    dev: Spidev,
}

impl SpidevBus {
    /// Open and configure a spidev device. With a GPIO chip select the
    /// hardware CS is disabled via SPI_NO_CS.
    pub fn open(path: &str, hardware_chip_select: bool) -> anyhow::Result<Self> {
        let mut dev =
            Spidev::open(path).with_context(|| format!("could not open {path}"))?;

        let mut mode = SpiModeFlags::SPI_MODE_3;
        if !hardware_chip_select {
            mode |= SpiModeFlags::SPI_NO_CS;
        }

        let options = SpidevOptions::new()
            .bits_per_word(SPI_BITS_PER_WORD)
            .max_speed_hz(SPI_MAX_SPEED_HZ)
            .lsb_first(false)
            .mode(mode)
            .build();

        dev.configure(&options)
            .with_context(|| format!("could not configure {path}"))?;

        Ok(Self { dev })
    }
}

impl SpiBus for SpidevBus {
    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> anyhow::Result<()> {
        let mut transfer = SpidevTransfer::read_write(tx, rx);
        self.dev
            .transfer(&mut transfer)
            .context("SPI transfer failed")?;
        Ok(())
    }
}

/// Chip select driven by a GPIO line, active low.
pub struct GpioChipSelect {
    handle: LineHandle,
}

impl GpioChipSelect {
    pub fn open(name: &str, num: u32) -> anyhow::Result<Self> {
        let line = match find_line_by_name(name) {
            Some(line) => line,
            None => {
                // fall back to the line offset on the primary chip
                let mut chip = gpio_cdev::Chip::new("/dev/gpiochip0")
                    .context("could not open /dev/gpiochip0")?;
                chip.get_line(num)
                    .with_context(|| format!("could not get GPIO line {num}"))?
            }
        };

        let handle = line
            .request(LineRequestFlags::OUTPUT, 1, "brickd")
            .with_context(|| format!("could not reserve GPIO line {name} for output"))?;

        Ok(Self { handle })
    }
}

fn find_line_by_name(name: &str) -> Option<Line> {
    for chip in gpio_cdev::chips().ok()? {
        let Ok(mut chip) = chip else {
            continue;
        };

        for offset in 0..chip.num_lines() {
            let Ok(line) = chip.get_line(offset) else {
                continue;
            };

            if let Ok(info) = line.info() {
                if info.name() == Some(name) {
                    return Some(line);
                }
            }
        }
    }

    None
}

impl ChipSelect for GpioChipSelect {
    fn select(&mut self, enable: bool) -> anyhow::Result<()> {
        // active low
        self.handle
            .set_value(if enable { 0 } else { 1 })
            .context("could not toggle chip select")?;
        Ok(())
    }
}

/// Hardware chip select: the SPI controller toggles the line itself.
pub struct HardwareChipSelect;

impl ChipSelect for HardwareChipSelect {
    fn select(&mut self, _enable: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
