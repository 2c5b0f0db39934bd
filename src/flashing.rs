//! Programming-session orchestration: sequencing, power bracketing and
//! failure cleanup on top of the protocol driver.
use anyhow::Result;

use crate::constants::PROTOCOL_VERSION;
use crate::device::ChipProfile;
use crate::format::{self, HexImage};
use crate::protocol::{Programmer, ProtocolError};
use crate::transport::Transport;

/// Per-region verify outcome. Config is intentionally not verified;
/// reserved config bits read back differently from part to part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub rom: bool,
    pub eeprom: bool,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.rom && self.eeprom
    }
}

pub struct Flashing<T: Transport> {
    programmer: Programmer<T>,
    ready: bool,
}

impl<T: Transport> std::fmt::Debug for Flashing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flashing")
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Flashing<T> {
    /// Open a session: hard-reset the programmer (retrying once under the
    /// K149 polarity assumption), enter command mode and gate on the
    /// protocol identity string.
    pub fn establish(transport: T, chip: ChipProfile) -> Result<Flashing<T>> {
        let mut programmer = Programmer::new(transport, chip)?;

        let reset = match programmer.hard_reset() {
            Ok(ok) => ok,
            Err(e) => {
                log::debug!("hard reset: {}", e);
                false
            }
        };
        if !reset {
            log::warn!("Hard reset failed, retrying as a K149");
            programmer.assume_k149();
            anyhow::ensure!(programmer.hard_reset()?, "could not reset the programmer");
        }
        anyhow::ensure!(programmer.command_mode()?, "could not enter command mode");

        let protocol = programmer.get_protocol()?;
        if protocol != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedProtocol(protocol).into());
        }

        Ok(Flashing {
            programmer,
            ready: false,
        })
    }

    pub fn chip(&self) -> &ChipProfile {
        self.programmer.chip()
    }

    pub fn set_progress<F>(&mut self, callback: F)
    where
        F: FnMut(usize, usize) -> bool + 'static,
    {
        self.programmer.set_progress(callback);
    }

    pub fn dump_info(&self) -> Result<()> {
        let chip = self.programmer.chip();
        log::info!(
            "Chip: {} (ROM: {} words, EEPROM: {} bytes, {} config words)",
            chip.name,
            chip.rom_size,
            chip.eeprom_size,
            chip.num_config_words
        );
        if let Some(fw) = self.programmer.firmware() {
            log::info!("Programmer firmware: {}", fw.name());
        }
        Ok(())
    }

    pub fn detect_chip(&mut self) -> Result<bool> {
        self.programmer.detect_chip()
    }

    /// The memory-region operations need the programming variables sent
    /// once per session.
    fn ensure_ready(&mut self) -> Result<()> {
        if !self.ready {
            self.programmer.init_program_vars()?;
            self.ready = true;
        }
        Ok(())
    }

    /// Run one power-gated operation. Failure gets an unconditional hard
    /// reset before the error surfaces: it clears the device state machine
    /// and guarantees the programming voltages are off.
    fn with_power<R>(
        &mut self,
        op: impl FnOnce(&mut Programmer<T>) -> Result<R>,
    ) -> Result<R> {
        self.programmer.chip_power_on()?;
        match op(&mut self.programmer) {
            Ok(value) => {
                self.programmer.chip_power_off()?;
                Ok(value)
            }
            Err(err) => {
                match self.programmer.hard_reset() {
                    Ok(true) => {}
                    Ok(false) => log::error!("hard reset after a failed operation got no banner"),
                    Err(e) => log::error!("hard reset after a failed operation failed too: {}", e),
                }
                self.ready = false;
                Err(err)
            }
        }
    }

    /// Program every region present in the image. Config is always written
    /// and always first; the programmer locks up otherwise. Then EEPROM,
    /// then ROM, each skipped when the image holds nothing for it.
    pub fn program_all(&mut self, image: &mut HexImage, erase_first: bool) -> Result<()> {
        self.ensure_ready()?;

        if erase_first {
            log::info!("Erasing chip");
            self.programmer.erase_chip()?;
        }

        log::info!("Writing config");
        self.with_power(|prog| prog.write_config(image))?;

        let (eeprom_lo, eeprom_hi) = {
            let chip = self.programmer.chip();
            (chip.eeprom_start()?, chip.eeprom_end()?)
        };
        let eeprom_bytes = image.count_in_range(eeprom_lo, eeprom_hi);
        if eeprom_bytes > 0 {
            log::info!("Writing {} EEPROM bytes", eeprom_bytes);
            self.with_power(|prog| prog.write_eeprom(image))?;
        } else {
            log::info!("No EEPROM bytes in file");
        }

        let rom_words = image.count_below(self.programmer.chip().rom_size);
        if rom_words > 0 {
            log::info!("Writing {} ROM words", rom_words);
            self.with_power(|prog| prog.write_rom(image))?;
        } else {
            log::info!("No ROM words in file");
        }

        Ok(())
    }

    /// Read the whole chip into a fresh image: ROM, then config, then
    /// EEPROM, each independently power-bracketed.
    pub fn read_all(&mut self) -> Result<HexImage> {
        self.ensure_ready()?;
        let mut image = HexImage::new();

        log::info!("Reading {} ROM words", self.programmer.chip().rom_size);
        self.with_power(|prog| prog.read_rom(&mut image))?;

        log::info!("Reading config");
        self.with_power(|prog| prog.read_config(&mut image))?;

        log::info!("Reading {} EEPROM bytes", self.programmer.chip().eeprom_size);
        self.with_power(|prog| prog.read_eeprom(&mut image))?;

        Ok(image)
    }

    /// Read the chip back and compare the ROM and EEPROM ranges against
    /// `image`, with holes on either side normalized to the blank value.
    pub fn verify(&mut self, image: &HexImage) -> Result<VerifyReport> {
        let device = self.read_all()?;
        let chip = self.programmer.chip();

        let rom = format::compare(image, &device, chip.blank_value()?, 0, chip.rom_end());
        let eeprom = format::compare(
            image,
            &device,
            0xFF,
            chip.eeprom_start()?,
            chip.eeprom_end()?,
        );
        Ok(VerifyReport { rom, eeprom })
    }

    /// Bulk erase. No power bracketing: erase works regardless of the
    /// programming voltages, and the programming variables are not needed.
    pub fn bulk_erase(&mut self) -> Result<()> {
        log::info!("Erasing chip");
        self.programmer.erase_chip()
    }
}
