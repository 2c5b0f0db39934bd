//! The Kitsrus P018 wire protocol.
//!
//! Every command is a single byte; most are acknowledged by a single fixed
//! byte. The bulk transfers run a small prompt-driven state machine where
//! the programmer paces the host with 'Y' (send/next), 'P' (done) and 'N'
//! (failed, with a diagnostic payload).
use std::thread;
use std::time::Duration;

use anyhow::Result;
use scroll::{Pread, Pwrite, BE, LE};

use crate::constants::{acks, commands, CONFIG_READ_SIZE, CONFIG_STAGE_SIZE, ROM_CHUNK_WORDS};
use crate::device::ChipProfile;
use crate::format::HexImage;
use crate::transport::Transport;

/// How long the power line is held asserted during a hard reset.
const RESET_HOLD: Duration = Duration::from_millis(10);

/// Progress sink: called with (units done, total units); returning `false`
/// cancels the operation at the next chunk boundary.
pub type ProgressFn = Box<dyn FnMut(usize, usize) -> bool>;

/// The command set, with each command's code and fixed acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reset,
    CommandMode,
    InitVars,
    PowerOn,
    PowerOff,
    PowerCycle,
    WriteRom,
    WriteEeprom,
    WriteConfig,
    WriteFuse,
    ReadRom,
    ReadEeprom,
    ReadConfig,
    Erase,
    DetectChip,
    GetVersion,
    GetProtocol,
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Command::Reset => commands::RESET,
            Command::CommandMode => commands::COMMAND_MODE,
            Command::InitVars => commands::INIT_VARS,
            Command::PowerOn => commands::POWER_ON,
            Command::PowerOff => commands::POWER_OFF,
            Command::PowerCycle => commands::POWER_CYCLE,
            Command::WriteRom => commands::WRITE_ROM,
            Command::WriteEeprom => commands::WRITE_EEPROM,
            Command::WriteConfig => commands::WRITE_CONFIG,
            Command::WriteFuse => commands::WRITE_FUSE,
            Command::ReadRom => commands::READ_ROM,
            Command::ReadEeprom => commands::READ_EEPROM,
            Command::ReadConfig => commands::READ_CONFIG,
            Command::Erase => commands::ERASE,
            Command::DetectChip => commands::IN_SOCKET,
            Command::GetVersion => commands::GET_VERSION,
            Command::GetProtocol => commands::GET_PROTOCOL,
        }
    }

    /// The fixed acknowledgement byte, for commands that have one. The
    /// transfer commands answer through their own state machines instead.
    pub const fn ack(self) -> Option<u8> {
        match self {
            Command::Reset => Some(acks::SOFT_RESET),
            Command::CommandMode => Some(acks::COMMAND_MODE),
            Command::InitVars => Some(acks::INIT_VARS),
            Command::PowerOn => Some(acks::POWER_ON),
            Command::PowerOff => Some(acks::POWER_OFF),
            Command::PowerCycle => Some(acks::POWER_CYCLE),
            Command::Erase => Some(acks::ERASE),
            Command::WriteRom
            | Command::WriteEeprom
            | Command::WriteConfig
            | Command::WriteFuse
            | Command::ReadRom
            | Command::ReadEeprom
            | Command::ReadConfig
            | Command::DetectChip
            | Command::GetVersion
            | Command::GetProtocol => None,
        }
    }
}

/// Programmer hardware revisions, as reported after a hard reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    Kit128,
    Kit149A,
    Kit149B,
    Kit150,
    Kit170,
    Kit182,
    Kit185,
}

impl Firmware {
    pub fn from_code(code: u8) -> Option<Firmware> {
        use crate::constants::firmware::*;
        Some(match code {
            KIT_128 => Firmware::Kit128,
            KIT_149A => Firmware::Kit149A,
            KIT_149B => Firmware::Kit149B,
            KIT_150 => Firmware::Kit150,
            KIT_170 => Firmware::Kit170,
            KIT_182 => Firmware::Kit182,
            KIT_185 => Firmware::Kit185,
            _ => return None,
        })
    }

    pub const fn code(self) -> u8 {
        use crate::constants::firmware::*;
        match self {
            Firmware::Kit128 => KIT_128,
            Firmware::Kit149A => KIT_149A,
            Firmware::Kit149B => KIT_149B,
            Firmware::Kit150 => KIT_150,
            Firmware::Kit170 => KIT_170,
            Firmware::Kit182 => KIT_182,
            Firmware::Kit185 => KIT_185,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Firmware::Kit128 => "Kit 128",
            Firmware::Kit149A => "Kit 149A",
            Firmware::Kit149B => "Kit 149B",
            Firmware::Kit150 => "Kit 150",
            Firmware::Kit170 => "Kit 170",
            Firmware::Kit182 => "Kit 182",
            Firmware::Kit185 => "Kit 185",
        }
    }

    /// The K149 revisions drive the reset/power line with the opposite
    /// polarity of every other board.
    pub const fn inverts_power_line(self) -> bool {
        matches!(self, Firmware::Kit149A | Firmware::Kit149B)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{command:?}: expected 0x{expected:02X}, device answered 0x{got:02X}")]
    UnexpectedResponse {
        command: Command,
        expected: u8,
        got: u8,
    },
    #[error("device reported a failed write at address 0x{address:04X} (word 0x{word:04X})")]
    DeviceNack { address: u16, word: u16 },
    #[error("cancelled")]
    Cancelled,
    #[error("chip has no config region (CONFIG base is zero)")]
    NoConfigRegion,
    #[error("programmer speaks protocol {0:?}")]
    UnsupportedProtocol(String),
}

/// Protocol driver for one programming session.
pub struct Programmer<T: Transport> {
    pub(crate) transport: T,
    chip: ChipProfile,
    firmware: Option<Firmware>,
    progress: Option<ProgressFn>,
}

impl<T: Transport> Programmer<T> {
    pub fn new(transport: T, chip: ChipProfile) -> Result<Programmer<T>> {
        chip.validate()?;
        anyhow::ensure!(
            chip.num_config_words <= 7,
            "chip profile {:?}: the protocol stages at most 7 config words",
            chip.name
        );
        Ok(Programmer {
            transport,
            chip,
            firmware: None,
            progress: None,
        })
    }

    pub fn chip(&self) -> &ChipProfile {
        &self.chip
    }

    pub fn firmware(&self) -> Option<Firmware> {
        self.firmware
    }

    pub fn set_progress<F>(&mut self, callback: F)
    where
        F: FnMut(usize, usize) -> bool + 'static,
    {
        self.progress = Some(Box::new(callback));
    }

    fn report(&mut self, at: usize, total: usize) -> bool {
        match self.progress.as_mut() {
            Some(callback) => callback(at.min(total), total),
            None => true,
        }
    }

    fn send(&mut self, command: Command) -> Result<()> {
        self.transport.write_byte(command.code())
    }

    fn expect_ack(&mut self, command: Command) -> Result<()> {
        if let Some(expected) = command.ack() {
            let got = self.transport.read_byte()?;
            if got != expected {
                return Err(ProtocolError::UnexpectedResponse {
                    command,
                    expected,
                    got,
                }
                .into());
            }
        }
        Ok(())
    }

    fn command(&mut self, command: Command) -> Result<()> {
        self.send(command)?;
        self.expect_ack(command)
    }

    fn write_u16_be(&mut self, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        buf.pwrite_with(value, 0, BE)?;
        self.transport.write_byte(buf[0])?;
        self.transport.write_byte(buf[1])
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let buf = [self.transport.read_byte()?, self.transport.read_byte()?];
        Ok(buf.pread_with(0, BE)?)
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let buf = [self.transport.read_byte()?, self.transport.read_byte()?];
        Ok(buf.pread_with(0, LE)?)
    }

    /// Switch the freshly reset programmer into command mode.
    pub fn command_mode(&mut self) -> Result<bool> {
        self.send(Command::CommandMode)?;
        Ok(self.transport.read_byte()? == acks::COMMAND_MODE)
    }

    /// In-protocol reset; answered with 'Q' whether or not the programmer
    /// was in its command table.
    pub fn soft_reset(&mut self) -> Result<bool> {
        self.send(Command::Reset)?;
        Ok(self.transport.read_byte()? == acks::SOFT_RESET)
    }

    /// Reset via the power line and learn the firmware identity from the
    /// boot banner. The line polarity depends on which firmware we assume
    /// is listening; see [`Programmer::assume_k149`].
    pub fn hard_reset(&mut self) -> Result<bool> {
        let inverted = self.firmware.is_some_and(Firmware::inverts_power_line);
        self.transport.set_power_line(!inverted)?;
        thread::sleep(RESET_HOLD);
        self.transport.set_power_line(inverted)?;

        if self.transport.read_byte()? != acks::BOOT {
            return Ok(false);
        }
        let code = self.transport.read_byte()?;
        self.firmware = Firmware::from_code(code);
        match self.firmware {
            Some(fw) => log::debug!("Found firmware type 0x{:02X} ({})", code, fw.name()),
            None => log::warn!("Unknown firmware type 0x{:02X}", code),
        }
        Ok(true)
    }

    /// Assume a K149 before retrying a failed hard reset; that revision
    /// inverts the power line, so the first reset attempt never completes
    /// on one. The real identity is learned from the successful reset.
    pub fn assume_k149(&mut self) {
        self.firmware = Some(Firmware::Kit149A);
    }

    /// Transmit the programming variables of the selected chip.
    pub fn init_program_vars(&mut self) -> Result<()> {
        let core = self.chip.core_family()?;
        self.send(Command::InitVars)?;
        self.write_u16_be(self.chip.rom_size as u16)?;
        self.write_u16_be(self.chip.eeprom_size)?;
        self.transport.write_byte(core.code())?;
        let mut flags = 0u8;
        if self.chip.cal_word {
            flags |= 0x01;
        }
        if self.chip.band_gap {
            flags |= 0x02;
        }
        if core.single_panel() {
            flags |= 0x04;
        }
        if self.chip.fast_power {
            flags |= 0x08;
        }
        self.transport.write_byte(flags)?;
        self.transport.write_byte(self.chip.program_delay)?;
        self.transport.write_byte(self.chip.power_sequence.code())?;
        self.transport.write_byte(self.chip.erase_mode)?;
        self.transport.write_byte(self.chip.program_tries)?;
        self.transport.write_byte(self.chip.over_program)?;
        self.expect_ack(Command::InitVars)
    }

    pub fn chip_power_on(&mut self) -> Result<()> {
        self.command(Command::PowerOn)
    }

    pub fn chip_power_off(&mut self) -> Result<()> {
        self.command(Command::PowerOff)
    }

    pub fn chip_power_cycle(&mut self) -> Result<()> {
        self.command(Command::PowerCycle)
    }

    pub fn erase_chip(&mut self) -> Result<()> {
        self.command(Command::Erase)
    }

    /// Probe for a chip in the socket.
    pub fn detect_chip(&mut self) -> Result<bool> {
        self.send(Command::DetectChip)?;
        if self.transport.read_byte()? == acks::IN_SOCKET {
            self.transport.read_byte()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Firmware revision byte, probing the programmer if it has not
    /// already been learned from a hard reset.
    pub fn get_version(&mut self) -> Result<u8> {
        if let Some(fw) = self.firmware {
            return Ok(fw.code());
        }
        self.send(Command::GetVersion)?;
        let code = self.transport.read_byte()?;
        self.firmware = Firmware::from_code(code);
        Ok(code)
    }

    /// The 4-character protocol identity string.
    pub fn get_protocol(&mut self) -> Result<String> {
        self.send(Command::GetProtocol)?;
        let mut raw = [0u8; 4];
        for byte in &mut raw {
            *byte = self.transport.read_byte()?;
        }
        log::debug!("protocol id: {}", hex::encode(raw));
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Program the ROM region. The transfer covers every word up to the
    /// highest populated address below the ROM size; holes are sent as the
    /// core's blank value.
    pub fn write_rom(&mut self, image: &mut HexImage) -> Result<()> {
        let core = self.chip.core_family()?;
        image.set_fill(core.params().blank);

        let words = 1 + image.max_addr_below(self.chip.rom_size - 1) as usize;
        let size = 2 * words;

        self.send(Command::WriteRom)?;
        self.write_u16_be(size as u16)?;

        let mut addr: u32 = 0;
        loop {
            match self.transport.read_byte()? {
                acks::DONE => {
                    self.report(words, words);
                    return Ok(());
                }
                acks::FAILED_AT => {
                    let address = self.read_u16_be()?;
                    let word = self.read_u16_be()?;
                    log::error!(
                        "write_rom: device rejected address 0x{:04X} (word 0x{:04X})",
                        address,
                        word
                    );
                    return Err(ProtocolError::DeviceNack { address, word }.into());
                }
                acks::SEND_NEXT => {
                    for _ in 0..ROM_CHUNK_WORDS {
                        let word = image.get(addr);
                        self.transport.write_byte(word as u8)?;
                        self.transport.write_byte((word >> 8) as u8)?;
                        addr += 1;
                    }
                    if !self.report(addr as usize, words) {
                        return Err(ProtocolError::Cancelled.into());
                    }
                }
                got => {
                    return Err(ProtocolError::UnexpectedResponse {
                        command: Command::WriteRom,
                        expected: acks::SEND_NEXT,
                        got,
                    }
                    .into());
                }
            }
        }
    }

    /// Program the EEPROM region, two bytes per prompt.
    pub fn write_eeprom(&mut self, image: &mut HexImage) -> Result<()> {
        image.set_fill(0xFF);
        let start = self.chip.eeprom_start()?;
        let end = start + u32::from(self.chip.eeprom_size);
        let mut size = image.count_in_range(start, end);
        if size % 2 != 0 {
            size += 1;
        }

        self.send(Command::WriteEeprom)?;
        self.write_u16_be(size as u16)?;

        let mut addr = start;
        loop {
            match self.transport.read_byte()? {
                acks::DONE => {
                    self.report(size, size);
                    return Ok(());
                }
                acks::SEND_NEXT => {
                    self.transport.write_byte(image.get(addr) as u8)?;
                    addr += 1;
                    self.transport.write_byte(image.get(addr) as u8)?;
                    addr += 1;
                    if !self.report((addr - start) as usize, size) {
                        return Err(ProtocolError::Cancelled.into());
                    }
                }
                got => {
                    return Err(ProtocolError::UnexpectedResponse {
                        command: Command::WriteEeprom,
                        expected: acks::SEND_NEXT,
                        got,
                    }
                    .into());
                }
            }
        }
    }

    /// Program the ID locations and config words from a staged 22-byte
    /// buffer. A config word is staged only when its address is populated;
    /// everything else goes out as the 0xFF sentinel. 16-bit cores need
    /// the same buffer sent again as a separate fuse write.
    pub fn write_config(&mut self, image: &HexImage) -> Result<()> {
        let config_base = self.chip.config_start()?;
        if config_base == 0 {
            // Config bits are never at address zero
            return Err(ProtocolError::NoConfigRegion.into());
        }

        let mut stage = [0xFFu8; CONFIG_STAGE_SIZE];
        let id_base = self.chip.id_start()?;
        if image.contains(id_base) {
            for k in 0..4u32 {
                stage[k as usize] = image.get_or(id_base + k, 0xFF) as u8;
            }
        }
        stage[4..8].copy_from_slice(b"FFFF");
        for k in 0..usize::from(self.chip.num_config_words) {
            if let Some(word) = image.lookup(config_base + k as u32) {
                stage[8 + 2 * k] = word as u8;
                stage[8 + 2 * k + 1] = (word >> 8) as u8;
            }
        }
        log::debug!("config stage: {}", hex::encode(stage));

        let total = if self.chip.is_16bit() { 50 } else { 25 };
        let mut progress = 0usize;
        self.config_pass(Command::WriteConfig, stage, &mut progress, total)?;
        if self.chip.is_16bit() {
            // 18F parts take the fuses as a second pass over the same bytes
            self.config_pass(Command::WriteFuse, stage, &mut progress, total)?;
        }
        self.report(total, total);
        Ok(())
    }

    fn config_pass(
        &mut self,
        command: Command,
        stage: [u8; CONFIG_STAGE_SIZE],
        progress: &mut usize,
        total: usize,
    ) -> Result<()> {
        self.send(command)?;
        self.transport.write_byte(b'0')?;
        self.transport.write_byte(b'0')?;
        *progress += 3;
        for byte in stage {
            self.transport.write_byte(byte)?;
            if !self.report(*progress, total) {
                return Err(ProtocolError::Cancelled.into());
            }
            *progress += 1;
        }
        self.transport.read_byte()?; // ack byte, contents never specified
        Ok(())
    }

    /// Read the ROM back into `image`, one word at a time.
    pub fn read_rom(&mut self, image: &mut HexImage) -> Result<()> {
        let total = self.chip.rom_size as usize;
        self.send(Command::ReadRom)?;
        for addr in 0..self.chip.rom_size {
            let word = self.read_u16_le()?;
            image.set(addr, word);
            if !self.report(addr as usize + 1, total) {
                return Err(ProtocolError::Cancelled.into());
            }
        }
        Ok(())
    }

    /// Read the EEPROM back into `image`, one byte per word address.
    pub fn read_eeprom(&mut self, image: &mut HexImage) -> Result<()> {
        let start = self.chip.eeprom_start()?;
        let total = usize::from(self.chip.eeprom_size);
        self.send(Command::ReadEeprom)?;
        for i in 0..u32::from(self.chip.eeprom_size) {
            let byte = self.transport.read_byte()?;
            image.set(start + i, u16::from(byte));
            if !self.report(i as usize + 1, total) {
                return Err(ProtocolError::Cancelled.into());
            }
        }
        Ok(())
    }

    /// Read the 26-byte config block and scatter the ID and config words
    /// back at the addresses the write path takes them from.
    pub fn read_config(&mut self, image: &mut HexImage) -> Result<()> {
        let config_base = self.chip.config_start()?;
        if config_base == 0 {
            return Err(ProtocolError::NoConfigRegion.into());
        }

        self.send(Command::ReadConfig)?;
        let ack = self.transport.read_byte()?;
        if ack != acks::CONFIG_BLOCK {
            // Non-fatal on real hardware; the block that follows is intact
            log::warn!(
                "read_config: expected ack 0x{:02X}, got 0x{:02X}",
                acks::CONFIG_BLOCK,
                ack
            );
        }

        let mut block = [0u8; CONFIG_READ_SIZE];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = self.transport.read_byte()?;
            if !self.report(i + 1, CONFIG_READ_SIZE) {
                return Err(ProtocolError::Cancelled.into());
            }
        }
        log::debug!("config block: {}", hex::encode(block));

        if !self.chip.is_16bit() {
            let id_base = self.chip.id_start()?;
            for k in 0..4u32 {
                image.set(id_base + k, u16::from(block[2 + k as usize]));
            }
        }
        for k in 0..usize::from(self.chip.num_config_words) {
            let word = u16::from_le_bytes([block[10 + 2 * k], block[10 + 2 * k + 1]]);
            image.set(config_base + k as u32, word);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::transport::mock::MockTransport;

    fn chip(core: &str, rom: &str, eeprom: &str, nconfig: &str) -> ChipProfile {
        let mut p = ChipProfile::default();
        for (k, v) in [
            ("Name", "TESTCHIP"),
            ("CoreType", core),
            ("NumROMWords", rom),
            ("NumEEPROMBytes", eeprom),
            ("NumConfigWords", nconfig),
        ] {
            p.set(k, v).unwrap();
        }
        p
    }

    fn programmer(
        script: &[u8],
        profile: ChipProfile,
    ) -> Programmer<MockTransport> {
        Programmer::new(MockTransport::with_reads(script), profile).unwrap()
    }

    #[test]
    fn command_table_matches_the_wire_protocol() {
        assert_eq!(Command::Reset.code(), 0x01);
        assert_eq!(Command::InitVars.code(), 0x03);
        assert_eq!(Command::WriteRom.code(), 0x07);
        assert_eq!(Command::WriteEeprom.code(), 0x08);
        assert_eq!(Command::WriteConfig.code(), 0x09);
        assert_eq!(Command::ReadRom.code(), 0x0b);
        assert_eq!(Command::Erase.code(), 0x0e);
        assert_eq!(Command::WriteFuse.code(), 0x11);
        assert_eq!(Command::GetProtocol.code(), 0x15);
        assert_eq!(Command::Erase.ack(), Some(b'Y'));
        assert_eq!(Command::PowerOff.ack(), Some(b'v'));
        assert_eq!(Command::WriteRom.ack(), None);
    }

    #[test]
    fn hard_reset_learns_firmware_and_polarity() {
        let mut prog = programmer(b"B\x03", chip("bit14_B", "2048", "128", "1"));
        assert!(prog.hard_reset().unwrap());
        assert_eq!(prog.firmware(), Some(Firmware::Kit150));
        assert_eq!(prog.transport.power_line, vec![true, false]);

        // A K149 assumption flips the polarity of the next attempt
        let mut prog = programmer(b"B\x01", chip("bit14_B", "2048", "128", "1"));
        prog.assume_k149();
        assert!(prog.hard_reset().unwrap());
        assert_eq!(prog.transport.power_line, vec![false, true]);
        assert_eq!(prog.firmware(), Some(Firmware::Kit149A));
    }

    #[test]
    fn init_program_vars_byte_layout() {
        let mut profile = chip("bit16_A", "4096", "128", "7");
        profile.set("ProgramDelay", "5").unwrap();
        profile.set("PowerSequence", "VccVpp1").unwrap();
        profile.set("EraseMode", "1").unwrap();
        profile.set("ProgramTries", "2").unwrap();
        profile.set("OverProgram", "3").unwrap();
        profile.set("CALword", "Y").unwrap();
        profile.set("FastPowerSequence", "1").unwrap();

        let mut prog = programmer(b"I", profile);
        prog.init_program_vars().unwrap();
        assert_eq!(
            prog.transport.written,
            // cmd, rom BE, eeprom BE, core, flags(cal|single-panel|fast), 5 parameter bytes
            [0x03, 0x10, 0x00, 0x00, 0x80, 0x01, 0x01 | 0x04 | 0x08, 5, 1, 1, 2, 3]
        );
    }

    #[test]
    fn write_rom_sends_exactly_the_announced_bytes() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut image = HexImage::new();
        image.set(0x0010, 0x1234);

        let mut prog = programmer(b"YYP", profile);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = calls.clone();
        prog.set_progress(move |at, total| {
            seen.borrow_mut().push((at, total));
            true
        });
        prog.write_rom(&mut image).unwrap();

        let written = &prog.transport.written;
        // Size = 2 * (1 + 0x10) = 0x22 bytes, big-endian after the command
        assert_eq!(&written[..3], &[0x07, 0x00, 0x22]);
        // Two 16-word chunks of two bytes each
        assert_eq!(written.len(), 3 + 64);
        // Unpopulated words go out as the 14-bit blank, low byte first
        assert_eq!(&written[3..7], &[0xFF, 0x3F, 0xFF, 0x3F]);
        // Word 0x0010 leads the second chunk
        assert_eq!(&written[3 + 32..3 + 34], &[0x34, 0x12]);
        assert_eq!(*calls.borrow(), vec![(16, 17), (17, 17), (17, 17)]);
    }

    #[test]
    fn write_rom_cancels_after_the_second_chunk() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut image = HexImage::new();
        for i in 0..160u32 {
            image.set(i, i as u16);
        }

        // Ten chunks' worth of prompts queued up
        let mut prog = programmer(b"YYYYYYYYYY", profile);
        let mut calls = 0usize;
        prog.set_progress(move |_, _| {
            calls += 1;
            calls < 2
        });
        let err = prog.write_rom(&mut image).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Cancelled)
        ));
        // Exactly two chunks were transmitted and no third prompt was read
        assert_eq!(prog.transport.written.len(), 3 + 2 * 32);
        assert_eq!(prog.transport.reads.len(), 8);
    }

    #[test]
    fn write_rom_surfaces_the_nack_diagnostic() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut image = HexImage::new();
        image.set(0, 0x3000);

        let mut prog = programmer(b"Y", profile);
        prog.transport.feed(&[b'N', 0x01, 0x23, 0x3F, 0xAB]);
        let err = prog.write_rom(&mut image).unwrap_err();
        match err.downcast_ref::<ProtocolError>() {
            Some(ProtocolError::DeviceNack { address, word }) => {
                assert_eq!(*address, 0x0123);
                assert_eq!(*word, 0x3FAB);
            }
            other => panic!("expected DeviceNack, got {:?}", other),
        }
    }

    #[test]
    fn write_rom_rejects_unexpected_prompts() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut image = HexImage::new();
        image.set(0, 1);

        let mut prog = programmer(b"?", profile);
        let err = prog.write_rom(&mut image).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedResponse { got: b'?', .. })
        ));
    }

    #[test]
    fn write_eeprom_rounds_size_up_to_even() {
        let profile = chip("bit14_B", "2048", "256", "1");
        let mut image = HexImage::new();
        image.set(0x2100, 0x00AB);

        let mut prog = programmer(b"YP", profile);
        prog.write_eeprom(&mut image).unwrap();
        // One populated byte still announces a 2-byte transfer
        assert_eq!(
            prog.transport.written,
            [0x08, 0x00, 0x02, 0xAB, 0xFF]
        );
    }

    #[test]
    fn stages_config_words_only_when_set() {
        let profile = chip("bit14_B", "2048", "128", "2");
        let mut image = HexImage::new();
        image.set(0x2007, 0x3F10);
        // 0x2008 left unset; ID locations left unset

        let mut prog = programmer(b"Y", profile);
        prog.write_config(&image).unwrap();

        let written = &prog.transport.written;
        assert_eq!(&written[..3], &[0x09, b'0', b'0']);
        let stage = &written[3..];
        assert_eq!(stage.len(), 22);
        assert_eq!(&stage[..4], &[0xFF; 4]);
        assert_eq!(&stage[4..8], b"FFFF");
        assert_eq!(&stage[8..12], &[0x10, 0x3F, 0xFF, 0xFF]);
        assert_eq!(&stage[12..], &[0xFF; 10]);
    }

    #[test]
    fn stages_id_words_when_present() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut image = HexImage::new();
        for k in 0..4u32 {
            image.set(0x2000 + k, 0x0030 + k as u16);
        }

        let mut prog = programmer(b"Y", profile);
        prog.write_config(&image).unwrap();
        assert_eq!(&prog.transport.written[3..7], &[0x30, 0x31, 0x32, 0x33]);
    }

    #[test]
    fn sixteen_bit_cores_write_config_then_fuses() {
        let profile = chip("bit16_B", "16384", "256", "7");
        let mut image = HexImage::new();
        image.set(0x30000, 0xC200);

        let mut prog = programmer(b"YY", profile);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = calls.clone();
        prog.set_progress(move |at, total| {
            seen.borrow_mut().push((at, total));
            true
        });
        prog.write_config(&image).unwrap();

        let written = &prog.transport.written;
        assert_eq!(written.len(), 2 * 25);
        assert_eq!(&written[..3], &[0x09, b'0', b'0']);
        assert_eq!(&written[25..28], &[0x11, b'0', b'0']);
        // Both passes carry the identical stage
        assert_eq!(&written[3..25], &written[28..50]);
        assert_eq!(written[3 + 8], 0x00);
        assert_eq!(written[3 + 9], 0xC2);
        let calls = calls.borrow();
        assert_eq!(calls.len(), 2 * 22 + 1);
        assert_eq!(calls[0], (3, 50));
        assert_eq!(*calls.last().unwrap(), (50, 50));
    }

    #[test]
    fn read_rom_repacks_words() {
        let profile = chip("bit14_B", "4", "64", "1");
        let mut prog = programmer(
            &[0x34, 0x12, 0xFF, 0x3F, 0x00, 0x00, 0xCD, 0x2A],
            profile,
        );
        prog.transport.written.clear();
        let mut image = HexImage::new();
        prog.read_rom(&mut image).unwrap();
        assert_eq!(prog.transport.written, [0x0b]);
        assert_eq!(image.lookup(0), Some(0x1234));
        assert_eq!(image.lookup(1), Some(0x3FFF));
        assert_eq!(image.lookup(2), Some(0x0000));
        assert_eq!(image.lookup(3), Some(0x2ACD));
    }

    #[test]
    fn read_eeprom_scatters_bytes() {
        let profile = chip("bit14_B", "2048", "4", "1");
        let mut prog = programmer(&[0xDE, 0xAD, 0xBE, 0xEF], profile);
        let mut image = HexImage::new();
        prog.read_eeprom(&mut image).unwrap();
        assert_eq!(image.lookup(0x2100), Some(0x00DE));
        assert_eq!(image.lookup(0x2103), Some(0x00EF));
    }

    #[test]
    fn read_config_scatters_id_and_config_words() {
        let profile = chip("bit14_B", "2048", "128", "2");
        let mut script = vec![b'C'];
        let mut block = [0u8; 26];
        block[2..6].copy_from_slice(&[0x30, 0x31, 0x32, 0x33]);
        block[10] = 0x10;
        block[11] = 0x3F;
        block[12] = 0x55;
        block[13] = 0x2A;
        script.extend_from_slice(&block);

        let mut prog = programmer(&script, profile);
        let mut image = HexImage::new();
        prog.read_config(&mut image).unwrap();
        assert_eq!(image.lookup(0x2000), Some(0x0030));
        assert_eq!(image.lookup(0x2003), Some(0x0033));
        assert_eq!(image.lookup(0x2007), Some(0x3F10));
        assert_eq!(image.lookup(0x2008), Some(0x2A55));
    }

    #[test]
    fn read_config_tolerates_a_bad_header_ack() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut script = vec![b'x'];
        script.extend_from_slice(&[0u8; 26]);
        let mut prog = programmer(&script, profile);
        let mut image = HexImage::new();
        prog.read_config(&mut image).unwrap();
        assert_eq!(image.lookup(0x2007), Some(0x0000));
    }

    #[test]
    fn simple_commands_check_their_acks() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut prog = programmer(b"VvVY", profile);
        prog.chip_power_on().unwrap();
        prog.chip_power_off().unwrap();
        prog.chip_power_cycle().unwrap();
        prog.erase_chip().unwrap();

        let mut prog = programmer(b"x", chip("bit14_B", "2048", "128", "1"));
        let err = prog.chip_power_on().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedResponse {
                command: Command::PowerOn,
                expected: b'V',
                got: b'x',
            })
        ));
    }

    #[test]
    fn session_probes() {
        let profile = chip("bit14_B", "2048", "128", "1");
        let mut prog = programmer(b"PQP018A\x00\x42", profile);
        assert!(prog.command_mode().unwrap());
        assert!(prog.soft_reset().unwrap());
        assert_eq!(prog.get_protocol().unwrap(), "P018");
        assert!(prog.detect_chip().unwrap());
        assert_eq!(prog.get_version().unwrap(), 0x42);

        let mut prog = programmer(b"x", chip("bit14_B", "2048", "128", "1"));
        assert!(!prog.detect_chip().unwrap());
    }
}
