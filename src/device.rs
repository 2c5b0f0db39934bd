//! PIC chip parameter model, with the chipinfo key/value parser and the
//! embedded device database.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Native word width class of a core family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    W12,
    W14,
    W16,
}

impl WordWidth {
    pub const fn bits(self) -> u8 {
        match self {
            WordWidth::W12 => 12,
            WordWidth::W14 => 14,
            WordWidth::W16 => 16,
        }
    }

    /// Value of an erased word of this width.
    pub const fn blank(self) -> u16 {
        match self {
            WordWidth::W12 => 0x0FFF,
            WordWidth::W14 => 0x3FFF,
            WordWidth::W16 => 0xFFFF,
        }
    }
}

/// Core family tags, numbered as `init_program_vars` transmits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreFamily {
    /// 18F6x2x
    Bit16C = 0,
    /// 18Fx230/x330, programs as a single panel
    Bit16A = 1,
    /// 18Fxx2/xx8
    Bit16B = 2,
    /// 16F87/88
    Bit14G = 3,
    /// 12C50x
    Bit12A = 4,
    /// 12C67x, 16C50x, 16Cxxx
    Bit14A = 5,
    /// 16C8x, 16F8x, 16F87x, 16F62x
    Bit14B = 6,
    /// 16F7x, 16F7x7
    Bit14C = 7,
    /// 12F67x
    Bit14D = 8,
    /// 16F87x-A
    Bit14E = 9,
    /// 16F818
    Bit14F = 10,
    /// 16F57
    Bit12B = 11,
    /// 10Fxxx
    Bit10A = 12,
}

/// Base address of the four ID locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdBase {
    Fixed(u32),
    /// ID locations immediately follow the program words.
    AfterRom,
}

/// Per-family constants consumed by the codec and the protocol driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreParams {
    pub width: WordWidth,
    pub blank: u16,
    pub eeprom_base: u32,
    pub config_base: u32,
    pub id_base: IdBase,
}

impl CoreFamily {
    /// Parse a chipinfo `CoreType` value.
    pub fn from_chipinfo(value: &str) -> Option<CoreFamily> {
        Some(match value {
            "bit16_C" => CoreFamily::Bit16C,
            "bit16_A" => CoreFamily::Bit16A,
            "bit16_B" => CoreFamily::Bit16B,
            "bit14_G" => CoreFamily::Bit14G,
            "bit12_A" => CoreFamily::Bit12A,
            "bit14_A" => CoreFamily::Bit14A,
            "bit14_B" => CoreFamily::Bit14B,
            "bit14_C" => CoreFamily::Bit14C,
            "bit14_D" => CoreFamily::Bit14D,
            "bit14_E" => CoreFamily::Bit14E,
            "bit14_F" => CoreFamily::Bit14F,
            "bit12_B" => CoreFamily::Bit12B,
            // 10F parts are filed under a 14-bit key in chipinfo files
            "bit14_H" => CoreFamily::Bit10A,
            _ => return None,
        })
    }

    /// Wire tag sent to the programmer.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The one table mapping a family to its width, blank value and base
    /// addresses.
    pub const fn params(self) -> CoreParams {
        use CoreFamily::*;
        let width = match self {
            Bit16A | Bit16B | Bit16C => WordWidth::W16,
            Bit12A | Bit12B | Bit10A => WordWidth::W12,
            Bit14A | Bit14B | Bit14C | Bit14D | Bit14E | Bit14F | Bit14G => WordWidth::W14,
        };
        let (eeprom_base, config_base, id_base) = match width {
            WordWidth::W16 => (0xF0000, 0x30000, IdBase::Fixed(0)),
            WordWidth::W12 => (0x2100, 0x2007, IdBase::AfterRom),
            WordWidth::W14 => (0x2100, 0x2007, IdBase::Fixed(0x2000)),
        };
        CoreParams {
            width,
            blank: width.blank(),
            eeprom_base,
            config_base,
            id_base,
        }
    }

    /// 18Fx230/x330 parts program as one panel instead of two.
    pub const fn single_panel(self) -> bool {
        matches!(self, CoreFamily::Bit16A)
    }
}

/// Vcc/Vpp ordering applied when programming voltages come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerSequence {
    #[default]
    Vcc = 0,
    VccVpp1 = 1,
    VccVpp2 = 2,
    Vpp1Vcc = 3,
    Vpp2Vcc = 4,
}

impl PowerSequence {
    pub fn from_chipinfo(value: &str) -> Option<PowerSequence> {
        Some(match value {
            "Vcc" => PowerSequence::Vcc,
            "VccVpp1" => PowerSequence::VccVpp1,
            "VccVpp2" => PowerSequence::VccVpp2,
            "Vpp1Vcc" => PowerSequence::Vpp1Vcc,
            "Vpp2Vcc" => PowerSequence::Vpp2Vcc,
            _ => return None,
        })
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized chipinfo key {key:?}")]
pub struct UnrecognizedKey {
    pub key: String,
}

/// Everything the driver needs to know about one target device.
///
/// Built empty and populated one `set(key, value)` at a time from whatever
/// backs the chipinfo data; immutable for the rest of the session.
#[derive(Debug, Clone, Default)]
pub struct ChipProfile {
    pub name: String,
    pub chip_id: u16,
    /// ROM size in words.
    pub rom_size: u32,
    /// EEPROM size in bytes.
    pub eeprom_size: u16,
    pub num_config_words: u8,
    pub fuse_blank: u16,
    pub core: Option<CoreFamily>,
    pub program_delay: u8,
    pub erase_mode: u8,
    pub power_sequence: PowerSequence,
    pub program_tries: u8,
    pub over_program: u8,
    pub cal_word: bool,
    pub band_gap: bool,
    pub fast_power: bool,
}

impl ChipProfile {
    /// Accumulate one chipinfo parameter. Unknown keys are rejected;
    /// unparseable values leave the field at its default.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), UnrecognizedKey> {
        match key {
            "CHIPname" | "Name" => self.name = value.to_string(),
            "ChipID" => self.chip_id = u16::from_str_radix(value, 16).unwrap_or(self.chip_id),
            "NumROMWords" => self.rom_size = value.parse().unwrap_or(self.rom_size),
            "NumEEPROMBytes" => self.eeprom_size = value.parse().unwrap_or(self.eeprom_size),
            "NumConfigWords" => {
                self.num_config_words = value.parse().unwrap_or(self.num_config_words)
            }
            "FUSEblank" => {
                self.fuse_blank = u16::from_str_radix(value, 16).unwrap_or(self.fuse_blank)
            }
            "CoreType" => {
                if let Some(core) = CoreFamily::from_chipinfo(value) {
                    self.core = Some(core);
                }
            }
            "EraseMode" => self.erase_mode = value.parse().unwrap_or(self.erase_mode),
            "PowerSequence" => {
                if let Some(seq) = PowerSequence::from_chipinfo(value) {
                    self.power_sequence = seq;
                }
            }
            "FastPowerSequence" => self.fast_power = value == "1",
            "ProgramDelay" => self.program_delay = value.parse().unwrap_or(self.program_delay),
            "ProgramTries" => self.program_tries = value.parse().unwrap_or(self.program_tries),
            "OverProgram" => self.over_program = value.parse().unwrap_or(self.over_program),
            "CALword" => self.cal_word = value == "Y",
            "BandGap" => self.band_gap = value == "Y",
            // Known keys with no bearing on programming
            "INCLUDE" | "SocketImage" | "SocketImageType" | "FlashChip" | "FlashROM"
            | "CPwarn" | "ICSPonly" | "Type" | "ChipID1" | "NumPayloadBits"
            | "NumPayloadCommandBits" | "Status" | "ID" | "CreateTimeStamp" => {}
            _ if key.starts_with("ConfigWordDescriptions") => {}
            _ => {
                return Err(UnrecognizedKey {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    pub fn core_family(&self) -> Result<CoreFamily> {
        self.core
            .with_context(|| format!("chip profile {:?} has no CoreType", self.name))
    }

    pub fn is_14bit(&self) -> bool {
        matches!(self.core.map(|c| c.params().width), Some(WordWidth::W14))
    }

    pub fn is_16bit(&self) -> bool {
        matches!(self.core.map(|c| c.params().width), Some(WordWidth::W16))
    }

    pub fn single_panel(&self) -> bool {
        self.core.is_some_and(CoreFamily::single_panel)
    }

    pub fn blank_value(&self) -> Result<u16> {
        Ok(self.core_family()?.params().blank)
    }

    pub fn eeprom_start(&self) -> Result<u32> {
        Ok(self.core_family()?.params().eeprom_base)
    }

    pub fn config_start(&self) -> Result<u32> {
        Ok(self.core_family()?.params().config_base)
    }

    pub fn id_start(&self) -> Result<u32> {
        Ok(match self.core_family()?.params().id_base {
            IdBase::Fixed(base) => base,
            IdBase::AfterRom => self.rom_size,
        })
    }

    pub fn rom_end(&self) -> u32 {
        self.rom_size
    }

    pub fn eeprom_end(&self) -> Result<u32> {
        Ok(self.eeprom_start()? + u32::from(self.eeprom_size))
    }

    pub fn config_end(&self) -> Result<u32> {
        Ok(self.config_start()? + u32::from(self.num_config_words))
    }

    /// A profile is usable once it names a part, a core family and a ROM
    /// geometry.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.name.is_empty(), "chip profile has no name");
        self.core_family()?;
        anyhow::ensure!(
            self.rom_size > 0,
            "chip profile {:?} has no ROM geometry",
            self.name
        );
        Ok(())
    }
}

/// One device's chipinfo entry: a flat map of string keys to string values,
/// exactly as the external parameter source supplies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbEntry {
    #[serde(flatten)]
    keys: BTreeMap<String, String>,
}

impl DbEntry {
    pub fn name(&self) -> &str {
        self.keys
            .get("Name")
            .or_else(|| self.keys.get("CHIPname"))
            .map(String::as_str)
            .unwrap_or("")
    }
}

pub struct ChipDb {
    entries: Vec<DbEntry>,
}

impl ChipDb {
    /// The database shipped with the binary.
    pub fn load() -> Result<ChipDb> {
        Self::parse(include_str!("../devices/chipinfo.yaml"))
    }

    /// A user-supplied chipinfo file in the same format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ChipDb> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("cannot read chipinfo {}", path.as_ref().display()))?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<ChipDb> {
        Ok(ChipDb {
            entries: serde_yaml::from_str(raw).context("malformed chipinfo database")?,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(DbEntry::name)
    }

    /// Build a validated profile for the named device. Unrecognized keys
    /// are logged and skipped so a newer chipinfo file still loads.
    pub fn find(&self, name: &str) -> Result<ChipProfile> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
            .with_context(|| format!("chip {:?} not found in the chipinfo database", name))?;

        let mut profile = ChipProfile::default();
        for (key, value) in &entry.keys {
            if value.is_empty() {
                continue;
            }
            if let Err(e) = profile.set(key, value) {
                log::warn!("{}: {}", entry.name(), e);
            }
        }
        profile.validate()?;
        Ok(profile)
    }
}
