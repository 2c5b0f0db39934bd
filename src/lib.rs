//! Kitsrus P018 programmer protocol implementation.

pub mod constants;
pub mod device;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod transport;

pub use self::device::{ChipDb, ChipProfile, CoreFamily};
pub use self::flashing::Flashing;
pub use self::format::HexImage;
pub use self::protocol::{Command, Firmware, Programmer};
pub use self::transport::Transport;
