//! Runtime configuration consumed by the drive and the serial port.

/// Settings store. Boards with persistent storage implement this over their
/// config sector; [`RamSettings`] keeps everything in RAM.
pub trait Settings {
    /// Reset the target after a successful transfer.
    fn auto_reset(&self) -> bool;
    /// Change [`Settings::auto_reset`].
    fn set_auto_reset(&mut self, on: bool);
    /// Mark dropped serial data in the receive stream.
    fn overflow_detect(&self) -> bool;
    /// Change [`Settings::overflow_detect`].
    fn set_overflow_detect(&mut self, on: bool);
    /// Stay in the bootloader across the next restart.
    fn hold_in_bootloader(&self) -> bool;
    /// Change [`Settings::hold_in_bootloader`].
    fn set_hold_in_bootloader(&mut self, on: bool);
}

/// Volatile settings, lost on power cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RamSettings {
    /// See [`Settings::auto_reset`].
    pub auto_reset: bool,
    /// See [`Settings::overflow_detect`].
    pub overflow_detect: bool,
    /// See [`Settings::hold_in_bootloader`].
    pub hold_in_bootloader: bool,
}

impl Settings for RamSettings {
    fn auto_reset(&self) -> bool {
        self.auto_reset
    }

    fn set_auto_reset(&mut self, on: bool) {
        self.auto_reset = on;
    }

    fn overflow_detect(&self) -> bool {
        self.overflow_detect
    }

    fn set_overflow_detect(&mut self, on: bool) {
        self.overflow_detect = on;
    }

    fn hold_in_bootloader(&self) -> bool {
        self.hold_in_bootloader
    }

    fn set_hold_in_bootloader(&mut self, on: bool) {
        self.hold_in_bootloader = on;
    }
}
