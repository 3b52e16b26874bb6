//! Debug transport to the target MCU, provided by the board.

/// Requested target reset and debug state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetState {
    /// Hold in reset.
    ResetHold,
    /// Reset and halt, ready for flash programming.
    ResetProgram,
    /// Reset and run.
    ResetRun,
    /// Reset and run with the debug port attached.
    ResetRunWithDebug,
    /// Release the debug port.
    NoDebug,
    /// Attach the debug port.
    Debug,
}

/// SWD/JTAG access to the target.
pub trait TargetDebug {
    /// Move the target into `state`. Returns `false` if the target did not respond.
    fn set_state(&mut self, state: TargetState) -> bool;

    /// Bring up the debug port.
    fn swd_init(&mut self) -> bool {
        true
    }

    /// Unique id of this probe, as sent over the virtual COM port.
    fn unique_id(&self) -> &str;
}
