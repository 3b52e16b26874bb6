//! Block access seam between a SCSI/BOT mass-storage class and the drive.

/// Why a block access failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockDeviceError {
    /// The medium is ejected, the host should retry later.
    #[error("medium not present")]
    MediaNotReady,

    /// Address is invalid or out of range
    #[error("logical block address out of range")]
    InvalidAddress,
}

/// A device addressed in fixed-size blocks.
pub trait BlockDevice {
    /// The number of bytes per block. This determines the size of the buffer passed
    /// to read/write functions
    const BLOCK_BYTES: usize;

    /// Read the block indicated by `lba` into the provided buffer
    fn read_block(&self, lba: u32, block: &mut [u8]) -> Result<(), BlockDeviceError>;

    /// Write the `block` buffer to the block indicated by `lba`
    fn write_block(&mut self, lba: u32, block: &[u8]) -> Result<(), BlockDeviceError>;

    /// Get the maximum valid lba (logical block address)
    fn max_lba(&self) -> u32;
}
