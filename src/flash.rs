//! Target flash backend contract and image format detection.

use core::ops::RangeInclusive;

/// Firmware image encodings the drive can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ImageFormat {
    /// Raw binary, written from the start of target flash.
    Bin,
    /// Intel hex records.
    Hex,
}

impl ImageFormat {
    /// Format implied by a short name extension, if it is a known one.
    pub fn from_extension(ext: &[u8]) -> Option<Self> {
        if ext.eq_ignore_ascii_case(b"BIN") {
            Some(Self::Bin)
        } else if ext.eq_ignore_ascii_case(b"HEX") {
            Some(Self::Hex)
        } else {
            None
        }
    }
}

/// Non-error outcome of programming a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageStatus {
    /// Accepted, more data expected.
    Ok,
    /// The hex end-of-file record was reached.
    HexEof,
}

/// Why a transfer failed. The message is what `FAIL.TXT` shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Target could not be reset or halted.
    #[error("The interface firmware FAILED to reset/halt the target MCU")]
    Reset,
    /// Flash algorithm could not be loaded.
    #[error("The interface firmware FAILED to download the flash programming algorithms to the target MCU")]
    AlgoDownload,
    /// Page data could not be loaded.
    #[error("The interface firmware FAILED to download the flash data contents to be programmed")]
    AlgoDataSequence,
    /// Flash algorithm init failed.
    #[error("The interface firmware FAILED to initialize the target MCU")]
    Init,
    /// Image would lock the part.
    #[error("The interface firmware ABORTED programming. Image is trying to set security bits")]
    SecurityBits,
    /// Flash could not be unlocked.
    #[error("The interface firmware FAILED to unlock the target for programming")]
    Unlock,
    /// Sector erase failed.
    #[error("Flash algorithm erase sector command FAILURE")]
    EraseSector,
    /// Chip erase failed.
    #[error("Flash algorithm erase all command FAILURE")]
    EraseAll,
    /// Page program failed.
    #[error("Flash algorithm write command FAILURE")]
    Write,
    /// Address or buffer not aligned for the algorithm.
    #[error("Flash program address and data buffer unaligned")]
    WriteUnaligned,
    /// Image does not look like an application.
    #[error("The application file format is unknown and cannot be parsed and/or processed.")]
    UnknownAppFormat,
    /// Hex record checksum mismatch.
    #[error("The hex file cannot be decoded. Checksum calculation failure occurred.")]
    HexChecksum,
    /// Malformed hex record.
    #[error("The hex file cannot be decoded. Parser logic failure occurred.")]
    HexParser,
    /// Hex record could not be programmed.
    #[error("The hex file cannot be programmed. Logic failure occurred.")]
    HexProgram,
    /// Hex record outside target flash.
    #[error("The hex file you dropped isn't compatible with this mode or device. Are you in MAINTENANCE mode? See HELP FAQ.HTM")]
    HexInvalidAddress,
    /// Hex image does not start at the application offset.
    #[error("The hex file offset load address is not correct .")]
    HexInvalidAppOffset,
    /// Binary larger than target flash.
    #[error("The binary file is too large.")]
    BinInvalidAddress,
    /// No progress before the remount timer ran out.
    #[error("The transfer timed out.")]
    TransferInProgress,
    /// File metadata changed under a running transfer.
    #[error("An error occurred during the transfer")]
    ErrorDuringTransfer,
    /// File size smaller than the data already programmed.
    #[error("The file size does not match the data already transferred.")]
    InconsistentSize,
}

/// Programs a target from a streamed image.
///
/// Calls arrive from task context, one at a time; each may take milliseconds.
pub trait FlashTarget {
    /// Prepare the target for an image of `format`.
    fn init(&mut self, format: ImageFormat) -> Result<(), FlashError>;

    /// Program `data` at byte `offset` from the start of the image.
    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<PageStatus, FlashError>;

    /// Release the target once a transfer ends.
    fn uninit(&mut self) -> Result<(), FlashError> {
        Ok(())
    }
}

/// Recognises the first block of a flashable image.
pub trait ImageDetector {
    /// Format of the image starting with `block`, if recognised.
    fn detect(&self, block: &[u8]) -> Option<ImageFormat>;
}

impl<F: Fn(&[u8]) -> Option<ImageFormat>> ImageDetector for F {
    fn detect(&self, block: &[u8]) -> Option<ImageFormat> {
        self(block)
    }
}

/// Cortex-M vector table check: initial stack pointer inside RAM, reset,
/// NMI and HardFault handlers inside flash.
#[derive(Debug, Clone)]
pub struct VectorTableDetector {
    /// Target RAM addresses.
    pub ram: RangeInclusive<u32>,
    /// Target flash addresses.
    pub flash: RangeInclusive<u32>,
}

impl ImageDetector for VectorTableDetector {
    fn detect(&self, block: &[u8]) -> Option<ImageFormat> {
        let mut words = block
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        let sp = words.next()?;
        if !self.ram.contains(&sp) {
            return None;
        }
        for _ in 0..3 {
            if !self.flash.contains(&words.next()?) {
                return None;
            }
        }
        Some(ImageFormat::Bin)
    }
}

/// Intel hex check: a record start followed by a known record type.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexRecordDetector;

impl ImageDetector for HexRecordDetector {
    fn detect(&self, block: &[u8]) -> Option<ImageFormat> {
        // ':' LL AAAA TT, the low digit of the type sits at offset 8
        match block {
            [b':', _, _, _, _, _, _, b'0', b'0' | b'2' | b'3' | b'4' | b'5', ..] => Some(ImageFormat::Hex),
            _ => None,
        }
    }
}

/// Vector table first, then hex.
#[derive(Debug, Clone)]
pub struct DefaultDetector {
    /// Binary image check.
    pub vectors: VectorTableDetector,
}

impl ImageDetector for DefaultDetector {
    fn detect(&self, block: &[u8]) -> Option<ImageFormat> {
        self.vectors.detect(block).or_else(|| HexRecordDetector.detect(block))
    }
}
