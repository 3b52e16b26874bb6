//! Streaming of a dropped firmware image into the flash backend.
//!
//! The host writes file content and the directory entry describing it in any
//! order. Content is recognised by its first block, programmed strictly in
//! sector order, and reconciled against the size from the directory entry
//! whenever that shows up.

use log::{debug, trace, warn};

use crate::flash::{FlashError, FlashTarget, ImageDetector, ImageFormat, PageStatus};
use crate::vfs::{FileHandle, SECTOR_SIZE};

/// Where a transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    /// No content written since the volume was built.
    Idle,
    /// Content written, none of it recognised yet.
    Detecting,
    /// An image is being programmed.
    Streaming,
    /// Programming finished.
    Completed,
    /// Programming stopped with an error.
    Failed(FlashError),
}

/// Outcome to report if the host stops writing now; the caller arms its
/// remount timer with it.
pub type Verdict = Option<Result<(), FlashError>>;

/// State of the one transfer a mounted volume accepts.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    format: Option<ImageFormat>,
    file: Option<FileHandle>,
    start_sector: Option<u32>,
    next_sector: u32,
    size: Option<u32>,
    written: u32,
    seen: bool,
    started: bool,
    initialised: bool,
    finished: bool,
    outcome: Result<(), FlashError>,
}

impl Default for FileTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTransfer {
    /// Nothing transferred yet.
    pub const fn new() -> Self {
        Self {
            format: None,
            file: None,
            start_sector: None,
            next_sector: 0,
            size: None,
            written: 0,
            seen: false,
            started: false,
            initialised: false,
            finished: false,
            outcome: Ok(()),
        }
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        if self.finished {
            match self.outcome {
                Ok(()) => TransferState::Completed,
                Err(e) => TransferState::Failed(e),
            }
        } else if self.started {
            TransferState::Streaming
        } else if self.seen {
            TransferState::Detecting
        } else {
            TransferState::Idle
        }
    }

    /// No further data is accepted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes handed to the flash backend.
    pub fn bytes_written(&self) -> u32 {
        self.written
    }

    /// Sector the next accepted block must come from.
    pub fn next_sector(&self) -> u32 {
        self.next_sector
    }

    /// First sector of the image, once known.
    pub fn start_sector(&self) -> Option<u32> {
        self.start_sector
    }

    /// Format of the image, once known.
    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    /// Handle content blocks the host wrote at `sector`.
    pub fn on_sectors<D, F>(&mut self, sector: u32, data: &[u8], detector: &D, flash: &mut F) -> Verdict
    where
        D: ImageDetector + ?Sized,
        F: FlashTarget + ?Sized,
    {
        if self.finished || data.is_empty() {
            return None;
        }
        self.seen = true;

        let mut verdict = None;
        if !self.started {
            let first = &data[..data.len().min(SECTOR_SIZE)];
            let format = detector.detect(first)?;
            debug!("transfer: {:?} image starts at sector {}", format, sector);
            self.started = true;
            self.written = 0;
            self.next_sector = sector;
            verdict = self.update_info(format, None, Some(sector), None, flash);
            if self.finished {
                return verdict;
            }
            let status = flash.init(format).map(|()| PageStatus::Ok);
            self.initialised = status.is_ok();
            verdict = self.update_state(status, flash);
            if self.finished {
                return verdict;
            }
        }

        if sector != self.next_sector {
            trace!("transfer: sector {} out of order, expecting {}", sector, self.next_sector);
            return verdict;
        }

        let start = self.start_sector.unwrap_or(sector);
        let offset = (sector - start) * SECTOR_SIZE as u32;
        let status = flash.program_page(offset, data);
        self.written += data.len() as u32;
        self.next_sector += ((data.len() + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32;
        self.update_state(status, flash)
    }

    /// Handle a directory entry for a `BIN` or `HEX` file.
    ///
    /// `size` of zero means not yet known, `start_sector` is `None` while the
    /// entry has no cluster.
    pub fn on_file_info<F: FlashTarget + ?Sized>(
        &mut self,
        format: ImageFormat,
        file: FileHandle,
        start_sector: Option<u32>,
        size: u32,
        flash: &mut F,
    ) -> Verdict {
        if self.finished {
            return None;
        }
        let size = (size != 0).then_some(size);
        self.update_info(format, Some(file), start_sector, size, flash)
    }

    fn update_info<F: FlashTarget + ?Sized>(
        &mut self,
        format: ImageFormat,
        file: Option<FileHandle>,
        start_sector: Option<u32>,
        size: Option<u32>,
        flash: &mut F,
    ) -> Verdict {
        let current_format = *self.format.get_or_insert(format);
        if self.file.is_none() {
            self.file = file;
        }
        if self.start_sector.is_none() {
            self.start_sector = start_sector;
        }

        let check = if format != current_format {
            warn!("transfer: format changed from {:?} to {:?}", current_format, format);
            Err(FlashError::ErrorDuringTransfer)
        } else if file.is_some() && file != self.file {
            warn!("transfer: file changed from {:?} to {:?}", self.file, file);
            Err(FlashError::ErrorDuringTransfer)
        } else if matches!((size, self.size), (Some(new), Some(old)) if new < old) {
            warn!("transfer: size shrank from {:?} to {:?}", self.size, size);
            Err(FlashError::ErrorDuringTransfer)
        } else if matches!(size, Some(size) if round_up(size) < self.written) {
            warn!("transfer: size {:?} below {} bytes already written", size, self.written);
            Err(FlashError::InconsistentSize)
        } else if start_sector.is_some() && start_sector != self.start_sector {
            warn!("transfer: start moved from {:?} to {:?}", self.start_sector, start_sector);
            Err(FlashError::ErrorDuringTransfer)
        } else {
            Ok(())
        };

        if size.is_some() {
            self.size = size;
        }
        self.update_state(check.map(|()| PageStatus::Ok), flash)
    }

    fn update_state<F: FlashTarget + ?Sized>(&mut self, status: Result<PageStatus, FlashError>, flash: &mut F) -> Verdict {
        match status {
            Err(e) => Some(self.complete(Err(e), flash)),
            Ok(PageStatus::HexEof) => Some(self.complete(Ok(()), flash)),
            Ok(PageStatus::Ok) => match self.size {
                Some(size) if self.started && self.written >= size => Some(self.complete(Ok(()), flash)),
                _ => Some(Err(FlashError::TransferInProgress)),
            },
        }
    }

    /// End the transfer with `outcome`, releasing the flash backend if it was
    /// set up. Nothing is accepted afterwards.
    pub fn complete<F: FlashTarget + ?Sized>(&mut self, outcome: Result<(), FlashError>, flash: &mut F) -> Result<(), FlashError> {
        self.finished = true;
        let released = if core::mem::take(&mut self.initialised) { flash.uninit() } else { Ok(()) };
        self.outcome = outcome.and(released);
        debug!("transfer: finished after {} bytes: {:?}", self.written, self.outcome);
        self.outcome
    }
}

fn round_up(size: u32) -> u32 {
    (size + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32 * SECTOR_SIZE as u32
}

#[cfg(test)]
pub(crate) mod tests {
    use heapless::Vec;

    use super::*;
    use crate::flash::tests::{detector, vector_block};

    /// Records programmed blocks; fails or ends on request.
    #[derive(Default)]
    pub struct FakeFlash {
        pub inits: u32,
        pub uninits: u32,
        pub pages: Vec<(u32, usize), 64>,
        pub fail_at: Option<u32>,
        pub eof_at: Option<u32>,
    }

    impl FlashTarget for FakeFlash {
        fn init(&mut self, _format: ImageFormat) -> Result<(), FlashError> {
            self.inits += 1;
            Ok(())
        }

        fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<PageStatus, FlashError> {
            self.pages.push((offset, data.len())).unwrap();
            if self.fail_at == Some(offset) {
                Err(FlashError::Write)
            } else if self.eof_at == Some(offset) {
                Ok(PageStatus::HexEof)
            } else {
                Ok(PageStatus::Ok)
            }
        }

        fn uninit(&mut self) -> Result<(), FlashError> {
            self.uninits += 1;
            Ok(())
        }
    }

    const BLOCK: u32 = SECTOR_SIZE as u32;

    fn write(transfer: &mut FileTransfer, flash: &mut FakeFlash, sector: u32, block: &[u8]) -> Verdict {
        transfer.on_sectors(sector, block, &detector(), flash)
    }

    #[test]
    fn unrecognised_content_is_ignored() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        assert_eq!(transfer.state(), TransferState::Idle);
        assert_eq!(write(&mut transfer, &mut flash, 30, &[0u8; 512]), None);
        assert_eq!(transfer.state(), TransferState::Detecting);
        assert_eq!(flash.inits, 0);
    }

    #[test]
    fn out_of_order_blocks_are_skipped() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        let other = [0x11u8; 512];

        write(&mut transfer, &mut flash, 10, &vector_block());
        assert_eq!(transfer.state(), TransferState::Streaming);
        assert_eq!(transfer.start_sector(), Some(10));
        write(&mut transfer, &mut flash, 11, &other);
        assert_eq!(transfer.bytes_written(), 2 * BLOCK);

        write(&mut transfer, &mut flash, 13, &other);
        assert_eq!(transfer.bytes_written(), 2 * BLOCK);
        assert_eq!(transfer.next_sector(), 12);

        write(&mut transfer, &mut flash, 12, &other);
        assert_eq!(transfer.bytes_written(), 3 * BLOCK);
        assert_eq!(transfer.next_sector(), 13);
        write(&mut transfer, &mut flash, 13, &other);
        assert_eq!(transfer.bytes_written(), 4 * BLOCK);

        let offsets: std::vec::Vec<u32> = flash.pages.iter().map(|&(o, _)| o).collect();
        assert_eq!(offsets, [0, BLOCK, 2 * BLOCK, 3 * BLOCK]);
        assert_eq!(flash.inits, 1);
    }

    #[test]
    fn size_below_written_is_inconsistent() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        for sector in 10..13 {
            let block = if sector == 10 { vector_block() } else { [0u8; 512] };
            write(&mut transfer, &mut flash, sector, &block);
        }
        let verdict = transfer.on_file_info(ImageFormat::Bin, FileHandle(4), Some(10), 2 * BLOCK, &mut flash);
        assert_eq!(verdict, Some(Err(FlashError::InconsistentSize)));
        assert_eq!(transfer.state(), TransferState::Failed(FlashError::InconsistentSize));
        assert_eq!(flash.uninits, 1);

        assert_eq!(write(&mut transfer, &mut flash, 13, &[0u8; 512]), None);
        assert_eq!(transfer.bytes_written(), 3 * BLOCK);
    }

    #[test]
    fn completes_when_size_is_reached() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        let verdict = write(&mut transfer, &mut flash, 21, &vector_block());
        assert_eq!(verdict, Some(Err(FlashError::TransferInProgress)));

        let verdict = transfer.on_file_info(ImageFormat::Bin, FileHandle(3), Some(21), 700, &mut flash);
        assert_eq!(verdict, Some(Err(FlashError::TransferInProgress)));
        assert_eq!(transfer.state(), TransferState::Streaming);

        assert_eq!(write(&mut transfer, &mut flash, 22, &[0u8; 512]), Some(Ok(())));
        assert_eq!(transfer.state(), TransferState::Completed);
    }

    #[test]
    fn directory_entry_before_data() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        let verdict = transfer.on_file_info(ImageFormat::Bin, FileHandle(3), Some(21), 512, &mut flash);
        assert_eq!(verdict, Some(Err(FlashError::TransferInProgress)));
        assert_eq!(transfer.state(), TransferState::Idle);

        assert_eq!(write(&mut transfer, &mut flash, 21, &vector_block()), Some(Ok(())));
        assert_eq!(flash.uninits, 1);
    }

    #[test]
    fn content_away_from_the_entry_fails() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        transfer.on_file_info(ImageFormat::Bin, FileHandle(3), Some(21), 4096, &mut flash);
        let verdict = write(&mut transfer, &mut flash, 45, &vector_block());
        assert_eq!(verdict, Some(Err(FlashError::ErrorDuringTransfer)));
        assert_eq!((flash.inits, flash.uninits), (0, 0));
    }

    #[test]
    fn metadata_changes_fail() {
        fn started(flash: &mut FakeFlash) -> FileTransfer {
            let mut transfer = FileTransfer::new();
            write(&mut transfer, flash, 21, &vector_block());
            transfer.on_file_info(ImageFormat::Bin, FileHandle(3), Some(21), 8192, flash);
            transfer
        }
        let mut flash = FakeFlash::default();
        let error = Some(Err(FlashError::ErrorDuringTransfer));

        let mut t = started(&mut flash);
        assert_eq!(t.on_file_info(ImageFormat::Hex, FileHandle(3), Some(21), 8192, &mut flash), error);
        let mut t = started(&mut flash);
        assert_eq!(t.on_file_info(ImageFormat::Bin, FileHandle(5), Some(21), 8192, &mut flash), error);
        let mut t = started(&mut flash);
        assert_eq!(t.on_file_info(ImageFormat::Bin, FileHandle(3), Some(29), 8192, &mut flash), error);
        let mut t = started(&mut flash);
        assert_eq!(t.on_file_info(ImageFormat::Bin, FileHandle(3), Some(21), 4096, &mut flash), error);
        let mut t = started(&mut flash);
        let verdict = t.on_file_info(ImageFormat::Bin, FileHandle(3), Some(21), 0, &mut flash);
        assert_eq!(verdict, Some(Err(FlashError::TransferInProgress)));
    }

    #[test]
    fn flash_errors_and_hex_end() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash { fail_at: Some(BLOCK), ..FakeFlash::default() };
        write(&mut transfer, &mut flash, 21, &vector_block());
        assert_eq!(write(&mut transfer, &mut flash, 22, &[0u8; 512]), Some(Err(FlashError::Write)));
        assert_eq!(transfer.state(), TransferState::Failed(FlashError::Write));

        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash { eof_at: Some(0), ..FakeFlash::default() };
        let mut hex = [b'\n'; 512];
        hex[..15].copy_from_slice(b":020000040000FA");
        assert_eq!(write(&mut transfer, &mut flash, 21, &hex), Some(Ok(())));
        assert_eq!(transfer.format(), Some(ImageFormat::Hex));
        assert_eq!(transfer.state(), TransferState::Completed);
    }

    #[test]
    fn multi_sector_writes_advance_together() {
        let mut transfer = FileTransfer::new();
        let mut flash = FakeFlash::default();
        let mut blocks = [0u8; 1024];
        blocks[..512].copy_from_slice(&vector_block());
        write(&mut transfer, &mut flash, 21, &blocks);
        assert_eq!(transfer.next_sector(), 23);
        assert_eq!(transfer.bytes_written(), 2 * BLOCK);
        assert_eq!(flash.pages[0], (0, 1024));
    }
}
