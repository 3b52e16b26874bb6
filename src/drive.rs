//! Drag-and-drop programming drive.
//!
//! [`DragAndDrop`] puts a [`VirtualFs`] in front of a [`FlashTarget`]. The host
//! sees a small volume with an information page, a details file and a marker
//! file per setting. Copying an image onto it programs the target; afterwards
//! the drive ejects itself and comes back with a fresh view, carrying
//! `FAIL.TXT` if programming went wrong.
//!
//! Mounting is driven by [`Drive::periodic`]. A transfer arms the
//! remount, every host write pushes it back by [`DISCONNECT_DELAY_MS`], and
//! once the host has been quiet that long the medium is reported missing for
//! [`RECONNECT_DELAY_MS`] and rebuilt.

use core::fmt::{self, Write as _};

use heapless::{String, Vec};
use log::{debug, trace, warn};

use crate::block_device::{BlockDevice, BlockDeviceError};
use crate::event::{Activity, Leds};
use crate::flash::{FlashError, FlashTarget, ImageDetector, ImageFormat};
use crate::settings::Settings;
use crate::transfer::{FileTransfer, Verdict};
use crate::vfs::{Attributes, ChangeKind, FileChange, FileSource, Filename, Geometry, VfsError, VirtualFs, SECTOR_SIZE};

/// Host quiet time before a pending remount ejects the medium.
pub const DISCONNECT_DELAY_MS: u32 = 500;
/// Time the medium stays ejected. Hosts need over a second to notice.
pub const RECONNECT_DELAY_MS: u32 = 1100;
/// Delay between enabling the drive and the medium appearing.
pub const CONNECT_DELAY_MS: u32 = 0;

const AUTO_RESET_FILE: &Filename = b"AUTO_RSTCFG";
const HARD_RESET_FILE: &Filename = b"HARD_RSTCFG";
const REFRESH_FILE: &Filename = b"REFRESH ACT";

const AUTO_RESET_TEXT: &[u8] = b"The target is reset after programming. Delete this file to turn that off.\r\n";
const HARD_RESET_TEXT: &[u8] = b"The target waits for a reset after programming. Delete this file to reset it automatically.\r\n";

/// Which firmware the probe is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Debug interface firmware.
    Interface,
    /// Bootloader updating the interface firmware.
    Bootloader,
}

impl Mode {
    /// Name shown in `DETAILS.TXT`.
    pub fn name(self) -> &'static str {
        match self {
            Mode::Interface => "Interface",
            Mode::Bootloader => "Bootloader",
        }
    }

    /// File whose creation restarts into the other mode.
    pub fn switch_file(self) -> &'static Filename {
        match self {
            Mode::Interface => b"START_BLACT",
            Mode::Bootloader => b"START_IFACT",
        }
    }
}

/// What the drive tells the host about the probe.
#[derive(Debug, Clone)]
pub struct DriveIdentity {
    /// Volume label.
    pub label: Filename,
    /// Bytes of space the volume advertises.
    pub disk_size: u32,
    /// Probe unique id.
    pub unique_id: String<48>,
    /// Interface chip id.
    pub hic_id: &'static str,
    /// Firmware version.
    pub version: &'static str,
    /// Running firmware.
    pub mode: Mode,
    /// Page `MBED.HTM` redirects to.
    pub url: &'static str,
}

/// Medium state seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountState {
    /// No medium.
    Disconnected,
    /// Ejected, coming back with a rebuilt volume.
    Reconnecting,
    /// Medium present.
    Connected,
}

/// Mount transitions that need action outside the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountEvent {
    /// The medium was ejected after a transfer or marker action.
    Ejected {
        /// How the transfer ended.
        outcome: Result<(), FlashError>,
        /// Let the target run. Only set after a successful transfer with
        /// auto-reset on.
        reset_target: bool,
        /// Restart the probe to switch firmware.
        restart: bool,
    },
    /// The rebuilt medium is visible again.
    Inserted,
}

/// What the main loop needs from a drive.
pub trait Drive {
    /// Advance the mount timers by `elapsed_ms`.
    fn periodic(&mut self, elapsed_ms: u32) -> Option<MountEvent>;

    /// Bring the medium up or down.
    fn enable(&mut self, enable: bool);
}

#[derive(Debug, Clone, Copy)]
struct MountTimer {
    state: MountState,
    next: MountState,
    remaining_ms: u32,
}

impl MountTimer {
    const fn settled(state: MountState) -> Self {
        Self { state, next: state, remaining_ms: 0 }
    }

    fn changing(&self) -> bool {
        self.state != self.next
    }

    fn remount(&mut self) {
        if !self.changing() && self.state == MountState::Connected {
            self.next = MountState::Reconnecting;
            self.remaining_ms = DISCONNECT_DELAY_MS;
        }
    }

    fn hold_off(&mut self) {
        if self.state == MountState::Connected {
            self.remaining_ms = DISCONNECT_DELAY_MS;
        }
    }

    fn enable(&mut self, enable: bool) {
        if enable {
            self.next = MountState::Connected;
            self.remaining_ms = CONNECT_DELAY_MS;
        } else {
            self.next = MountState::Disconnected;
            self.remaining_ms = DISCONNECT_DELAY_MS;
        }
    }

    /// The state entered, if the timer ran out.
    fn tick(&mut self, elapsed_ms: u32) -> Option<MountState> {
        if !self.changing() {
            return None;
        }
        if self.remaining_ms > 0 {
            self.remaining_ms -= elapsed_ms.min(self.remaining_ms);
            return None;
        }
        self.state = self.next;
        if self.state == MountState::Reconnecting {
            self.next = MountState::Connected;
            self.remaining_ms = RECONNECT_DELAY_MS;
        }
        Some(self.state)
    }
}

/// Drag-and-drop drive over a flash backend.
pub struct DragAndDrop<'a, F, D, S> {
    identity: DriveIdentity,
    flash: F,
    detector: D,
    settings: S,
    activity: &'a Activity,
    vfs: VirtualFs,
    transfer: FileTransfer,
    fail_reason: Result<(), FlashError>,
    mount: MountTimer,
    media_ready: bool,
}

impl<'a, F, D, S> DragAndDrop<'a, F, D, S>
where
    F: FlashTarget,
    D: ImageDetector,
    S: Settings,
{
    /// Build the drive with the medium absent; see [`DragAndDrop::init`] and
    /// [`Drive::enable`].
    pub fn new(identity: DriveIdentity, flash: F, detector: D, settings: S, activity: &'a Activity) -> Result<Self, VfsError> {
        let vfs = VirtualFs::new(&identity.label, identity.disk_size);
        let mut drive = Self {
            identity,
            flash,
            detector,
            settings,
            activity,
            vfs,
            transfer: FileTransfer::new(),
            fail_reason: Ok(()),
            mount: MountTimer::settled(MountState::Disconnected),
            media_ready: false,
        };
        drive.build_filesystem()?;
        Ok(drive)
    }

    /// Rebuild the volume and settle in the connected or disconnected state
    /// without delay.
    pub fn init(&mut self, enable: bool) -> Result<(), VfsError> {
        self.build_filesystem()?;
        let state = if enable { MountState::Connected } else { MountState::Disconnected };
        self.mount = MountTimer::settled(state);
        self.media_ready = enable;
        Ok(())
    }

    /// Eject and rebuild the volume once the host has been quiet for
    /// [`DISCONNECT_DELAY_MS`]. Ignored unless connected and idle.
    pub fn remount(&mut self) {
        self.mount.remount();
    }

    /// Current medium state.
    pub fn mount_state(&self) -> MountState {
        self.mount.state
    }

    /// Whether the host may access the medium.
    pub fn is_media_ready(&self) -> bool {
        self.media_ready
    }

    /// Outcome of the last transfer, shown in `FAIL.TXT` when an error.
    pub fn fail_reason(&self) -> Result<(), FlashError> {
        self.fail_reason
    }

    /// The running transfer.
    pub fn transfer(&self) -> &FileTransfer {
        &self.transfer
    }

    /// The volume as served.
    pub fn vfs(&self) -> &VirtualFs {
        &self.vfs
    }

    /// Identity shown to the host.
    pub fn identity(&self) -> &DriveIdentity {
        &self.identity
    }

    /// Settings store.
    pub fn settings(&self) -> &S {
        &self.settings
    }

    /// Settings store, mutable. Changes show after the next rebuild.
    pub fn settings_mut(&mut self) -> &mut S {
        &mut self.settings
    }

    /// Flash backend.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Flash backend, mutable.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Serve a host read of whole sectors starting at `sector`.
    pub fn read_sectors(&self, sector: u32, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        if !self.media_ready {
            return Err(BlockDeviceError::MediaNotReady);
        }
        self.activity.note(Leds::MSC);
        self.vfs.read_sectors(sector, buf);
        Ok(())
    }

    /// Take a host write of whole sectors starting at `sector`.
    pub fn write_sectors(&mut self, sector: u32, data: &[u8]) -> Result<(), BlockDeviceError> {
        if !self.media_ready {
            return Err(BlockDeviceError::MediaNotReady);
        }
        // keep the medium attached while the host is still writing
        self.mount.hold_off();
        if self.transfer.is_finished() {
            trace!("drive: transfer finished, write to {} dropped", sector);
            return Ok(());
        }
        self.activity.note(Leds::MSC);

        let Self { identity, flash, detector, settings, vfs, transfer, fail_reason, mount, .. } = self;
        let geometry = *vfs.geometry();
        vfs.write_sectors(sector, data, |change| {
            let verdict = apply_change(&change, &geometry, identity.mode, transfer, flash, settings);
            arm(verdict, fail_reason, mount);
        });
        if vfs.is_data_sector(sector) {
            let verdict = transfer.on_sectors(sector, data, &*detector, flash);
            arm(verdict, fail_reason, mount);
        }
        Ok(())
    }

    fn build_filesystem(&mut self) -> Result<(), VfsError> {
        let identity = &self.identity;
        let auto_reset = self.settings.auto_reset();
        self.transfer = FileTransfer::new();

        let mut vfs = VirtualFs::new(&identity.label, identity.disk_size);
        vfs.add_file(b"MBED    HTM", Attributes::READ_ONLY, render(format_args!(
            "<!doctype html>\r\n\
             <!-- mbed Platform Website and Authentication Shortcut -->\r\n\
             <html>\r\n<head>\r\n<meta charset=\"utf-8\">\r\n\
             <title>mbed Website Shortcut</title>\r\n</head>\r\n<body>\r\n<script>\r\n\
             window.location.replace(\"{}\");\r\n\
             </script>\r\n</body>\r\n</html>\r\n",
            identity.url
        )))?;
        vfs.add_file(b"DETAILS TXT", Attributes::READ_ONLY, render(format_args!(
            "# DAPLink Firmware - see https://mbed.com/daplink\r\n\
             Unique ID: {}\r\n\
             HIC ID: {}\r\n\
             Auto Reset: {}\r\n\
             Daplink Mode: {}\r\n\
             {} Version: {}\r\n",
            identity.unique_id,
            identity.hic_id,
            auto_reset as u8,
            identity.mode.name(),
            identity.mode.name(),
            identity.version
        )))?;
        if auto_reset {
            vfs.add_file(AUTO_RESET_FILE, Attributes::ARCHIVE, FileSource::Static(AUTO_RESET_TEXT))?;
        } else {
            vfs.add_file(HARD_RESET_FILE, Attributes::ARCHIVE, FileSource::Static(HARD_RESET_TEXT))?;
        }
        if let Err(reason) = self.fail_reason {
            vfs.add_file(b"FAIL    TXT", Attributes::READ_ONLY, render(format_args!("{}\r\n", reason)))?;
        }
        self.vfs = vfs;
        Ok(())
    }
}

impl<F, D, S> Drive for DragAndDrop<'_, F, D, S>
where
    F: FlashTarget,
    D: ImageDetector,
    S: Settings,
{
    fn periodic(&mut self, elapsed_ms: u32) -> Option<MountEvent> {
        let entered = self.mount.tick(elapsed_ms)?;
        debug!("drive: {:?}", entered);
        match entered {
            MountState::Disconnected => {
                self.media_ready = false;
                None
            }
            MountState::Reconnecting => {
                self.media_ready = false;
                let restart = match self.identity.mode {
                    Mode::Bootloader => self.fail_reason.is_ok(),
                    Mode::Interface => self.settings.hold_in_bootloader(),
                };
                Some(MountEvent::Ejected {
                    outcome: self.fail_reason,
                    reset_target: self.fail_reason.is_ok() && self.settings.auto_reset(),
                    restart,
                })
            }
            MountState::Connected => {
                if let Err(e) = self.build_filesystem() {
                    warn!("drive: rebuild failed: {}", e);
                }
                self.media_ready = true;
                Some(MountEvent::Inserted)
            }
        }
    }

    fn enable(&mut self, enable: bool) {
        self.mount.enable(enable);
    }
}

impl<F, D, S> BlockDevice for DragAndDrop<'_, F, D, S>
where
    F: FlashTarget,
    D: ImageDetector,
    S: Settings,
{
    const BLOCK_BYTES: usize = SECTOR_SIZE;

    fn read_block(&self, lba: u32, block: &mut [u8]) -> Result<(), BlockDeviceError> {
        if lba > self.max_lba() || block.len() < SECTOR_SIZE {
            return Err(BlockDeviceError::InvalidAddress);
        }
        self.read_sectors(lba, &mut block[..SECTOR_SIZE])
    }

    fn write_block(&mut self, lba: u32, block: &[u8]) -> Result<(), BlockDeviceError> {
        if lba > self.max_lba() || block.len() < SECTOR_SIZE {
            return Err(BlockDeviceError::InvalidAddress);
        }
        self.write_sectors(lba, &block[..SECTOR_SIZE])
    }

    fn max_lba(&self) -> u32 {
        self.vfs.sector_count() - 1
    }
}

fn arm(verdict: Verdict, fail_reason: &mut Result<(), FlashError>, mount: &mut MountTimer) {
    if let Some(outcome) = verdict {
        *fail_reason = outcome;
        mount.remount();
    }
}

fn apply_change<F: FlashTarget, S: Settings>(
    change: &FileChange,
    geometry: &Geometry,
    mode: Mode,
    transfer: &mut FileTransfer,
    flash: &mut F,
    settings: &mut S,
) -> Verdict {
    let entry = &change.entry;
    let name = &entry.name;
    trace!(
        "drive: {:?} {} in slot {}",
        change.kind,
        core::str::from_utf8(name).unwrap_or("?"),
        change.handle.0
    );

    match change.kind {
        ChangeKind::Created | ChangeKind::Changed => {
            if let Some(format) = ImageFormat::from_extension(entry.extension()) {
                let cluster = entry.first_cluster();
                let start = (cluster >= 2).then(|| geometry.cluster_sector(cluster));
                return transfer.on_file_info(format, change.handle, start, entry.filesize, flash);
            }
            if change.kind != ChangeKind::Created {
                return None;
            }
            if name == AUTO_RESET_FILE {
                settings.set_auto_reset(true);
            } else if name == HARD_RESET_FILE {
                settings.set_auto_reset(false);
            } else if name == mode.switch_file() {
                // the bootloader starts the interface by default
                if mode == Mode::Interface {
                    settings.set_hold_in_bootloader(true);
                }
            } else if name != REFRESH_FILE {
                return None;
            }
        }
        ChangeKind::Deleted => {
            if name == AUTO_RESET_FILE {
                settings.set_auto_reset(false);
            } else if name == HARD_RESET_FILE {
                settings.set_auto_reset(true);
            } else {
                return None;
            }
        }
    }
    debug!("drive: action file, remounting");
    Some(transfer.complete(Ok(()), flash))
}

/// Generated file content, cut at one sector.
fn render(args: fmt::Arguments<'_>) -> FileSource {
    let mut text: String<SECTOR_SIZE> = String::new();
    if text.write_fmt(args).is_err() {
        warn!("drive: generated file truncated");
    }
    FileSource::Rendered(Vec::from_slice(text.as_bytes()).unwrap_or_default())
}
