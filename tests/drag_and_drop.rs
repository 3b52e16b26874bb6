//! Host-side drag-and-drop sessions against the emulated drive.

use usbd_daplink::block_device::BlockDevice;
use usbd_daplink::drive::{DragAndDrop, Drive, DriveIdentity, Mode, MountEvent, MountState};
use usbd_daplink::event::{Activity, Events, Leds};
use usbd_daplink::flash::{
    DefaultDetector, FlashError, FlashTarget, ImageFormat, PageStatus, VectorTableDetector,
};
use usbd_daplink::main_task::{Board, Control, Io, MainTask};
use usbd_daplink::settings::RamSettings;
use usbd_daplink::target::{TargetDebug, TargetState};
use usbd_daplink::transfer::TransferState;
use usbd_daplink::vfs::{Attributes, DirEntry, Filename, SECTOR_SIZE};

/// First sector of the first free cluster on an 8 MiB volume.
const IMAGE_SECTOR: u32 = 45;
const IMAGE_CLUSTER: u32 = 5;

#[derive(Default)]
struct RecordingFlash {
    format: Option<ImageFormat>,
    image: Vec<u8>,
    uninits: u32,
    fail: bool,
}

impl FlashTarget for RecordingFlash {
    fn init(&mut self, format: ImageFormat) -> Result<(), FlashError> {
        self.format = Some(format);
        Ok(())
    }

    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<PageStatus, FlashError> {
        if self.fail {
            return Err(FlashError::Write);
        }
        let end = offset as usize + data.len();
        if self.image.len() < end {
            self.image.resize(end, 0);
        }
        self.image[offset as usize..end].copy_from_slice(data);
        Ok(PageStatus::Ok)
    }

    fn uninit(&mut self) -> Result<(), FlashError> {
        self.uninits += 1;
        Ok(())
    }
}

type TestDrive<'a> = DragAndDrop<'a, RecordingFlash, DefaultDetector, RamSettings>;

fn mounted_drive(activity: &Activity, settings: RamSettings) -> TestDrive<'_> {
    let mut unique_id = heapless::String::new();
    unique_id.push_str("0240000034544e45").unwrap();
    let identity = DriveIdentity {
        label: *b"DAPLINK    ",
        disk_size: 8 * 1024 * 1024,
        unique_id,
        hic_id: "97969900",
        version: "0254",
        mode: Mode::Interface,
        url: "https://mbed.org/device/?code=0240",
    };
    let detector = DefaultDetector {
        vectors: VectorTableDetector { ram: 0x2000_0000..=0x2000_ffff, flash: 0x0000_0000..=0x0003_ffff },
    };
    let mut drive = DragAndDrop::new(identity, RecordingFlash::default(), detector, settings, activity).unwrap();
    drive.init(true).unwrap();
    drive
}

/// Image of `len` bytes starting with a valid vector table.
fn image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
    for (i, word) in [0x2000_4000u32, 0x2001, 0x2003, 0x2005].iter().enumerate() {
        image[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    image
}

fn write_content(drive: &mut TestDrive<'_>, content: &[u8]) {
    for (i, chunk) in content.chunks(SECTOR_SIZE).enumerate() {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..chunk.len()].copy_from_slice(chunk);
        drive.write_block(IMAGE_SECTOR + i as u32, &sector).unwrap();
    }
}

fn root(drive: &TestDrive<'_>) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    drive.read_block(drive.vfs().geometry().root_start(), &mut sector).unwrap();
    sector
}

fn write_entry(drive: &mut TestDrive<'_>, name: &Filename, cluster: u32, size: u32) {
    let mut sector = root(drive);
    let slot = sector.chunks_exact(32).position(|raw| raw[0] == 0).unwrap();
    DirEntry::file(name, Attributes::ARCHIVE, cluster, size).write(&mut sector[slot * 32..(slot + 1) * 32]);
    let start = drive.vfs().geometry().root_start();
    drive.write_block(start, &sector).unwrap();
}

fn file(drive: &TestDrive<'_>, name: &Filename) -> Option<String> {
    let entry = root(drive)
        .chunks_exact(32)
        .map(DirEntry::parse)
        .find(|entry| entry.is_live() && &entry.name == name)?;
    let mut sector = [0u8; SECTOR_SIZE];
    drive.read_block(drive.vfs().start_sector(&entry)?, &mut sector).unwrap();
    Some(String::from_utf8_lossy(&sector[..entry.filesize as usize]).into_owned())
}

fn remount(drive: &mut TestDrive<'_>) -> Vec<MountEvent> {
    (0..40).filter_map(|_| drive.periodic(90)).collect()
}

#[test]
fn content_before_directory_entry() {
    let activity = Activity::new();
    let mut drive = mounted_drive(&activity, RamSettings::default());
    let firmware = image(1300);

    write_content(&mut drive, &firmware);
    assert_eq!(drive.transfer().state(), TransferState::Streaming);
    write_entry(&mut drive, b"FIRMWAREBIN", IMAGE_CLUSTER, 1300);
    assert_eq!(drive.transfer().state(), TransferState::Completed);
    assert_eq!(drive.flash().format, Some(ImageFormat::Bin));
    assert_eq!(&drive.flash().image[..1300], &firmware[..]);
    assert_eq!(drive.flash().uninits, 1);
    assert!(activity.take().contains(Leds::MSC));

    // late writes are dropped
    drive.write_block(IMAGE_SECTOR + 3, &[0xaa; SECTOR_SIZE]).unwrap();
    assert_eq!(drive.flash().image.len(), 3 * SECTOR_SIZE);

    assert_eq!(
        remount(&mut drive),
        [MountEvent::Ejected { outcome: Ok(()), reset_target: false, restart: false }, MountEvent::Inserted]
    );
    assert_eq!(drive.mount_state(), MountState::Connected);
    assert_eq!(file(&drive, b"FAIL    TXT"), None);
    assert_eq!(drive.transfer().state(), TransferState::Idle);
}

#[test]
fn directory_entry_before_content() {
    let activity = Activity::new();
    let mut drive = mounted_drive(&activity, RamSettings::default());
    let firmware = image(1024);

    write_entry(&mut drive, b"FIRMWAREBIN", IMAGE_CLUSTER, 1024);
    assert_eq!(drive.transfer().state(), TransferState::Idle);
    write_content(&mut drive, &firmware[..SECTOR_SIZE]);
    assert_eq!(drive.transfer().state(), TransferState::Streaming);
    drive.write_block(IMAGE_SECTOR + 1, &firmware[SECTOR_SIZE..]).unwrap();
    assert_eq!(drive.transfer().state(), TransferState::Completed);
    assert_eq!(drive.flash().image, firmware);
}

#[test]
fn shrinking_file_is_reported_after_remount() {
    let activity = Activity::new();
    let mut drive = mounted_drive(&activity, RamSettings::default());
    write_content(&mut drive, &image(1536));
    write_entry(&mut drive, b"FIRMWAREBIN", IMAGE_CLUSTER, 600);
    assert_eq!(drive.transfer().state(), TransferState::Failed(FlashError::InconsistentSize));

    let events = remount(&mut drive);
    assert_eq!(
        events[0],
        MountEvent::Ejected { outcome: Err(FlashError::InconsistentSize), reset_target: false, restart: false }
    );
    assert_eq!(
        file(&drive, b"FAIL    TXT").as_deref(),
        Some("The file size does not match the data already transferred.\r\n")
    );
}

#[test]
fn unrecognised_content_leaves_drive_mounted() {
    let activity = Activity::new();
    let mut drive = mounted_drive(&activity, RamSettings::default());
    write_content(&mut drive, b"just some notes\r\n");
    write_entry(&mut drive, b"NOTES   TXT", IMAGE_CLUSTER, 17);
    assert_eq!(drive.transfer().state(), TransferState::Detecting);
    assert!(remount(&mut drive).is_empty());
    assert!(drive.flash().image.is_empty());
}

#[derive(Default)]
struct Bench {
    connected: bool,
}

impl Board for Bench {
    fn set_led(&mut self, _led: Leds, _on: bool) {}

    fn arm_reset_button(&mut self) {}

    fn set_power(&mut self, _on: bool) {}

    fn usb_connect(&mut self, connect: bool) {
        self.connected = connect;
    }

    fn usb_configured(&self) -> bool {
        self.connected
    }
}

struct Target(Vec<TargetState>);

impl TargetDebug for Target {
    fn set_state(&mut self, state: TargetState) -> bool {
        self.0.push(state);
        true
    }

    fn unique_id(&self) -> &str {
        "0240000034544e45"
    }
}

#[test]
fn main_task_resets_target_only_after_successful_programming() {
    let activity = Activity::new();
    let settings = RamSettings { auto_reset: true, ..RamSettings::default() };
    let mut drive = mounted_drive(&activity, settings);
    let mut board = Bench::default();
    let mut target = Target(Vec::new());
    let mut task = MainTask::new(&activity);

    let mut controls = Vec::new();
    {
        let mut io = Io { board: &mut board, target: &mut target, drive: Some(&mut drive), console: None };
        task.start(&mut io);
        for _ in 0..4 {
            controls.push(task.handle(Events::TICK_90MS | Events::TICK_30MS, &mut io));
        }
    }
    assert!(controls.contains(&Control::ServicesReady));
    assert!(board.connected);

    let firmware = image(2048);
    write_entry(&mut drive, b"FIRMWAREBIN", IMAGE_CLUSTER, 2048);
    write_content(&mut drive, &firmware);
    assert_eq!(drive.transfer().state(), TransferState::Completed);

    {
        let mut io = Io { board: &mut board, target: &mut target, drive: Some(&mut drive), console: None };
        for _ in 0..30 {
            assert_eq!(task.handle(Events::TICK_90MS | Events::TICK_30MS, &mut io), Control::Continue);
        }
    }
    assert_eq!(target.0, [TargetState::ResetRun]);
    assert!(drive.is_media_ready());
    assert!(file(&drive, b"AUTO_RSTCFG").is_some());

    // a failed image leaves the target alone despite auto-reset
    drive.flash_mut().fail = true;
    write_entry(&mut drive, b"FIRMWAREBIN", IMAGE_CLUSTER, 2048);
    write_content(&mut drive, &firmware);
    assert_eq!(drive.transfer().state(), TransferState::Failed(FlashError::Write));
    {
        let mut io = Io { board: &mut board, target: &mut target, drive: Some(&mut drive), console: None };
        for _ in 0..30 {
            assert_eq!(task.handle(Events::TICK_90MS | Events::TICK_30MS, &mut io), Control::Continue);
        }
    }
    assert_eq!(target.0, [TargetState::ResetRun]);
    assert_eq!(file(&drive, b"FAIL    TXT").as_deref(), Some("Flash algorithm write command FAILURE\r\n"));
}
