//! DFU run-time interface.
//!
//! Advertises that the probe can be switched into its bootloader and
//! performs the switch when the host sends `DFU_DETACH`.

use usb_device::class_prelude::*;
use usb_device::Result;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;

const DFU_SUBCLASS_FIRMWARE_UPGRADE: u8 = 0x01;

const DFU_PROTOCOL_RUNTIME: u8 = 0x01;

const DFU_TYPE_FUNCTIONAL: u8 = 0x21;
const DFU_WILL_DETACH: u8 = 1 << 3;
const DFU_MANIFESTATION_TOLERANT: u8 = 1 << 2;
const DFU_CAN_UPLOAD: u8 = 1 << 1;
const DFU_CAN_DNLOAD: u8 = 1 << 0;

const DFU_REQ_DETACH: u8 = 0;
const DFU_REQ_GETSTATUS: u8 = 3;
const DFU_REQ_GETSTATE: u8 = 5;

const DFU_STATE_APP_IDLE: u8 = 0;
const DFU_STATE_APP_DETACH: u8 = 1;
const DFU_STATUS_OK: u8 = 0;

/// Longest detach delay the functional descriptor allows, in milliseconds.
pub const DETACH_TIMEOUT_MS: u16 = 255;
const TRANSFER_SIZE: u16 = 2048;
const DFU_VERSION: u16 = 0x011a;

/// Device-specific operations for [`DfuRuntimeClass`].
pub trait DfuRuntimeOps {
    /// Leave the application for the DFU-capable bootloader, typically by
    /// setting a hold-in-bootloader flag and resetting.
    fn detach(&mut self);
}

impl<F: FnMut()> DfuRuntimeOps for F {
    fn detach(&mut self) {
        self()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DetachTimer {
    remaining_ms: Option<u16>,
}

impl DetachTimer {
    fn start(&mut self, timeout_ms: u16) {
        self.remaining_ms = Some(timeout_ms.min(DETACH_TIMEOUT_MS));
    }

    fn state(&self) -> u8 {
        match self.remaining_ms {
            Some(_) => DFU_STATE_APP_DETACH,
            None => DFU_STATE_APP_IDLE,
        }
    }

    /// Whether the timer ran out.
    fn tick(&mut self, elapsed_ms: u32) -> bool {
        match self.remaining_ms {
            Some(remaining) if u32::from(remaining) <= elapsed_ms => {
                self.remaining_ms = None;
                true
            }
            Some(remaining) => {
                self.remaining_ms = Some(remaining - elapsed_ms as u16);
                false
            }
            None => false,
        }
    }

    fn fire(&mut self) -> bool {
        self.remaining_ms.take().is_some()
    }
}

/// DFU run-time class.
///
/// `DFU_DETACH` moves the interface to appDETACH; [`DfuRuntimeOps::detach`]
/// runs when the requested timeout passes (see [`DfuRuntimeClass::tick`]) or
/// on the next bus reset, whichever comes first.
pub struct DfuRuntimeClass<T: DfuRuntimeOps> {
    dfu_ops: T,
    iface: InterfaceNumber,
    timer: DetachTimer,
}

impl<T: DfuRuntimeOps> DfuRuntimeClass<T> {
    /// Create the class with the given device-specific operations.
    pub fn new<B: UsbBus>(alloc: &UsbBusAllocator<B>, dfu_ops: T) -> Self {
        Self {
            dfu_ops,
            iface: alloc.interface(),
            timer: DetachTimer::default(),
        }
    }

    /// Whether a detach is pending.
    pub fn is_detaching(&self) -> bool {
        self.timer.state() == DFU_STATE_APP_DETACH
    }

    /// Advance the detach timer, from the board's periodic tick.
    pub fn tick(&mut self, elapsed_ms: u32) {
        if self.timer.tick(elapsed_ms) {
            self.dfu_ops.detach();
        }
    }
}

fn status_bytes(state: u8) -> [u8; 6] {
    // bStatus, bwPollTimeout (3 bytes), bState, iString
    [DFU_STATUS_OK, 0, 0, 0, state, 0]
}

impl<T: DfuRuntimeOps, B: UsbBus> UsbClass<B> for DfuRuntimeClass<T> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.iad(
            self.iface,
            1,
            USB_CLASS_APPLICATION_SPECIFIC,
            DFU_SUBCLASS_FIRMWARE_UPGRADE,
            DFU_PROTOCOL_RUNTIME,
            None,
        )?;

        writer.interface(
            self.iface,
            USB_CLASS_APPLICATION_SPECIFIC,
            DFU_SUBCLASS_FIRMWARE_UPGRADE,
            DFU_PROTOCOL_RUNTIME,
        )?;

        // Run-Time DFU Functional Descriptor
        let timeout = DETACH_TIMEOUT_MS.to_le_bytes();
        let transfer_size = TRANSFER_SIZE.to_le_bytes();
        let version = DFU_VERSION.to_le_bytes();
        writer.write(
            DFU_TYPE_FUNCTIONAL,
            &[
                (DFU_WILL_DETACH | DFU_CAN_UPLOAD | DFU_CAN_DNLOAD) & !DFU_MANIFESTATION_TOLERANT, // bmAttributes
                timeout[0], timeout[1], // wDetachTimeOut
                transfer_size[0], transfer_size[1], // wTransferSize
                version[0], version[1], // bcdDFUVersion
            ],
        )
    }

    fn reset(&mut self) {
        if self.timer.fire() {
            self.dfu_ops.detach();
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if !(req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.iface) as u16)
        {
            return;
        }

        match req.request {
            DFU_REQ_GETSTATUS => {
                xfer.accept_with(&status_bytes(self.timer.state())).ok();
            }
            DFU_REQ_GETSTATE => {
                xfer.accept_with(&[self.timer.state()]).ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if !(req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.iface) as u16)
        {
            return;
        }

        match req.request {
            DFU_REQ_DETACH => {
                log::debug!("dfu: detach in {} ms", req.value);
                self.timer.start(req.value);
                xfer.accept().ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_timeout_is_capped() {
        let mut timer = DetachTimer::default();
        assert_eq!(timer.state(), DFU_STATE_APP_IDLE);
        timer.start(5000);
        assert_eq!(timer.state(), DFU_STATE_APP_DETACH);
        assert!(!timer.tick(250));
        assert!(timer.tick(30));
        assert_eq!(timer.state(), DFU_STATE_APP_IDLE);
        assert!(!timer.tick(30));
    }

    #[test]
    fn zero_timeout_fires_on_next_tick() {
        let mut timer = DetachTimer::default();
        timer.start(0);
        assert!(timer.tick(0));
    }

    #[test]
    fn bus_reset_fires_pending_detach() {
        let mut timer = DetachTimer::default();
        assert!(!timer.fire());
        timer.start(100);
        assert!(timer.fire());
        assert!(!timer.tick(200));
    }

    #[test]
    fn status_reports_state() {
        assert_eq!(status_bytes(DFU_STATE_APP_DETACH), [0, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn closures_detach() {
        let mut detached = 0;
        let mut ops = || detached += 1;
        ops.detach();
        ops.detach();
        assert_eq!(detached, 2);
    }
}
