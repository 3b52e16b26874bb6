//! CDC ACM virtual COM ports.
//!
//! Each port owns a [`CdcContext`]: a send ring drained one packet at a time
//! into the Bulk-IN endpoint and a receive window filled from the Bulk-OUT
//! endpoint. The context works against the [`PacketIo`] endpoint primitives
//! so it can be driven by [`CdcAcmClass`] or by a test double. What the
//! application does with line coding and received data is supplied through
//! [`CdcAcmPorts`].

use bitflags::bitflags;
use log::trace;

use crate::uart::{ConfigError, DataBits, Parity, StopBits, UartConfig};

mod bridge;
mod class;

pub use bridge::{relay, Relayed, UartBridge, RELAY_CHUNK};
pub use class::CdcAcmClass;

/// USB interface class for communications devices.
pub const USB_CLASS_CDC: u8 = 0x02;
/// USB interface class for CDC data interfaces.
pub const USB_CLASS_CDC_DATA: u8 = 0x0a;

bitflags! {
    /// Modem control lines set by the host with `SET_CONTROL_LINE_STATE`.
    pub struct ControlLineState: u16 {
        /// Data terminal ready.
        const DTR = 1 << 0;
        /// Request to send.
        const RTS = 1 << 1;
    }
}

bitflags! {
    /// Bits reported to the host in a `SERIAL_STATE` notification.
    pub struct SerialState: u16 {
        /// Receiver carrier (DCD).
        const DCD = 1 << 0;
        /// Transmission carrier (DSR).
        const DSR = 1 << 1;
        /// Break detected.
        const BREAK = 1 << 2;
        /// Ring signal.
        const RING = 1 << 3;
        /// Framing error.
        const FRAMING = 1 << 4;
        /// Parity error.
        const PARITY = 1 << 5;
        /// Receive overrun.
        const OVERRUN = 1 << 6;
    }
}

/// Line coding structure of `SET_LINE_CODING`/`GET_LINE_CODING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineCoding {
    /// Bits per second.
    pub data_rate: u32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2.
    pub char_format: u8,
    /// 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space.
    pub parity_type: u8,
    /// 5, 6, 7, 8 or 16.
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        LineCoding::from(&UartConfig::default())
    }
}

impl LineCoding {
    /// Wire size of the structure.
    pub const SIZE: usize = 7;

    /// Decode from a control transfer payload.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            data_rate: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            char_format: data[4],
            parity_type: data[5],
            data_bits: data[6],
        })
    }

    /// Encode for a control transfer payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let rate = self.data_rate.to_le_bytes();
        [rate[0], rate[1], rate[2], rate[3], self.char_format, self.parity_type, self.data_bits]
    }
}

impl From<&UartConfig> for LineCoding {
    fn from(config: &UartConfig) -> Self {
        Self {
            data_rate: config.baudrate,
            char_format: match config.stop_bits {
                StopBits::One => 0,
                StopBits::OnePointFive => 1,
                StopBits::Two => 2,
            },
            parity_type: match config.parity {
                Parity::None => 0,
                Parity::Odd => 1,
                Parity::Even => 2,
                Parity::Mark => 3,
                Parity::Space => 4,
            },
            data_bits: config.data_bits as u8,
        }
    }
}

impl TryFrom<&LineCoding> for UartConfig {
    type Error = ConfigError;

    fn try_from(coding: &LineCoding) -> Result<Self, Self::Error> {
        Ok(UartConfig {
            baudrate: coding.data_rate,
            data_bits: match coding.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                8 => DataBits::Eight,
                9 => DataBits::Nine,
                _ => return Err(ConfigError::DataBits),
            },
            parity: match coding.parity_type {
                0 => Parity::None,
                1 => Parity::Odd,
                2 => Parity::Even,
                3 => Parity::Mark,
                4 => Parity::Space,
                _ => return Err(ConfigError::Parity),
            },
            stop_bits: match coding.char_format {
                0 => StopBits::One,
                1 => StopBits::OnePointFive,
                2 => StopBits::Two,
                _ => return Err(ConfigError::StopBits),
            },
            flow_control: crate::uart::FlowControl::None,
        })
    }
}

/// A port refused a class request; the request gets stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortError {
    /// The port does not implement the request.
    #[error("request not supported by this port")]
    Unsupported,
    /// The transport rejected the line settings.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Application side of the virtual COM ports.
///
/// Every method has a default that accepts the request and does nothing, so
/// a port only overrides what it cares about. `port` is the CDC port index.
pub trait CdcAcmPorts {
    /// Port is being brought up.
    fn initialize(&mut self, _port: usize) -> Result<(), PortError> {
        Ok(())
    }

    /// Port is being torn down.
    fn uninitialize(&mut self, _port: usize) -> Result<(), PortError> {
        Ok(())
    }

    /// USB bus reset.
    fn reset(&mut self, _port: usize) -> Result<(), PortError> {
        Ok(())
    }

    /// Host changed the line coding.
    fn set_line_coding(&mut self, _port: usize, _coding: &LineCoding) -> Result<(), PortError> {
        Ok(())
    }

    /// Line coding to report to the host, `None` to echo the last one set.
    fn line_coding(&mut self, _port: usize) -> Option<LineCoding> {
        None
    }

    /// Host changed DTR/RTS.
    fn set_control_line_state(&mut self, _port: usize, _state: ControlLineState) -> Result<(), PortError> {
        Ok(())
    }

    /// Host requested a break of `duration_ms` (0xFFFF = until cleared).
    fn send_break(&mut self, _port: usize, _duration_ms: u16) -> Result<(), PortError> {
        Ok(())
    }

    /// New data from the host; `available` unread bytes are buffered.
    fn data_received(&mut self, _port: usize, _available: usize) {}
}

/// Ports with no behaviour.
impl CdcAcmPorts for () {}

/// Bulk endpoint pair of one port.
pub trait PacketIo {
    /// Largest packet either endpoint moves.
    fn max_packet_size(&self) -> usize;

    /// Read a pending OUT packet into `buf`. `None` when nothing is pending.
    fn read_packet(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Start an IN packet. `None` while the endpoint is still busy.
    fn write_packet(&mut self, data: &[u8]) -> Option<usize>;
}

/// Buffering state of one virtual COM port.
///
/// `S` is the send ring size, `R` the receive window size. The receive
/// window must hold at least one max-size packet.
///
/// Every entry point takes `&mut self`: a context shared between the USB
/// interrupt and the task lives in a `critical_section::Mutex`, so endpoint
/// callbacks never interleave with reads or sends.
pub struct CdcContext<const S: usize, const R: usize> {
    send_buf: [u8; S],
    // Ring offsets of the next byte to queue and the next byte to send.
    send_wr: usize,
    send_rd: usize,
    // Free-running byte counters; `queued - sent` is what is in the ring.
    queued: u32,
    sent: u32,
    send_active: bool,
    send_zlp: bool,

    recv_buf: [u8; R],
    received: usize,
    read: usize,
    pending_packets: u32,
    no_space: bool,

    line_coding: LineCoding,
    control_line_state: ControlLineState,
}

impl<const S: usize, const R: usize> Default for CdcContext<S, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const S: usize, const R: usize> CdcContext<S, R> {
    /// Empty context with 9600 8N1 line coding.
    pub fn new() -> Self {
        Self {
            send_buf: [0; S],
            send_wr: 0,
            send_rd: 0,
            queued: 0,
            sent: 0,
            send_active: false,
            send_zlp: false,
            recv_buf: [0; R],
            received: 0,
            read: 0,
            pending_packets: 0,
            no_space: false,
            line_coding: LineCoding::default(),
            control_line_state: ControlLineState::empty(),
        }
    }

    /// Drop all buffered data and restore the default line coding.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Bytes that can still be queued for the host.
    pub fn data_free(&self) -> usize {
        S - self.in_ring()
    }

    /// Queue bytes for the host, returning how many were accepted.
    pub fn data_send(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.data_free());
        if len == 0 {
            return 0;
        }
        let first = len.min(S - self.send_wr);
        self.send_buf[self.send_wr..self.send_wr + first].copy_from_slice(&data[..first]);
        self.send_buf[..len - first].copy_from_slice(&data[first..len]);
        self.send_wr = (self.send_wr + len) % S;
        self.queued = self.queued.wrapping_add(len as u32);
        len
    }

    /// Received bytes not yet read.
    pub fn data_available(&self) -> usize {
        self.received - self.read
    }

    /// Copy received bytes into `buf`, returning the count.
    pub fn data_read(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.data_available());
        buf[..len].copy_from_slice(&self.recv_buf[self.read..self.read + len]);
        self.read += len;
        len
    }

    /// Last line coding set by the host.
    pub fn line_coding(&self) -> &LineCoding {
        &self.line_coding
    }

    /// Record the line coding set by the host.
    pub fn set_line_coding(&mut self, coding: LineCoding) {
        self.line_coding = coding;
    }

    /// Last control line state set by the host.
    pub fn control_line_state(&self) -> ControlLineState {
        self.control_line_state
    }

    /// Record the control line state set by the host.
    pub fn set_control_line_state(&mut self, state: ControlLineState) {
        self.control_line_state = state;
    }

    /// Bulk-OUT endpoint has a packet.
    pub fn on_bulk_out<P: PacketIo, C: CdcAcmPorts + ?Sized>(&mut self, io: &mut P, ports: &mut C, port: usize) {
        self.receive_packet(io, false);
        if self.data_available() > 0 {
            ports.data_received(port, self.data_available());
        }
    }

    /// Bulk-IN endpoint finished a packet.
    pub fn on_bulk_in<P: PacketIo>(&mut self, io: &mut P) {
        self.send_packet(io);
    }

    /// Periodic service, called once per USB frame.
    pub fn service<P: PacketIo, C: CdcAcmPorts + ?Sized>(&mut self, io: &mut P, ports: &mut C, port: usize) {
        if self.received == self.read && self.received != 0 {
            self.received = 0;
            self.read = 0;
            self.no_space = false;
        }

        if self.pending_packets > 0 && !self.no_space {
            self.receive_packet(io, true);
            if self.data_available() > 0 {
                ports.data_received(port, self.data_available());
            }
        }

        if !self.send_active && self.in_ring() > 0 {
            self.send_active = true;
            self.send_packet(io);
        }
    }

    fn in_ring(&self) -> usize {
        self.queued.wrapping_sub(self.sent) as usize
    }

    /// Take one OUT packet if the window has room. A packet that does not
    /// fit stays in the endpoint and is counted as pending; `deferred` marks
    /// a retry of such a packet.
    fn receive_packet<P: PacketIo>(&mut self, io: &mut P, deferred: bool) {
        if R - self.received >= io.max_packet_size() {
            let len = io.read_packet(&mut self.recv_buf[self.received..]).unwrap_or(0);
            self.received += len;
            if deferred {
                self.pending_packets = self.pending_packets.saturating_sub(1);
            }
        } else {
            self.no_space = true;
            if !deferred {
                self.pending_packets += 1;
            }
        }
    }

    fn send_packet<P: PacketIo>(&mut self, io: &mut P) {
        if !self.send_active {
            return;
        }
        let pending = self.in_ring();
        if pending == 0 && !self.send_zlp {
            self.send_active = false;
            return;
        }
        let max_packet = io.max_packet_size();
        let len = pending.min(S - self.send_rd).min(max_packet);
        let sent = match io.write_packet(&self.send_buf[self.send_rd..self.send_rd + len]) {
            Some(sent) => sent,
            None => {
                trace!("cdc: IN endpoint busy, {} bytes wait", pending);
                return;
            }
        };
        self.send_rd = (self.send_rd + sent) % S;
        self.sent = self.sent.wrapping_add(sent as u32);
        self.send_zlp = self.in_ring() == 0 && sent == max_packet;
    }
}
