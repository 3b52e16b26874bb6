//! Interrupt-driven UART transport.
//!
//! [`Uart`] is written once against the [`UartHardware`] contract and wraps
//! two [`RingBuffer`]s. The task side calls the [`UartTransport`] methods, the
//! interrupt vector calls [`Uart::on_interrupt`]; sharing one `Uart` between
//! them is up to the firmware, typically a `critical_section::Mutex`.

use log::{debug, trace};

use crate::ring::RingBuffer;

pub mod baud;

pub use baud::BaudDivisor;

/// Text injected into the receive stream when bytes had to be dropped.
pub const OVERFLOW_MARKER: &[u8] = b"<DAPLink:Overflow>\n";

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataBits {
    /// 5 bits
    Five = 5,
    /// 6 bits
    Six = 6,
    /// 7 bits
    Seven = 7,
    /// 8 bits
    Eight = 8,
    /// 9 bits
    Nine = 9,
}

/// Parity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Parity bit always 1
    Mark,
    /// Parity bit always 0
    Space,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    /// 1 stop bit
    One,
    /// 1.5 stop bits
    OnePointFive,
    /// 2 stop bits
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowControl {
    /// No flow control
    None,
    /// Hardware RTS/CTS
    RtsCts,
    /// Software XON/XOFF
    XonXoff,
}

/// Serial line configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartConfig {
    /// Bits per second.
    pub baudrate: u32,
    /// Character size.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baudrate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

/// A requested configuration the hardware cannot produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Baud rate out of reach of the divisor within tolerance.
    #[error("baud rate {0} cannot be generated within tolerance")]
    BaudRate(u32),
    /// Character size not supported by this UART.
    #[error("unsupported number of data bits")]
    DataBits,
    /// Parity mode not supported by this UART.
    #[error("unsupported parity")]
    Parity,
    /// Stop bit count not supported by this UART.
    #[error("unsupported number of stop bits")]
    StopBits,
    /// Flow control mode not supported by this UART.
    #[error("unsupported flow control")]
    FlowControl,
}

/// What to do with received bytes that do not fit in the receive ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowPolicy {
    /// Discard the incoming byte.
    DropNewest,
    /// Discard the oldest buffered byte to make room.
    DropOldest,
    /// Keep room for [`OVERFLOW_MARKER`] and write it once per overflow.
    Marker,
}

impl OverflowPolicy {
    /// Policy selected by the persisted overflow detection setting.
    pub fn from_detect(enabled: bool) -> Self {
        if enabled {
            Self::Marker
        } else {
            Self::DropNewest
        }
    }
}

/// A byte read from the receive FIFO with a framing, parity or break error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineError;

/// Register level operations of one UART peripheral.
///
/// Implemented per chip family; [`Uart`] provides the buffering and policy.
pub trait UartHardware {
    /// Whether the baud generator has a fractional divider.
    const FRACTIONAL_DIVIDER: bool = false;

    /// Peripheral input clock in Hz.
    fn clock_hz(&self) -> u32;

    /// Power the peripheral and route its pins.
    fn enable(&mut self);

    /// Gate the peripheral clock.
    fn disable(&mut self);

    /// Enable or disable the peripheral's interrupt line.
    fn set_interrupt(&mut self, enabled: bool);

    /// Enable or disable the transmit-ready interrupt source.
    fn set_tx_interrupt(&mut self, enabled: bool);

    /// Drop anything sitting in the hardware FIFOs.
    fn flush_fifos(&mut self) {}

    /// Program the baud rate generator.
    fn apply_divisor(&mut self, divisor: &BaudDivisor);

    /// Program character size, parity, stop bits and flow control.
    fn apply_frame(&mut self, config: &UartConfig) -> Result<(), ConfigError>;

    /// Next received byte, `None` once the receive FIFO is empty.
    fn read_byte(&mut self) -> Option<Result<u8, LineError>>;

    /// Whether the transmit FIFO can take another byte.
    fn tx_ready(&self) -> bool;

    /// Queue one byte for transmission.
    fn write_byte(&mut self, byte: u8);
}

/// Task side of a serial transport.
pub trait UartTransport {
    /// Power up with the default configuration and clear both buffers.
    fn initialize(&mut self) -> Result<(), ConfigError>;

    /// Stop interrupts, clear buffers and power the peripheral down.
    fn uninitialize(&mut self);

    /// Stop interrupts and clear buffers.
    fn reset(&mut self);

    /// Apply a new configuration. Buffers are cleared.
    fn set_configuration(&mut self, config: &UartConfig) -> Result<(), ConfigError>;

    /// Last applied configuration as reported to the host.
    fn get_configuration(&self) -> UartConfig;

    /// Free space in the transmit buffer.
    fn write_free(&self) -> usize;

    /// Queue as much of `data` as fits, returning the accepted count.
    fn write_data(&mut self, data: &[u8]) -> usize;

    /// Move received bytes into `buf`, returning the count.
    fn read_data(&mut self, buf: &mut [u8]) -> usize;
}

/// Buffered UART over a [`UartHardware`] peripheral.
pub struct Uart<H: UartHardware, const TX: usize, const RX: usize> {
    hw: H,
    tx: RingBuffer<TX>,
    rx: RingBuffer<RX>,
    config: UartConfig,
    divisor: BaudDivisor,
    policy: OverflowPolicy,
    overflowed: bool,
    tx_active: bool,
}

impl<H: UartHardware, const TX: usize, const RX: usize> Uart<H, TX, RX> {
    /// Wrap a peripheral. Nothing is touched until [`initialize`](UartTransport::initialize).
    pub fn new(hw: H, policy: OverflowPolicy) -> Self {
        Self {
            hw,
            tx: RingBuffer::new(),
            rx: RingBuffer::new(),
            config: UartConfig::default(),
            divisor: BaudDivisor { divisor: 1, div_add: 0, mul: 1 },
            policy,
            overflowed: false,
            tx_active: false,
        }
    }

    /// Change the receive overflow policy.
    pub fn set_overflow_policy(&mut self, policy: OverflowPolicy) {
        self.policy = policy;
    }

    /// Access the peripheral.
    pub fn hardware(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Service the peripheral. Call from the UART interrupt vector.
    pub fn on_interrupt(&mut self) {
        while let Some(result) = self.hw.read_byte() {
            match result {
                Ok(byte) => self.receive(byte),
                Err(LineError) => trace!("uart: dropped byte with line error"),
            }
        }
        self.fill_tx();
    }

    fn fill_tx(&mut self) {
        while self.hw.tx_ready() {
            match self.tx.try_pop() {
                Some(byte) => self.hw.write_byte(byte),
                None => {
                    self.tx_active = false;
                    self.hw.set_tx_interrupt(false);
                    return;
                }
            }
        }
    }

    fn receive(&mut self, byte: u8) {
        let free = self.rx.count_free();
        match self.policy {
            OverflowPolicy::DropNewest => {
                self.rx.push(byte);
            }
            OverflowPolicy::DropOldest => self.rx.push_overwrite(byte),
            OverflowPolicy::Marker => {
                if free > OVERFLOW_MARKER.len() {
                    self.overflowed = false;
                    self.rx.push(byte);
                } else if free == OVERFLOW_MARKER.len() && !self.overflowed {
                    self.overflowed = true;
                    self.rx.write(OVERFLOW_MARKER);
                }
            }
        }
    }

    fn apply(&mut self, config: &UartConfig) -> Result<(), ConfigError> {
        let clock = self.hw.clock_hz();
        let divisor = if H::FRACTIONAL_DIVIDER {
            baud::fractional_divisor(clock, config.baudrate)?
        } else {
            baud::integer_divisor(clock, config.baudrate)?
        };
        self.hw.apply_divisor(&divisor);
        if let Err(err) = self.hw.apply_frame(config) {
            self.hw.apply_divisor(&self.divisor);
            return Err(err);
        }
        self.divisor = divisor;
        self.config = *config;
        Ok(())
    }

    fn quiesce(&mut self) {
        self.hw.set_interrupt(false);
        self.hw.set_tx_interrupt(false);
        self.hw.flush_fifos();
        self.tx.clear();
        self.rx.clear();
        self.tx_active = false;
        self.overflowed = false;
    }
}

impl<H: UartHardware, const TX: usize, const RX: usize> UartTransport for Uart<H, TX, RX> {
    fn initialize(&mut self) -> Result<(), ConfigError> {
        self.hw.enable();
        self.quiesce();
        let result = self.apply(&UartConfig::default());
        self.hw.set_interrupt(true);
        result
    }

    fn uninitialize(&mut self) {
        self.quiesce();
        self.hw.disable();
    }

    fn reset(&mut self) {
        self.quiesce();
        self.hw.set_interrupt(true);
    }

    fn set_configuration(&mut self, config: &UartConfig) -> Result<(), ConfigError> {
        self.quiesce();
        let result = self.apply(config);
        match &result {
            Ok(()) => debug!("uart: {} baud, divisor {:?}", config.baudrate, self.divisor),
            Err(err) => debug!("uart: rejected configuration: {}", err),
        }
        self.hw.set_interrupt(true);
        result
    }

    fn get_configuration(&self) -> UartConfig {
        let actual = self.divisor.achieved(self.hw.clock_hz());
        let mut config = self.config;
        if !baud::within_tolerance(config.baudrate, actual) {
            config.baudrate = actual;
        }
        config
    }

    fn write_free(&self) -> usize {
        self.tx.count_free()
    }

    fn write_data(&mut self, data: &[u8]) -> usize {
        let accepted = self.tx.write(data);
        if !self.tx_active && !self.tx.is_empty() {
            self.tx_active = true;
            self.fill_tx();
            if self.tx_active {
                self.hw.set_tx_interrupt(true);
            }
        }
        accepted
    }

    fn read_data(&mut self, buf: &mut [u8]) -> usize {
        self.rx.read(buf)
    }
}
