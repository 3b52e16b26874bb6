use log::debug;

use super::{CdcAcmPorts, CdcContext, ControlLineState, LineCoding, PortError};
use crate::event::{EventGroup, Events};
use crate::uart::{UartConfig, UartTransport};

/// Largest chunk moved per direction by one [`relay`] call.
pub const RELAY_CHUNK: usize = 64;

/// A break held at least this long asks for the unique id after the reset.
pub const LONG_BREAK_MS: u32 = 3000;

/// Bytes moved by one [`relay`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Relayed {
    /// UART to host.
    pub to_host: usize,
    /// Host to UART.
    pub to_target: usize,
}

impl Relayed {
    /// Whether anything moved.
    pub fn any(&self) -> bool {
        self.to_host != 0 || self.to_target != 0
    }
}

/// Move pending bytes between a virtual COM port and a UART, both ways.
pub fn relay<const S: usize, const R: usize, U: UartTransport + ?Sized>(
    cdc: &mut CdcContext<S, R>,
    uart: &mut U,
) -> Relayed {
    let mut data = [0u8; RELAY_CHUNK];
    let mut moved = Relayed::default();

    let room = cdc.data_free().min(RELAY_CHUNK);
    if room > 0 {
        let len = uart.read_data(&mut data[..room]);
        moved.to_host = cdc.data_send(&data[..len]);
    }

    let room = uart.write_free().min(RELAY_CHUNK);
    if room > 0 {
        let len = cdc.data_read(&mut data[..room]);
        moved.to_target = uart.write_data(&data[..len]);
    }
    moved
}

/// Virtual COM port backed by the target UART.
///
/// Line coding goes straight to the UART. A break holds the target in reset
/// and releasing it raises [`Events::RESET`], with [`Events::SEND_UID`] when
/// the break lasted at least [`LONG_BREAK_MS`].
pub struct UartBridge<'e, U: UartTransport> {
    uart: U,
    port: usize,
    events: &'e EventGroup,
    now_ms: fn() -> u32,
    break_start: Option<u32>,
    control: ControlLineState,
}

impl<'e, U: UartTransport> UartBridge<'e, U> {
    /// Serve CDC port `port` with `uart`.
    pub fn new(uart: U, port: usize, events: &'e EventGroup, now_ms: fn() -> u32) -> Self {
        Self {
            uart,
            port,
            events,
            now_ms,
            break_start: None,
            control: ControlLineState::empty(),
        }
    }

    /// The UART, for [`relay`].
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    /// Last DTR/RTS state from the host.
    pub fn control_line_state(&self) -> ControlLineState {
        self.control
    }
}

impl<U: UartTransport> CdcAcmPorts for UartBridge<'_, U> {
    fn initialize(&mut self, port: usize) -> Result<(), PortError> {
        if port == self.port {
            self.uart.initialize()?;
            self.events.set(Events::SERIAL);
        }
        Ok(())
    }

    fn uninitialize(&mut self, port: usize) -> Result<(), PortError> {
        if port == self.port {
            self.uart.uninitialize();
        }
        Ok(())
    }

    fn reset(&mut self, port: usize) -> Result<(), PortError> {
        if port == self.port {
            self.uart.reset();
        }
        Ok(())
    }

    fn set_line_coding(&mut self, port: usize, coding: &LineCoding) -> Result<(), PortError> {
        if port != self.port {
            return Ok(());
        }
        let config = UartConfig::try_from(coding)?;
        self.uart.set_configuration(&config)?;
        Ok(())
    }

    fn line_coding(&mut self, port: usize) -> Option<LineCoding> {
        (port == self.port).then(|| LineCoding::from(&self.uart.get_configuration()))
    }

    fn set_control_line_state(&mut self, port: usize, state: ControlLineState) -> Result<(), PortError> {
        if port == self.port {
            self.control = state;
        }
        Ok(())
    }

    fn send_break(&mut self, port: usize, duration_ms: u16) -> Result<(), PortError> {
        if port != self.port {
            return Ok(());
        }
        let now = (self.now_ms)();
        if duration_ms != 0 {
            self.break_start = Some(now);
            self.events.set(Events::TARGET_HOLD);
        } else {
            let long = self
                .break_start
                .take()
                .map_or(false, |start| now.wrapping_sub(start) >= LONG_BREAK_MS);
            debug!("cdc{}: break released, long: {}", port, long);
            let mut events = Events::RESET;
            events.set(Events::SEND_UID, long);
            self.events.set(events);
        }
        Ok(())
    }

    fn data_received(&mut self, port: usize, _available: usize) {
        if port == self.port {
            self.events.set(Events::SERIAL);
        }
    }
}
