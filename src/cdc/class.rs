use log::{trace, warn};
use usb_device::class_prelude::*;
use usb_device::Result;

use super::{
    CdcAcmPorts, CdcContext, ControlLineState, LineCoding, PacketIo, PortError, SerialState, USB_CLASS_CDC,
    USB_CLASS_CDC_DATA,
};

const CDC_SUBCLASS_ACM: u8 = 0x02;
const CDC_PROTOCOL_NONE: u8 = 0x00;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_CALL_MANAGEMENT: u8 = 0x01;
const CDC_TYPE_ACM: u8 = 0x02;
const CDC_TYPE_UNION: u8 = 0x06;

// Line coding, control line state and send break requests
const ACM_CAPABILITIES: u8 = 0x06;

const REQ_SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
const REQ_SET_LINE_CODING: u8 = 0x20;
const REQ_GET_LINE_CODING: u8 = 0x21;
const REQ_SET_CONTROL_LINE_STATE: u8 = 0x22;
const REQ_SEND_BREAK: u8 = 0x23;

const NOTIFY_SERIAL_STATE: u8 = 0x20;
const NOTIFY_REQUEST_TYPE: u8 = 0xa1;
const NOTIFY_PACKET_SIZE: u16 = 16;
const NOTIFY_INTERVAL_MS: u8 = 32;

struct PortEndpoints<'a, B: UsbBus> {
    comm_if: InterfaceNumber,
    data_if: InterfaceNumber,
    comm_ep: EndpointIn<'a, B>,
    read_ep: EndpointOut<'a, B>,
    write_ep: EndpointIn<'a, B>,
}

impl<'a, B: UsbBus> PortEndpoints<'a, B> {
    fn new(alloc: &'a UsbBusAllocator<B>, max_packet_size: u16) -> Self {
        // Interfaces of one port must be adjacent for the IAD.
        Self {
            comm_if: alloc.interface(),
            data_if: alloc.interface(),
            comm_ep: alloc.interrupt(NOTIFY_PACKET_SIZE, NOTIFY_INTERVAL_MS),
            read_ep: alloc.bulk(max_packet_size),
            write_ep: alloc.bulk(max_packet_size),
        }
    }

    fn io(&self) -> EndpointPair<'_, 'a, B> {
        EndpointPair { read: &self.read_ep, write: &self.write_ep }
    }
}

struct EndpointPair<'e, 'a, B: UsbBus> {
    read: &'e EndpointOut<'a, B>,
    write: &'e EndpointIn<'a, B>,
}

impl<B: UsbBus> PacketIo for EndpointPair<'_, '_, B> {
    fn max_packet_size(&self) -> usize {
        self.read.max_packet_size() as usize
    }

    fn read_packet(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.read.read(buf) {
            Ok(len) => Some(len),
            Err(UsbError::WouldBlock) => None,
            Err(err) => {
                warn!("cdc: OUT endpoint read failed: {:?}", err);
                None
            }
        }
    }

    fn write_packet(&mut self, data: &[u8]) -> Option<usize> {
        match self.write.write(data) {
            Ok(len) => Some(len),
            Err(UsbError::WouldBlock) => None,
            Err(err) => {
                warn!("cdc: IN endpoint write failed: {:?}", err);
                None
            }
        }
    }
}

/// `N` CDC ACM virtual COM ports on one USB device.
///
/// Each port gets its own interface pair behind an interface association,
/// a notification endpoint and a bulk endpoint pair. `S` and `R` size each
/// port's send ring and receive window. Port behaviour comes from `P`.
pub struct CdcAcmClass<'a, B: UsbBus, P: CdcAcmPorts, const N: usize, const S: usize, const R: usize> {
    endpoints: [PortEndpoints<'a, B>; N],
    contexts: [CdcContext<S, R>; N],
    ports: P,
}

impl<'a, B: UsbBus, P: CdcAcmPorts, const N: usize, const S: usize, const R: usize> CdcAcmClass<'a, B, P, N, S, R> {
    /// Allocate interfaces and endpoints for all ports.
    pub fn new(alloc: &'a UsbBusAllocator<B>, max_packet_size: u16, ports: P) -> Self {
        Self {
            endpoints: core::array::from_fn(|_| PortEndpoints::new(alloc, max_packet_size)),
            contexts: core::array::from_fn(|_| CdcContext::new()),
            ports,
        }
    }

    /// Bring a port up.
    pub fn initialize(&mut self, port: usize) -> core::result::Result<(), PortError> {
        let ctx = self.contexts.get_mut(port).ok_or(PortError::Unsupported)?;
        ctx.reset();
        self.ports.initialize(port)
    }

    /// Take a port down.
    pub fn uninitialize(&mut self, port: usize) -> core::result::Result<(), PortError> {
        let ctx = self.contexts.get_mut(port).ok_or(PortError::Unsupported)?;
        ctx.reset();
        self.ports.uninitialize(port)
    }

    /// Queue bytes for the host on `port`.
    pub fn data_send(&mut self, port: usize, data: &[u8]) -> usize {
        self.contexts.get_mut(port).map_or(0, |ctx| ctx.data_send(data))
    }

    /// Free space in the send ring of `port`.
    pub fn data_free(&self, port: usize) -> usize {
        self.contexts.get(port).map_or(0, |ctx| ctx.data_free())
    }

    /// Read bytes received from the host on `port`.
    pub fn data_read(&mut self, port: usize, buf: &mut [u8]) -> usize {
        self.contexts.get_mut(port).map_or(0, |ctx| ctx.data_read(buf))
    }

    /// Unread bytes received on `port`.
    pub fn data_available(&self, port: usize) -> usize {
        self.contexts.get(port).map_or(0, |ctx| ctx.data_available())
    }

    /// Send a `SERIAL_STATE` notification on `port`.
    pub fn notify(&mut self, port: usize, state: SerialState) -> Result<usize> {
        let ep = self.endpoints.get(port).ok_or(UsbError::InvalidEndpoint)?;
        let bits = state.bits().to_le_bytes();
        ep.comm_ep.write(&[
            NOTIFY_REQUEST_TYPE,
            NOTIFY_SERIAL_STATE,
            0,
            0,
            u8::from(ep.comm_if),
            0,
            2,
            0,
            bits[0],
            bits[1],
        ])
    }

    /// Port callbacks.
    pub fn ports(&mut self) -> &mut P {
        &mut self.ports
    }

    /// Buffers of `port` together with the port callbacks, for relaying.
    pub fn split_port(&mut self, port: usize) -> Option<(&mut CdcContext<S, R>, &mut P)> {
        let ctx = self.contexts.get_mut(port)?;
        Some((ctx, &mut self.ports))
    }

    fn port_for(&self, req: &control::Request) -> Option<usize> {
        port_index(req, self.endpoints.iter().map(|ep| u8::from(ep.comm_if)))
    }
}

impl<B: UsbBus, P: CdcAcmPorts, const N: usize, const S: usize, const R: usize> UsbClass<B>
    for CdcAcmClass<'_, B, P, N, S, R>
{
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        for ep in &self.endpoints {
            writer.iad(ep.comm_if, 2, USB_CLASS_CDC, CDC_SUBCLASS_ACM, CDC_PROTOCOL_NONE, None)?;

            writer.interface(ep.comm_if, USB_CLASS_CDC, CDC_SUBCLASS_ACM, CDC_PROTOCOL_NONE)?;
            writer.write(CS_INTERFACE, &[CDC_TYPE_HEADER, 0x10, 0x01])?;
            writer.write(CS_INTERFACE, &[CDC_TYPE_CALL_MANAGEMENT, 0x00, u8::from(ep.data_if)])?;
            writer.write(CS_INTERFACE, &[CDC_TYPE_ACM, ACM_CAPABILITIES])?;
            writer.write(CS_INTERFACE, &[CDC_TYPE_UNION, u8::from(ep.comm_if), u8::from(ep.data_if)])?;
            writer.endpoint(&ep.comm_ep)?;

            writer.interface(ep.data_if, USB_CLASS_CDC_DATA, 0x00, 0x00)?;
            writer.endpoint(&ep.write_ep)?;
            writer.endpoint(&ep.read_ep)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        for (port, ctx) in self.contexts.iter_mut().enumerate() {
            ctx.reset();
            if let Err(err) = self.ports.reset(port) {
                warn!("cdc{}: port reset failed: {}", port, err);
            }
        }
    }

    fn poll(&mut self) {
        for (port, (ep, ctx)) in self.endpoints.iter().zip(self.contexts.iter_mut()).enumerate() {
            ctx.service(&mut ep.io(), &mut self.ports, port);
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        for (port, (ep, ctx)) in self.endpoints.iter().zip(self.contexts.iter_mut()).enumerate() {
            if ep.read_ep.address() == addr {
                ctx.on_bulk_out(&mut ep.io(), &mut self.ports, port);
            }
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        for (ep, ctx) in self.endpoints.iter().zip(self.contexts.iter_mut()) {
            if ep.write_ep.address() == addr {
                ctx.on_bulk_in(&mut ep.io());
            }
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        let Some(port) = self.port_for(&req) else {
            return;
        };

        match req.request {
            REQ_GET_LINE_CODING => {
                let coding = reported_line_coding(&mut self.ports, &self.contexts[port], port);
                xfer.accept_with(&coding.to_bytes()).ok();
            }
            _ => {
                trace!("cdc{}: unhandled control-IN {:#04x}", port, req.request);
                xfer.reject().ok();
            }
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();
        let Some(port) = self.port_for(&req) else {
            return;
        };

        let result = class_request(&mut self.ports, &mut self.contexts[port], port, &req, xfer.data());
        match result {
            Ok(()) => {
                xfer.accept().ok();
            }
            Err(err) => {
                trace!("cdc{}: rejected request {:#04x}: {}", port, req.request, err);
                xfer.reject().ok();
            }
        }
    }
}

/// CDC port whose communication interface a class request addresses.
fn port_index(req: &control::Request, comm_ifs: impl IntoIterator<Item = u8>) -> Option<usize> {
    if req.request_type != control::RequestType::Class || req.recipient != control::Recipient::Interface {
        return None;
    }
    comm_ifs.into_iter().position(|comm_if| req.index == comm_if as u16)
}

fn reported_line_coding<P: CdcAcmPorts, const S: usize, const R: usize>(
    ports: &mut P,
    ctx: &CdcContext<S, R>,
    port: usize,
) -> LineCoding {
    ports.line_coding(port).unwrap_or(*ctx.line_coding())
}

/// Apply a class OUT request to `port`. The context only records settings
/// the port accepted; an error stalls the request.
fn class_request<P: CdcAcmPorts, const S: usize, const R: usize>(
    ports: &mut P,
    ctx: &mut CdcContext<S, R>,
    port: usize,
    req: &control::Request,
    data: &[u8],
) -> core::result::Result<(), PortError> {
    match req.request {
        REQ_SEND_ENCAPSULATED_COMMAND => Ok(()),
        REQ_SET_LINE_CODING => {
            let coding = LineCoding::from_bytes(data).ok_or(PortError::Unsupported)?;
            ports.set_line_coding(port, &coding)?;
            ctx.set_line_coding(coding);
            Ok(())
        }
        REQ_SET_CONTROL_LINE_STATE => {
            let state = ControlLineState::from_bits_truncate(req.value);
            ports.set_control_line_state(port, state)?;
            ctx.set_control_line_state(state);
            Ok(())
        }
        REQ_SEND_BREAK => ports.send_break(port, req.value),
        _ => Err(PortError::Unsupported),
    }
}
