//! Main event task: LEDs, USB connect sequencing, target reset and power.
//!
//! The firmware feeds [`MainTask::handle`] with the flags taken from its
//! [`EventGroup`](crate::event::EventGroup), typically in a loop around
//! `EventGroup::wait`, and acts on the returned [`Control`]. Flags are handled
//! in a fixed order: USB disconnect, target hold, reset, power down, debug
//! disable, then the 90 ms and 30 ms ticks.

use log::{debug, trace};

use crate::drive::{Drive, MountEvent};
use crate::event::{Activity, Events, Leds};
use crate::target::{TargetDebug, TargetState};

/// 90 ms ticks the bus counts as busy after mass-storage traffic.
pub const USB_BUSY_TICKS: u32 = 10;
/// 90 ms ticks before the first connect.
pub const USB_CONNECT_DELAY_TICKS: u32 = 2;
/// 90 ms ticks a requested reconnect waits for the bus to go idle.
pub const USB_DISCONNECT_TICKS: u32 = 4;
/// 90 ms ticks off the bus during a reconnect.
pub const USB_RECONNECT_DELAY_TICKS: u32 = 10;
/// Period of the slow tick.
pub const SLOW_TICK_MS: u32 = 90;

/// Board services used by the main task.
pub trait Board {
    /// Drive an LED.
    fn set_led(&mut self, led: Leds, on: bool);
    /// Enable the reset button edge interrupt. It raises
    /// [`Events::RESET`] once and disarms itself.
    fn arm_reset_button(&mut self);
    /// Switch target power.
    fn set_power(&mut self, on: bool);
    /// Attach to or detach from the bus.
    fn usb_connect(&mut self, connect: bool);
    /// Whether the host has configured the device.
    fn usb_configured(&self) -> bool;
}

/// Byte sink towards the host, used for the unique id on reset.
pub trait Console {
    /// Queue `data`, returning how much was taken.
    fn send(&mut self, data: &[u8]) -> usize;
}

impl<const S: usize, const R: usize> Console for crate::cdc::CdcContext<S, R> {
    fn send(&mut self, data: &[u8]) -> usize {
        self.data_send(data)
    }
}

/// Collaborators for one [`MainTask::handle`] call.
pub struct Io<'r> {
    /// Board GPIO and USB attach.
    pub board: &'r mut dyn Board,
    /// Target debug transport.
    pub target: &'r mut dyn TargetDebug,
    /// Drag-and-drop drive, when the build has one.
    pub drive: Option<&'r mut dyn Drive>,
    /// Virtual COM port, when the build has one.
    pub console: Option<&'r mut dyn Console>,
}

/// What the firmware must do after [`MainTask::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Control {
    /// Keep waiting for events.
    Continue,
    /// The host configured the device; start the DAP and serial services.
    ServicesReady,
    /// Reset the interface chip.
    SystemReset,
    /// Stop; only a physical reset recovers.
    Halt,
}

/// LED behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedMode {
    /// Activity is ignored.
    Off,
    /// Blink once per activity note.
    Flash,
    /// Blink until the mode changes.
    FlashPermanent,
}

/// USB attach sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbState {
    /// Detach once the bus is idle.
    Disconnecting,
    /// Detach once idle, then attach again.
    DisconnectConnect,
    /// Attach after a delay.
    Connecting,
    /// Attached, waiting for the host to configure.
    CheckConnected,
    /// Configured.
    Connected,
    /// Detached.
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct LedChannel {
    led: Leds,
    mode: LedMode,
    active: bool,
    lit: bool,
}

impl LedChannel {
    const fn new(led: Leds) -> Self {
        Self { led, mode: LedMode::Flash, active: false, lit: true }
    }

    fn blink(&mut self, permanent: bool) {
        self.active = true;
        self.mode = if permanent { LedMode::FlashPermanent } else { LedMode::Flash };
    }

    /// New LED level, if it changes on this tick.
    fn tick(&mut self) -> Option<bool> {
        if !self.active || self.mode == LedMode::Off {
            return None;
        }
        if self.lit {
            self.lit = false;
        } else {
            self.lit = true;
            if self.mode == LedMode::Flash {
                self.active = false;
            }
        }
        Some(self.lit)
    }
}

fn dec_zero(count: &mut u32) -> u32 {
    *count = count.saturating_sub(1);
    *count
}

/// State owned by the main event task.
pub struct MainTask<'a> {
    activity: &'a Activity,
    leds: [LedChannel; 3],
    usb_state: UsbState,
    usb_state_count: u32,
    busy_count: u32,
    services_started: bool,
    button_armed: bool,
    send_uid: bool,
}

impl<'a> MainTask<'a> {
    /// Fresh task reading LED and bus activity from `activity`.
    pub fn new(activity: &'a Activity) -> Self {
        Self {
            activity,
            leds: [LedChannel::new(Leds::DAP), LedChannel::new(Leds::CDC), LedChannel::new(Leds::MSC)],
            usb_state: UsbState::Disconnected,
            usb_state_count: 0,
            busy_count: 0,
            services_started: false,
            button_armed: false,
            send_uid: false,
        }
    }

    /// Light the LEDs, enable the drive and start the first bus attach.
    pub fn start(&mut self, io: &mut Io<'_>) {
        for led in [Leds::DAP, Leds::CDC, Leds::MSC] {
            io.board.set_led(led, true);
        }
        io.board.set_power(true);
        if let Some(drive) = io.drive.as_deref_mut() {
            drive.enable(true);
        }
        io.board.usb_connect(false);
        self.usb_state = UsbState::Connecting;
        self.usb_state_count = USB_CONNECT_DELAY_TICKS;
    }

    /// Bus attach state.
    pub fn usb_state(&self) -> UsbState {
        self.usb_state
    }

    /// Current mode of `led`.
    pub fn led_mode(&self, led: Leds) -> Option<LedMode> {
        self.leds.iter().find(|c| c.led == led).map(|c| c.mode)
    }

    /// Blink `leds` on the next fast ticks.
    pub fn blink(&mut self, leds: Leds, permanent: bool) {
        for channel in self.leds.iter_mut().filter(|c| leds.contains(c.led)) {
            channel.blink(permanent);
        }
    }

    /// Handle one batch of events.
    pub fn handle(&mut self, events: Events, io: &mut Io<'_>) -> Control {
        let mut control = Control::Continue;

        if events.contains(Events::USB_DISCONNECT) {
            self.busy_count = 0;
            self.usb_state_count = USB_DISCONNECT_TICKS;
            self.usb_state = UsbState::DisconnectConnect;
        }

        if events.contains(Events::TARGET_HOLD) {
            io.target.set_state(TargetState::ResetHold);
        }

        if events.contains(Events::SEND_UID) {
            self.send_uid = true;
        }

        if events.contains(Events::RESET) {
            self.reset_target(io);
        }

        if events.contains(Events::POWERDOWN) {
            debug!("main: power down");
            io.target.set_state(TargetState::NoDebug);
            io.board.usb_connect(false);
            io.board.set_power(false);
            for led in [Leds::DAP, Leds::CDC, Leds::MSC] {
                io.board.set_led(led, false);
            }
            return Control::Halt;
        }

        if events.contains(Events::DISABLE_DEBUG) {
            debug!("main: debug disabled");
            io.target.set_state(TargetState::NoDebug);
            return Control::Halt;
        }

        if events.contains(Events::TICK_90MS) {
            control = control.max(self.slow_tick(io));
        }

        if events.contains(Events::TICK_30MS) {
            self.fast_tick(io);
        }

        control
    }

    fn reset_target(&mut self, io: &mut Io<'_>) {
        self.set_cdc_mode(LedMode::Off, io);
        if core::mem::take(&mut self.send_uid) {
            // keep the target quiet on the serial port while the id goes out
            io.target.set_state(TargetState::ResetHold);
            if let Some(console) = io.console.as_deref_mut() {
                let id = io.target.unique_id();
                let sent = console.send(id.as_bytes());
                trace!("main: sent {} of {} id bytes", sent, id.len());
            }
        }
        io.target.set_state(TargetState::ResetRun);
        self.set_cdc_mode(LedMode::Flash, io);
        self.button_armed = false;
    }

    fn set_cdc_mode(&mut self, mode: LedMode, io: &mut Io<'_>) {
        if let Some(channel) = self.leds.iter_mut().find(|c| c.led == Leds::CDC) {
            channel.mode = mode;
            channel.lit = mode != LedMode::Off;
            io.board.set_led(Leds::CDC, channel.lit);
        }
    }

    fn slow_tick(&mut self, io: &mut Io<'_>) -> Control {
        let mut control = Control::Continue;

        if !self.button_armed {
            io.board.arm_reset_button();
            self.button_armed = true;
        }

        if let Some(drive) = io.drive.as_deref_mut() {
            match drive.periodic(SLOW_TICK_MS) {
                Some(MountEvent::Ejected { outcome, reset_target, restart }) => {
                    debug!("main: drive ejected, {:?}", outcome);
                    if restart {
                        control = Control::SystemReset;
                    } else if reset_target {
                        io.target.set_state(TargetState::ResetRun);
                    }
                }
                Some(MountEvent::Inserted) | None => {}
            }
        }

        if self.busy_count > 0 {
            self.busy_count -= 1;
        }

        match self.usb_state {
            UsbState::Disconnecting => {
                if self.busy_count == 0 {
                    io.board.usb_connect(false);
                    self.usb_state = UsbState::Disconnected;
                }
            }
            UsbState::DisconnectConnect => {
                if self.busy_count == 0 && dec_zero(&mut self.usb_state_count) == 0 {
                    io.board.usb_connect(false);
                    self.usb_state = UsbState::Connecting;
                    self.usb_state_count = USB_RECONNECT_DELAY_TICKS;
                }
            }
            UsbState::Connecting => {
                if dec_zero(&mut self.usb_state_count) == 0 {
                    io.board.usb_connect(true);
                    self.usb_state = UsbState::CheckConnected;
                }
            }
            UsbState::CheckConnected => {
                if io.board.usb_configured() {
                    self.usb_state = UsbState::Connected;
                    if !self.services_started {
                        self.services_started = true;
                        control = control.max(Control::ServicesReady);
                    }
                }
            }
            UsbState::Connected | UsbState::Disconnected => {}
        }
        control
    }

    fn fast_tick(&mut self, io: &mut Io<'_>) {
        let noted = self.activity.take();
        if noted.contains(Leds::MSC) {
            self.busy_count = USB_BUSY_TICKS;
        }
        self.blink(noted, false);
        for channel in self.leds.iter_mut() {
            if let Some(lit) = channel.tick() {
                io.board.set_led(channel.led, lit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeBoard {
        leds: Vec<(Leds, bool)>,
        arms: u32,
        power: Option<bool>,
        connects: Vec<bool>,
        configured: bool,
    }

    impl Board for FakeBoard {
        fn set_led(&mut self, led: Leds, on: bool) {
            self.leds.push((led, on));
        }

        fn arm_reset_button(&mut self) {
            self.arms += 1;
        }

        fn set_power(&mut self, on: bool) {
            self.power = Some(on);
        }

        fn usb_connect(&mut self, connect: bool) {
            self.connects.push(connect);
        }

        fn usb_configured(&self) -> bool {
            self.configured
        }
    }

    #[derive(Default)]
    struct FakeTarget {
        states: Vec<TargetState>,
    }

    impl TargetDebug for FakeTarget {
        fn set_state(&mut self, state: TargetState) -> bool {
            self.states.push(state);
            true
        }

        fn unique_id(&self) -> &str {
            "0240000032044e45"
        }
    }

    #[derive(Default)]
    struct FakeDrive {
        enabled: Option<bool>,
        ticks: u32,
        eject_at: Option<(u32, MountEvent)>,
    }

    impl Drive for FakeDrive {
        fn periodic(&mut self, elapsed_ms: u32) -> Option<MountEvent> {
            assert_eq!(elapsed_ms, SLOW_TICK_MS);
            self.ticks += 1;
            match self.eject_at {
                Some((tick, event)) if tick == self.ticks => Some(event),
                _ => None,
            }
        }

        fn enable(&mut self, enable: bool) {
            self.enabled = Some(enable);
        }
    }

    #[derive(Default)]
    struct FakeConsole {
        sent: Vec<u8>,
    }

    impl Console for FakeConsole {
        fn send(&mut self, data: &[u8]) -> usize {
            self.sent.extend_from_slice(data);
            data.len()
        }
    }

    struct Rig {
        board: FakeBoard,
        target: FakeTarget,
        drive: FakeDrive,
        console: FakeConsole,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                board: FakeBoard::default(),
                target: FakeTarget::default(),
                drive: FakeDrive::default(),
                console: FakeConsole::default(),
            }
        }

        fn io(&mut self) -> Io<'_> {
            Io {
                board: &mut self.board,
                target: &mut self.target,
                drive: Some(&mut self.drive),
                console: Some(&mut self.console),
            }
        }
    }

    fn slow() -> Events {
        Events::TICK_90MS | Events::TICK_30MS
    }

    #[test]
    fn connects_after_delay_and_starts_services_once() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        task.start(&mut rig.io());
        assert_eq!(rig.drive.enabled, Some(true));
        assert_eq!(rig.board.connects, [false]);

        assert_eq!(task.handle(slow(), &mut rig.io()), Control::Continue);
        assert_eq!(task.usb_state(), UsbState::Connecting);
        assert_eq!(task.handle(slow(), &mut rig.io()), Control::Continue);
        assert_eq!(task.usb_state(), UsbState::CheckConnected);
        assert_eq!(rig.board.connects, [false, true]);

        assert_eq!(task.handle(slow(), &mut rig.io()), Control::Continue);
        rig.board.configured = true;
        assert_eq!(task.handle(slow(), &mut rig.io()), Control::ServicesReady);
        assert_eq!(task.usb_state(), UsbState::Connected);
        assert_eq!(rig.drive.ticks, 4);
        assert_eq!(rig.board.arms, 1);

        // a reconnect does not start the services again
        task.handle(Events::USB_DISCONNECT, &mut rig.io());
        let controls: Vec<Control> = (0..20).map(|_| task.handle(slow(), &mut rig.io())).collect();
        assert!(controls.iter().all(|&c| c == Control::Continue));
        assert_eq!(task.usb_state(), UsbState::Connected);
    }

    #[test]
    fn reconnect_waits_for_idle_bus() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        activity.note(Leds::MSC);
        task.handle(Events::TICK_30MS, &mut rig.io());
        task.handle(Events::USB_DISCONNECT, &mut rig.io());
        // the disconnect request clears the busy timer
        for _ in 0..3 {
            task.handle(Events::TICK_90MS, &mut rig.io());
            assert_eq!(task.usb_state(), UsbState::DisconnectConnect);
        }
        task.handle(Events::TICK_90MS, &mut rig.io());
        assert_eq!(task.usb_state(), UsbState::Connecting);

        let mut task = MainTask::new(&activity);
        task.handle(Events::USB_DISCONNECT, &mut rig.io());
        activity.note(Leds::MSC);
        task.handle(Events::TICK_30MS, &mut rig.io());
        // the countdown only starts once the bus has gone idle
        for _ in 0..USB_BUSY_TICKS + USB_DISCONNECT_TICKS - 2 {
            task.handle(Events::TICK_90MS, &mut rig.io());
            assert_eq!(task.usb_state(), UsbState::DisconnectConnect);
        }
        task.handle(Events::TICK_90MS, &mut rig.io());
        assert_eq!(task.usb_state(), UsbState::Connecting);
    }

    #[test]
    fn reset_with_unique_id() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        task.handle(Events::TARGET_HOLD, &mut rig.io());
        assert_eq!(rig.target.states, [TargetState::ResetHold]);

        task.handle(Events::RESET | Events::SEND_UID, &mut rig.io());
        assert_eq!(rig.target.states, [TargetState::ResetHold, TargetState::ResetHold, TargetState::ResetRun]);
        assert_eq!(rig.console.sent, b"0240000032044e45");
        assert_eq!(task.led_mode(Leds::CDC), Some(LedMode::Flash));

        task.handle(Events::RESET, &mut rig.io());
        assert_eq!(rig.console.sent.len(), 16);
    }

    #[test]
    fn button_is_rearmed_after_reset() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        task.handle(Events::TICK_90MS, &mut rig.io());
        task.handle(Events::TICK_90MS, &mut rig.io());
        assert_eq!(rig.board.arms, 1);
        task.handle(Events::RESET, &mut rig.io());
        task.handle(Events::TICK_90MS, &mut rig.io());
        assert_eq!(rig.board.arms, 2);
    }

    #[test]
    fn activity_blinks_once() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        activity.note(Leds::DAP);
        task.handle(Events::TICK_30MS, &mut rig.io());
        task.handle(Events::TICK_30MS, &mut rig.io());
        task.handle(Events::TICK_30MS, &mut rig.io());
        assert_eq!(rig.board.leds, [(Leds::DAP, false), (Leds::DAP, true)]);

        task.blink(Leds::MSC, true);
        for _ in 0..4 {
            task.handle(Events::TICK_30MS, &mut rig.io());
        }
        assert_eq!(rig.board.leds.iter().filter(|(led, _)| *led == Leds::MSC).count(), 4);
        assert_eq!(task.led_mode(Leds::MSC), Some(LedMode::FlashPermanent));
    }

    #[test]
    fn drive_eject_actions() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        let eject = MountEvent::Ejected { outcome: Ok(()), reset_target: true, restart: false };
        rig.drive.eject_at = Some((1, eject));
        assert_eq!(task.handle(Events::TICK_90MS, &mut rig.io()), Control::Continue);
        assert_eq!(rig.target.states, [TargetState::ResetRun]);

        let restart = MountEvent::Ejected { outcome: Ok(()), reset_target: true, restart: true };
        rig.drive.eject_at = Some((2, restart));
        assert_eq!(task.handle(Events::TICK_90MS, &mut rig.io()), Control::SystemReset);
        assert_eq!(rig.target.states.len(), 1);
    }

    #[test]
    fn power_down_halts() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut rig = Rig::new();
        let control = task.handle(Events::POWERDOWN | Events::TICK_90MS, &mut rig.io());
        assert_eq!(control, Control::Halt);
        assert_eq!(rig.target.states, [TargetState::NoDebug]);
        assert_eq!(rig.board.power, Some(false));
        assert_eq!(rig.board.connects, [false]);
        assert_eq!(rig.drive.ticks, 0);

        let mut rig = Rig::new();
        assert_eq!(task.handle(Events::DISABLE_DEBUG, &mut rig.io()), Control::Halt);
        assert_eq!(rig.target.states, [TargetState::NoDebug]);
    }

    #[test]
    fn works_without_drive_or_console() {
        let activity = Activity::new();
        let mut task = MainTask::new(&activity);
        let mut board = FakeBoard::default();
        let mut target = FakeTarget::default();
        let mut io = Io { board: &mut board, target: &mut target, drive: None, console: None };
        task.start(&mut io);
        task.handle(Events::RESET | Events::SEND_UID | Events::TICK_90MS, &mut io);
        assert_eq!(target.states, [TargetState::ResetHold, TargetState::ResetRun]);
    }
}
