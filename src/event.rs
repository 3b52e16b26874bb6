//! Event flags raised from interrupt and task context for the main loop.

use core::cell::Cell;

use bitflags::bitflags;
use critical_section::Mutex;

bitflags! {
    /// Wake-up reasons of the main loop, handled in a fixed order.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Events: u32 {
        /// Slow periodic tick.
        const TICK_90MS = 1 << 0;
        /// Fast periodic tick.
        const TICK_30MS = 1 << 1;
        /// Reset the target (button release or CDC break end).
        const RESET = 1 << 2;
        /// Drop off the bus and reconnect.
        const USB_DISCONNECT = 1 << 3;
        /// Power down the board and stop.
        const POWERDOWN = 1 << 4;
        /// Release the debug port and stop.
        const DISABLE_DEBUG = 1 << 5;
        /// Hold the target in reset (CDC break start).
        const TARGET_HOLD = 1 << 6;
        /// Send the unique id over the virtual COM port with the next reset.
        const SEND_UID = 1 << 7;
        /// Serial data is waiting to be relayed.
        const SERIAL = 1 << 8;
    }
}

bitflags! {
    /// Activity LEDs.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Leds: u8 {
        /// Debug access port.
        const DAP = 1 << 0;
        /// Virtual COM port.
        const CDC = 1 << 1;
        /// Mass storage.
        const MSC = 1 << 2;
    }
}

/// Flag set shared between any number of setters and one consumer.
pub struct EventGroup {
    flags: Mutex<Cell<u32>>,
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EventGroup {
    /// No flags set.
    pub const fn new() -> Self {
        Self { flags: Mutex::new(Cell::new(0)) }
    }

    /// Raise `events`. Safe from interrupt context.
    pub fn set(&self, events: Events) {
        critical_section::with(|cs| {
            let flags = self.flags.borrow(cs);
            flags.set(flags.get() | events.bits());
        });
    }

    /// Return and clear every raised flag.
    pub fn take(&self) -> Events {
        let bits = critical_section::with(|cs| self.flags.borrow(cs).replace(0));
        Events::from_bits_truncate(bits)
    }

    /// Block until at least one flag is raised, calling `idle` (for example
    /// `cortex_m::asm::wfi`) between checks.
    pub fn wait(&self, mut idle: impl FnMut()) -> Events {
        loop {
            let events = self.take();
            if !events.is_empty() {
                return events;
            }
            idle();
        }
    }
}

/// Activity notes from other contexts, turned into LED blinks by the main loop.
pub struct Activity {
    leds: Mutex<Cell<u8>>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    /// Nothing noted.
    pub const fn new() -> Self {
        Self { leds: Mutex::new(Cell::new(0)) }
    }

    /// Note activity on `leds`.
    pub fn note(&self, leds: Leds) {
        critical_section::with(|cs| {
            let cell = self.leds.borrow(cs);
            cell.set(cell.get() | leds.bits());
        });
    }

    /// Return and clear noted activity.
    pub fn take(&self) -> Leds {
        Leds::from_bits_truncate(critical_section::with(|cs| self.leds.borrow(cs).replace(0)))
    }
}

/// Turns a 30 ms timer into the two periodic events; every third tick is
/// also a 90 ms tick.
#[derive(Debug, Default)]
pub struct TickDivider {
    count: u8,
}

impl TickDivider {
    /// Fresh divider; the first tick also fires the slow event.
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Events for one 30 ms timer expiry.
    pub fn tick(&mut self) -> Events {
        let mut events = Events::TICK_30MS;
        if self.count == 0 {
            events |= Events::TICK_90MS;
        }
        self.count = (self.count + 1) % 3;
        events
    }
}
