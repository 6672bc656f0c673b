//! Assembly of the dongle's pipe graph.
//!
//! The graph mirrors the dongle's data flow:
//!
//! ```text
//! UART ───────────────► Hayes₀ ────────────────► DTR ──► Hayes₁ ──► buffer ──► CDC
//! UART ◄── buffer ◄── Hayes₀ ◄── Throttle ◄── DTR ◄── Hayes₁ ◄───────────── CDC
//!                                               │
//!                                              MNP ◄─► Dock ◄─► SD card
//! ```
//!
//! With the host's DTR deasserted the handheld talks to the built-in
//! Dock emulator through the MNP filter; with DTR asserted the dongle
//! is a plain USB serial adapter. Everything is allocated once, wired,
//! and then driven by the scheduler forever.

use crate::endpoints::cdc::{CdcDriver, CdcEndpoint};
use crate::endpoints::dock::Dock;
use crate::endpoints::sdcard::SdCardRef;
use crate::endpoints::uart::{UartDriver, UartEndpoint};
use crate::event::{Event, Signal};
use crate::filters::dtr::DtrSwitch;
use crate::filters::hayes::HayesFilter;
use crate::filters::mnp::MnpFilter;
use crate::pipe::{Pipe, PipeRef};
use crate::pipes::buffered::BufferedPipe;
use crate::pipes::throttle::MnpThrottle;
use crate::sched::{Clock, Jobs, Scheduler};
use crate::settings::{SettingsRef, SettingsStore, UserSettings};
use crate::status::{StatusDisplay, StatusLamp, StatusRef};
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

/// Ring size for the two rate-decoupling buffers.
const RING_SIZE: usize = 512;

pub struct Bridge {
    pub scheduler: Scheduler,
    pub settings: SettingsRef,
    pub status: StatusRef,
    pub mnp: Rc<RefCell<MnpFilter>>,
    pub dock: Rc<RefCell<Dock>>,
}

impl Bridge {
    pub fn new(
        uart: Box<dyn UartDriver>,
        cdc: Box<dyn CdcDriver>,
        sdcard: SdCardRef,
        store: Option<Box<dyn SettingsStore>>,
        lamp: Box<dyn StatusLamp>,
        clock: Box<dyn Clock>,
    ) -> Bridge {
        let mut scheduler = Scheduler::new(clock);
        let settings = UserSettings::shared(store);
        if settings.borrow_mut().read().is_err() {
            log::warn!("bridge: settings unavailable, factory defaults in effect");
        }

        let status = StatusDisplay::new(lamp);

        // Endpoints.
        let uart_endpoint = Rc::new(RefCell::new(UartEndpoint::new(uart)));
        let cdc_endpoint = Rc::new(RefCell::new(CdcEndpoint::new(cdc)));
        cdc_endpoint.borrow_mut().link_status(status.clone());
        let dock = Rc::new(RefCell::new(Dock::new(sdcard.clone())));
        dock.borrow_mut().link_status(status.clone());

        // Filters and pipes.
        let uart_hayes = HayesFilter::new(0, settings.clone(), scheduler.signal_queue());
        let cdc_hayes = HayesFilter::new(1, settings.clone(), scheduler.signal_queue());
        uart_hayes.borrow_mut().link_sdcard(sdcard.clone());
        cdc_hayes.borrow_mut().link_sdcard(sdcard);
        let mnp = MnpFilter::new();
        let dtr = DtrSwitch::new();
        let throttle = Rc::new(RefCell::new(MnpThrottle::new(settings.clone())));
        let buffer_to_cdc: Rc<RefCell<BufferedPipe<RING_SIZE>>> =
            Rc::new(RefCell::new(BufferedPipe::new()));
        let buffer_to_uart: Rc<RefCell<BufferedPipe<RING_SIZE>>> =
            Rc::new(RefCell::new(BufferedPipe::new()));

        // Downstream direction: handheld toward Dock or host.
        uart_endpoint
            .borrow_mut()
            .set_out(uart_hayes.clone() as PipeRef);
        uart_hayes.borrow_mut().set_upstream_out(dtr.clone() as PipeRef);
        dtr.borrow_mut().set_dock_out(mnp.clone() as PipeRef);
        mnp.borrow_mut().set_dock_out(dock.clone() as PipeRef);
        dtr.borrow_mut()
            .set_cdc_out(HayesFilter::upstream_port(&cdc_hayes));
        cdc_hayes
            .borrow_mut()
            .set_out(buffer_to_cdc.clone() as PipeRef);
        buffer_to_cdc
            .borrow_mut()
            .set_out(cdc_endpoint.clone() as PipeRef);
        // A flooded USB buffer stops the handheld via the flow pin.
        buffer_to_cdc
            .borrow_mut()
            .set_back(uart_endpoint.clone() as PipeRef);

        // Upstream direction: Dock or host back toward the handheld.
        dock.borrow_mut().set_out(MnpFilter::dock_port(&mnp));
        mnp.borrow_mut().set_out(DtrSwitch::dock_port(&dtr));
        cdc_endpoint
            .borrow_mut()
            .set_out(cdc_hayes.clone() as PipeRef);
        cdc_hayes
            .borrow_mut()
            .set_upstream_out(DtrSwitch::cdc_port(&dtr));
        dtr.borrow_mut().set_out(throttle.clone() as PipeRef);
        throttle
            .borrow_mut()
            .set_out(HayesFilter::upstream_port(&uart_hayes));
        uart_hayes
            .borrow_mut()
            .set_out(buffer_to_uart.clone() as PipeRef);
        buffer_to_uart
            .borrow_mut()
            .set_out(uart_endpoint.clone() as PipeRef);

        // Scheduling.
        scheduler
            .add(uart_endpoint, Jobs::TICKS)
            .add(cdc_endpoint, Jobs::TICKS)
            .add(dock.clone() as PipeRef, Jobs::TICKS)
            .add(mnp.clone() as PipeRef, Jobs::TICKS)
            .add(uart_hayes, Jobs::TICKS | Jobs::SIGNALS)
            .add(cdc_hayes, Jobs::TICKS | Jobs::SIGNALS)
            .add(throttle, Jobs::TICKS | Jobs::SIGNALS)
            .add(buffer_to_cdc, Jobs::TICKS)
            .add(buffer_to_uart, Jobs::TICKS)
            .add(status.clone() as PipeRef, Jobs::TICKS);

        scheduler.signal_all(Event::Signal(Signal::UserSettingsChanged));

        Bridge {
            scheduler,
            settings,
            status,
            mnp,
            dock,
        }
    }

    /// Hand control to the scheduler. Never returns in firmware use.
    pub fn run(&mut self) -> ! {
        log::info!("CrabDock v{} running", env!("CARGO_PKG_VERSION"));
        self.scheduler.run()
    }

    /// Drive a bounded number of rounds (hosted and test use).
    pub fn run_rounds(&mut self, rounds: u32) {
        self.scheduler.run_rounds(rounds);
    }
}
