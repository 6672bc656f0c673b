//! Routing between the internal Dock emulator and the USB host.
//!
//! When the host opens the virtual serial port it asserts DTR and the
//! dongle becomes a plain protocol converter: traffic from the handheld
//! goes straight through to USB. With DTR deasserted the dongle itself
//! answers the handheld, and traffic is routed into the MNP/Dock path.
//!
//! The switch has one input and one return pipe per side. Events routed
//! toward a deselected side are discarded with `OK_NOT_CONNECTED`, the
//! same answer an unconnected pipe gives.

use crate::event::{Event, LineState, SendResult};
use crate::pipe::{send_to, Pipe, PipeRef};
use alloc::rc::Rc;
use core::cell::RefCell;

pub struct DtrSwitch {
    /// True routes to USB CDC, false to the Dock emulator.
    dtr_set: bool,
    /// Selected-side output for the downstream direction.
    dock_out: Option<PipeRef>,
    cdc_out: Option<PipeRef>,
    /// Merged return path toward the handheld.
    out: Option<PipeRef>,
}

impl DtrSwitch {
    pub fn new() -> Rc<RefCell<DtrSwitch>> {
        Rc::new(RefCell::new(DtrSwitch {
            dtr_set: false,
            dock_out: None,
            cdc_out: None,
            out: None,
        }))
    }

    pub fn set_dock_out(&mut self, out: PipeRef) {
        self.dock_out = Some(out);
    }

    pub fn set_cdc_out(&mut self, out: PipeRef) {
        self.cdc_out = Some(out);
    }

    pub fn dtr(&self) -> bool {
        self.dtr_set
    }

    /// Return-path input for the Dock side.
    pub fn dock_port(switch: &Rc<RefCell<DtrSwitch>>) -> PipeRef {
        Rc::new(RefCell::new(DockPort(switch.clone())))
    }

    /// Return-path input for the CDC side. DTR line events arrive here.
    pub fn cdc_port(switch: &Rc<RefCell<DtrSwitch>>) -> PipeRef {
        Rc::new(RefCell::new(CdcPort(switch.clone())))
    }

    fn from_dock(&mut self, event: Event) -> SendResult {
        if self.dtr_set {
            SendResult::OK_NOT_CONNECTED
        } else {
            send_to(&self.out, event)
        }
    }

    fn from_cdc(&mut self, event: Event) -> SendResult {
        if let Event::Uart(LineState::Dtr, value) = event {
            let asserted = value != 0;
            if asserted != self.dtr_set {
                log::info!("DTR {}", if asserted { "asserted" } else { "dropped" });
                self.dtr_set = asserted;
            }
            return SendResult::Ok;
        }
        if self.dtr_set {
            send_to(&self.out, event)
        } else {
            SendResult::OK_NOT_CONNECTED
        }
    }
}

impl Pipe for DtrSwitch {
    /// Downstream direction: traffic coming from the handheld.
    fn send(&mut self, event: Event) -> SendResult {
        if self.dtr_set {
            send_to(&self.cdc_out, event)
        } else {
            send_to(&self.dock_out, event)
        }
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}

struct DockPort(Rc<RefCell<DtrSwitch>>);

impl Pipe for DockPort {
    fn send(&mut self, event: Event) -> SendResult {
        self.0.borrow_mut().from_dock(event)
    }
    fn set_out(&mut self, out: PipeRef) {
        self.0.borrow_mut().set_dock_out(out);
    }
}

struct CdcPort(Rc<RefCell<DtrSwitch>>);

impl Pipe for CdcPort {
    fn send(&mut self, event: Event) -> SendResult {
        self.0.borrow_mut().from_cdc(event)
    }
    fn set_out(&mut self, out: PipeRef) {
        self.0.borrow_mut().set_cdc_out(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Sink(Vec<Event>);

    impl Pipe for Sink {
        fn send(&mut self, event: Event) -> SendResult {
            self.0.push(event);
            SendResult::Ok
        }
        fn set_out(&mut self, _out: PipeRef) {}
    }

    fn sink() -> Rc<RefCell<Sink>> {
        Rc::new(RefCell::new(Sink(Vec::new())))
    }

    #[test]
    fn routes_by_dtr_state() {
        let switch = DtrSwitch::new();
        let dock = sink();
        let cdc = sink();
        switch.borrow_mut().set_dock_out(dock.clone());
        switch.borrow_mut().set_cdc_out(cdc.clone());
        let cdc_port = DtrSwitch::cdc_port(&switch);

        switch.borrow_mut().send(Event::Data(1));
        assert_eq!(dock.borrow().0.len(), 1);
        assert_eq!(cdc.borrow().0.len(), 0);

        cdc_port
            .borrow_mut()
            .send(Event::Uart(LineState::Dtr, 1));
        switch.borrow_mut().send(Event::Data(2));
        assert_eq!(dock.borrow().0.len(), 1);
        assert_eq!(cdc.borrow().0, [Event::Data(2)]);
    }

    #[test]
    fn deselected_side_discards_return_traffic() {
        let switch = DtrSwitch::new();
        let back = sink();
        switch.borrow_mut().set_out(back.clone());
        let dock_port = DtrSwitch::dock_port(&switch);
        let cdc_port = DtrSwitch::cdc_port(&switch);

        // DTR down: the dock side owns the return path.
        assert!(dock_port.borrow_mut().send(Event::Data(7)).is_ok());
        assert_eq!(back.borrow().0, [Event::Data(7)]);
        assert_eq!(
            cdc_port.borrow_mut().send(Event::Data(8)),
            SendResult::OK_NOT_CONNECTED
        );
        assert_eq!(back.borrow().0.len(), 1);
    }
}
