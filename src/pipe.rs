//! The pipe contract every stage implements.
//!
//! A pipe accepts events through [`Pipe::send`] and forwards them to the
//! pipe assigned as its output. Stages that need scheduler time also
//! override [`Pipe::tick`], and stages interested in broadcasts override
//! [`Pipe::signal`]. Composition is expressed by connecting outputs:
//! `a.set_out(b)` reads as "a sends into b".

use crate::event::{Event, SendResult};
use alloc::rc::Rc;
use core::cell::RefCell;

/// Shared handle to a stage in the graph.
pub type PipeRef = Rc<RefCell<dyn Pipe>>;

pub trait Pipe {
    /// Hand an event to this stage. A `Rejected` result means the caller
    /// must keep the event and resubmit it on a later tick.
    fn send(&mut self, event: Event) -> SendResult;

    /// One scheduler time slice. `cycle_us` is the wall-time spent since
    /// the previous round, never zero. Must not block.
    fn tick(&mut self, cycle_us: u32) -> SendResult {
        let _ = cycle_us;
        SendResult::Ok
    }

    /// A scheduler broadcast, e.g. a settings change.
    fn signal(&mut self, event: Event) -> SendResult {
        let _ = event;
        SendResult::Ok
    }

    /// Assign the stage this one sends into. Stages with several outputs
    /// expose additional connect methods of their own.
    fn set_out(&mut self, out: PipeRef);
}

/// Forward an event to an optional output, answering `OK_NOT_CONNECTED`
/// when no pipe is assigned (the event is discarded, not an error).
pub fn send_to(out: &Option<PipeRef>, event: Event) -> SendResult {
    match out {
        Some(pipe) => pipe.borrow_mut().send(event),
        None => SendResult::OK_NOT_CONNECTED,
    }
}

/// Convenience for wiring: `connect(&a, &b)` makes `b` the output of `a`.
pub fn connect(from: &PipeRef, to: &PipeRef) {
    from.borrow_mut().set_out(to.clone());
}
