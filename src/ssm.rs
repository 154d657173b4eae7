//! Sequential state machine runtime.
//!
//! Asynchronous driver design encourages a state machine behind each device
//! phase. In most cases the machine is entirely linear: the handler for the
//! current state fires one transfer, and the transfer's completion moves the
//! machine to the next state. Arbitrary jumps are also allowed, plus an
//! implicit accepting state and an implicit error state reachable from
//! everywhere.
//!
//! Every machine belongs to a session worker. The worker drains a single
//! multi-producer queue, so handlers and completion callbacks always run with
//! exclusive access to the session; code on other threads (transfer
//! completions, the host API) only ever enqueues. A handler inspects the
//! state it was invoked for, issues at most one transfer, and returns; if it
//! has nothing in flight it must declare itself idle with [`Ssm::mark_idle`]
//! so an asynchronous abort can be served immediately instead of waiting for
//! a transition that will never come.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Consumer end of a session's event queue, fed to [`EventLoop::new`].
pub struct EventQueue<D>(UnboundedReceiver<Event<D>>);

/// Error carried by an aborted state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsmError {
    /// Transfer cancelled, timed out, short or failed at the transport.
    Io,
    /// Unexpected opcode, length mismatch or framing inconsistency.
    Protocol,
    /// Allocation or transfer-slot exhaustion.
    Resource,
    /// Termination explicitly requested while the machine was running.
    Cancelled,
}

impl fmt::Display for SsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SsmError::Io => "I/O error",
            SsmError::Protocol => "protocol error",
            SsmError::Resource => "out of resources",
            SsmError::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for SsmError {}

/// How one run of a machine ended.
pub type Outcome = Result<(), SsmError>;

type SsmId = u64;

type Handler<D> = Box<dyn FnMut(&mut D, &Ssm<D>, usize) + Send>;
type Callback<D> = Box<dyn FnOnce(&mut D, &Ssm<D>, Outcome) + Send>;
type CustomFn<D> = Box<dyn FnOnce(&mut D) + Send>;

enum Event<D> {
    Create {
        id: SsmId,
        nr_states: usize,
        handler: Handler<D>,
    },
    Start {
        id: SsmId,
        callback: Callback<D>,
    },
    StartSub {
        parent: SsmId,
        child: SsmId,
    },
    Next {
        id: SsmId,
    },
    Jump {
        id: SsmId,
        state: usize,
    },
    Complete {
        id: SsmId,
    },
    Abort {
        id: SsmId,
        error: SsmError,
    },
    Idle {
        id: SsmId,
    },
    Cancel {
        id: SsmId,
        outcome: Outcome,
    },
    Free {
        id: SsmId,
    },
    Custom(CustomFn<D>),
    Shutdown,
}

struct Machine<D> {
    /// Taken out for the duration of an invocation; a `None` here means the
    /// handler is on the stack right now.
    handler: Option<Handler<D>>,
    callback: Option<Callback<D>>,
    nr_states: usize,
    cur_state: usize,
    completed: bool,
    /// Terminal outcome requested by an async cancel, observed at the next
    /// transition or at `mark_idle`.
    cancelling: Option<Outcome>,
    idle: bool,
    parent: Option<SsmId>,
    child: Option<SsmId>,
}

/// Cloneable producer side of a session worker.
///
/// Creates machines and queues closures that run on the worker with
/// exclusive access to the session.
pub struct EventLoopHandle<D> {
    tx: UnboundedSender<Event<D>>,
    next_id: Arc<AtomicU64>,
}

impl<D> Clone for EventLoopHandle<D> {
    fn clone(&self) -> Self {
        EventLoopHandle {
            tx: self.tx.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<D: 'static> EventLoopHandle<D> {
    /// Create the queue feeding a new session worker.
    pub fn channel() -> (Self, EventQueue<D>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EventLoopHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, EventQueue(rx))
    }

    /// Create a machine with `nr_states` states. It comes back in the
    /// completed state so that it may be started.
    pub fn new_ssm<H>(&self, nr_states: usize, handler: H) -> Ssm<D>
    where
        H: FnMut(&mut D, &Ssm<D>, usize) + Send + 'static,
    {
        assert!(nr_states > 0, "a state machine needs at least one state");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Event::Create {
            id,
            nr_states,
            handler: Box::new(handler),
        });
        Ssm {
            id,
            tx: self.tx.clone(),
        }
    }

    /// Run `f` on the worker.
    pub fn push<F>(&self, f: F)
    where
        F: FnOnce(&mut D) + Send + 'static,
    {
        self.send(Event::Custom(Box::new(f)));
    }

    /// Ask the worker to stop draining its queue and hand back the session.
    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }

    fn send(&self, event: Event<D>) {
        if self.tx.send(event).is_err() {
            warn!("session worker is gone, dropping event");
        }
    }
}

/// Handle to one sequential state machine.
///
/// Every operation is queued onto the owning worker, so handles may be used
/// from any thread; the worker applies them one at a time in queue order.
pub struct Ssm<D> {
    id: SsmId,
    tx: UnboundedSender<Event<D>>,
}

impl<D> Clone for Ssm<D> {
    fn clone(&self) -> Self {
        Ssm {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<D: 'static> Ssm<D> {
    /// Start (or restart) the machine from state 0. `callback` runs on the
    /// worker once the machine completes or aborts.
    pub fn start<F>(&self, callback: F)
    where
        F: FnOnce(&mut D, &Ssm<D>, Outcome) + Send + 'static,
    {
        self.send(Event::Start {
            id: self.id,
            callback: Box::new(callback),
        });
    }

    /// Start `child` nested under this machine. A successful child advances
    /// this machine by one state; an aborted child aborts it with the same
    /// error. The child is freed when it detaches.
    pub fn start_subsm(&self, child: &Ssm<D>) {
        self.send(Event::StartSub {
            parent: self.id,
            child: child.id,
        });
    }

    /// Move to the following state; iterating beyond the last state marks
    /// successful completion.
    pub fn next_state(&self) {
        self.send(Event::Next { id: self.id });
    }

    /// Move to an arbitrary state.
    pub fn jump_to_state(&self, state: usize) {
        self.send(Event::Jump { id: self.id, state });
    }

    /// Finish the run successfully.
    pub fn mark_completed(&self) {
        self.send(Event::Complete { id: self.id });
    }

    /// Finish the run with `error`.
    pub fn mark_aborted(&self, error: SsmError) {
        self.send(Event::Abort { id: self.id, error });
    }

    /// Declare that the current state has no transfer in flight, making an
    /// asynchronous abort safe to serve on the spot.
    pub fn mark_idle(&self) {
        self.send(Event::Idle { id: self.id });
    }

    /// Request termination with `error` from an unknown thread. The request
    /// lands on the innermost running descendant; when exactly the machine
    /// stops is only observable through its completion callback.
    pub fn async_abort(&self, error: SsmError) {
        self.send(Event::Cancel {
            id: self.id,
            outcome: Err(error),
        });
    }

    /// Like [`Ssm::async_abort`], but the machine completes successfully.
    pub fn async_complete(&self) {
        self.send(Event::Cancel {
            id: self.id,
            outcome: Ok(()),
        });
    }

    /// Release the machine. Valid once its completion callback has run.
    pub fn free(&self) {
        self.send(Event::Free { id: self.id });
    }

    fn send(&self, event: Event<D>) {
        if self.tx.send(event).is_err() {
            warn!("session worker is gone, dropping ssm event");
        }
    }
}

/// Single consumer of a session's event queue.
///
/// Owns the session value and every machine created for it; nothing else in
/// the crate touches either except through queued events.
pub struct EventLoop<D> {
    handle: EventLoopHandle<D>,
    rx: EventQueue<D>,
    machines: HashMap<SsmId, Machine<D>>,
    dev: D,
}

impl<D: 'static> EventLoop<D> {
    pub fn new(handle: EventLoopHandle<D>, rx: EventQueue<D>, dev: D) -> Self {
        EventLoop {
            handle,
            rx,
            machines: HashMap::new(),
            dev,
        }
    }

    /// Drain the queue until shutdown, then hand the session back.
    pub async fn run(mut self) -> D {
        while let Some(event) = self.rx.0.recv().await {
            if matches!(event, Event::Shutdown) {
                debug!("session worker shutting down");
                break;
            }
            self.dispatch(event);
        }
        self.dev
    }

    fn dispatch(&mut self, event: Event<D>) {
        match event {
            Event::Create {
                id,
                nr_states,
                handler,
            } => {
                self.machines.insert(
                    id,
                    Machine {
                        handler: Some(handler),
                        callback: None,
                        nr_states,
                        cur_state: 0,
                        completed: true,
                        cancelling: None,
                        idle: false,
                        parent: None,
                        child: None,
                    },
                );
            }
            Event::Start { id, callback } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return stale(id);
                };
                assert!(machine.completed, "started a machine that is still running");
                machine.completed = false;
                machine.cur_state = 0;
                machine.callback = Some(callback);
                self.call_handler(id);
            }
            Event::StartSub { parent, child } => {
                {
                    let Some(machine) = self.machines.get_mut(&parent) else {
                        return stale(parent);
                    };
                    assert!(machine.child.is_none(), "machine already has a child");
                    machine.child = Some(child);
                }
                let Some(machine) = self.machines.get_mut(&child) else {
                    return stale(child);
                };
                assert!(machine.completed, "started a machine that is still running");
                machine.completed = false;
                machine.cur_state = 0;
                machine.callback = None;
                machine.parent = Some(parent);
                self.call_handler(child);
            }
            Event::Next { id } => self.next_state(id),
            Event::Jump { id, state } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return stale(id);
                };
                assert!(
                    machine.child.is_none(),
                    "transition on a machine with an active child"
                );
                assert!(!machine.completed, "transition on a completed machine");
                assert!(state < machine.nr_states, "jump beyond the last state");
                machine.cur_state = state;
                self.call_handler(id);
            }
            Event::Complete { id } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return stale(id);
                };
                assert!(
                    machine.child.is_none(),
                    "completion of a machine with an active child"
                );
                assert!(!machine.completed, "completed a machine twice");
                self.terminate(id, Ok(()));
            }
            Event::Abort { id, error } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return stale(id);
                };
                assert!(
                    machine.child.is_none(),
                    "abort of a machine with an active child"
                );
                assert!(!machine.completed, "aborted a completed machine");
                debug!("ssm {id} aborting from state {}: {error}", machine.cur_state);
                self.terminate(id, Err(error));
            }
            Event::Idle { id } => {
                let Some(machine) = self.machines.get_mut(&id) else {
                    return stale(id);
                };
                machine.idle = true;
                if let Some(outcome) = machine.cancelling.take() {
                    debug!("ssm {id} idled with a cancel pending");
                    self.terminate(id, outcome);
                }
            }
            Event::Cancel { id, outcome } => {
                // The request lands on the innermost running descendant.
                let mut target = id;
                while let Some(child) = self.machines.get(&target).and_then(|m| m.child) {
                    target = child;
                }
                let Some(machine) = self.machines.get_mut(&target) else {
                    return stale(target);
                };
                if machine.completed {
                    debug!("cancel for ssm {target} arrived after completion");
                } else if machine.idle {
                    debug!("ssm {target} is idle, cancelling now");
                    self.terminate(target, outcome);
                } else if machine.cancelling.is_none() {
                    debug!("ssm {target} will cancel at its next transition");
                    machine.cancelling = Some(outcome);
                }
            }
            Event::Free { id } => {
                if let Some(machine) = self.machines.remove(&id) {
                    if let Some(parent) = machine.parent {
                        if let Some(machine) = self.machines.get_mut(&parent) {
                            machine.child = None;
                        }
                    }
                }
            }
            Event::Custom(f) => f(&mut self.dev),
            Event::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn next_state(&mut self, id: SsmId) {
        let Some(machine) = self.machines.get_mut(&id) else {
            return stale(id);
        };
        assert!(
            machine.child.is_none(),
            "transition on a machine with an active child"
        );
        assert!(!machine.completed, "transition on a completed machine");
        machine.cur_state += 1;
        if machine.cur_state == machine.nr_states {
            self.terminate(id, Ok(()));
        } else {
            self.call_handler(id);
        }
    }

    /// Invoke the state handler, honouring a pending cancel first.
    fn call_handler(&mut self, id: SsmId) {
        let (state, cancelled) = {
            let machine = self.machines.get_mut(&id).expect("handler for a freed machine");
            machine.idle = false;
            (machine.cur_state, machine.cancelling.take())
        };
        if let Some(outcome) = cancelled {
            debug!("ssm {id} was asked to stop, completing instead of entering state {state}");
            self.terminate(id, outcome);
            return;
        }
        debug!("ssm {id} entering state {state}");
        let mut handler = self
            .machines
            .get_mut(&id)
            .expect("handler for a freed machine")
            .handler
            .take()
            .expect("handler invoked re-entrantly");
        let ssm = Ssm {
            id,
            tx: self.handle.tx.clone(),
        };
        handler(&mut self.dev, &ssm, state);
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.handler = Some(handler);
        }
    }

    /// Record the outcome of a finished run, then either unwind into the
    /// parent machine or queue the completion callback.
    fn terminate(&mut self, id: SsmId, outcome: Outcome) {
        let (parent, callback) = {
            let machine = self.machines.get_mut(&id).expect("terminated a freed machine");
            machine.completed = true;
            machine.idle = false;
            machine.cancelling = None;
            (machine.parent, machine.callback.take())
        };
        debug!("ssm {id} completed with {outcome:?}");
        if let Some(parent) = parent {
            // A nested machine detaches and is freed as part of the parent
            // transition it causes.
            self.machines.remove(&id);
            let machine = self
                .machines
                .get_mut(&parent)
                .expect("nested machine outlived its parent");
            machine.child = None;
            match outcome {
                Ok(()) => self.next_state(parent),
                Err(error) => self.terminate(parent, Err(error)),
            }
        } else if let Some(callback) = callback {
            let ssm = Ssm {
                id,
                tx: self.handle.tx.clone(),
            };
            self.handle.push(move |dev| callback(dev, &ssm, outcome));
        }
    }
}

fn stale(id: SsmId) {
    warn!("event for freed ssm {id} dropped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDev {
        handle: EventLoopHandle<TestDev>,
        states: Vec<usize>,
        outcome: Option<Outcome>,
        runs: usize,
    }

    fn test_loop() -> (EventLoopHandle<TestDev>, EventLoop<TestDev>) {
        let (handle, rx) = EventLoopHandle::channel();
        let dev = TestDev {
            handle: handle.clone(),
            states: Vec::new(),
            outcome: None,
            runs: 0,
        };
        let event_loop = EventLoop::new(handle.clone(), rx, dev);
        (handle, event_loop)
    }

    fn finish(dev: &mut TestDev, outcome: Outcome) {
        dev.outcome = Some(outcome);
        dev.runs += 1;
        dev.handle.shutdown();
    }

    #[tokio::test]
    async fn linear_run_visits_every_state() {
        let (handle, event_loop) = test_loop();
        let ssm = handle.new_ssm(3, |dev: &mut TestDev, ssm, state| {
            dev.states.push(state);
            ssm.next_state();
        });
        ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![0, 1, 2]);
        assert_eq!(dev.outcome, Some(Ok(())));
    }

    #[tokio::test]
    async fn jump_then_abort_skips_states() {
        let (handle, event_loop) = test_loop();
        let ssm = handle.new_ssm(4, |dev: &mut TestDev, ssm, state| {
            dev.states.push(state);
            match state {
                0 => ssm.next_state(),
                1 => ssm.jump_to_state(3),
                3 => ssm.mark_aborted(SsmError::Protocol),
                other => panic!("unexpected state {other}"),
            }
        });
        ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![0, 1, 3]);
        assert_eq!(dev.outcome, Some(Err(SsmError::Protocol)));
    }

    #[tokio::test]
    async fn async_abort_is_served_while_idle() {
        let (handle, event_loop) = test_loop();
        let (parked_tx, parked_rx) = std::sync::mpsc::channel();
        let ssm = handle.new_ssm(2, move |dev: &mut TestDev, ssm, state| {
            dev.states.push(state);
            ssm.mark_idle();
            parked_tx.send(()).unwrap();
        });
        ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        let aborter = {
            let ssm = ssm.clone();
            std::thread::spawn(move || {
                parked_rx.recv().unwrap();
                ssm.async_abort(SsmError::Io);
            })
        };
        let dev = event_loop.run().await;
        aborter.join().unwrap();
        assert_eq!(dev.states, vec![0]);
        assert_eq!(dev.outcome, Some(Err(SsmError::Io)));
    }

    #[tokio::test]
    async fn async_abort_is_observed_at_the_next_transition() {
        let (handle, event_loop) = test_loop();
        let ssm = handle.new_ssm(3, |dev: &mut TestDev, _ssm, state| {
            // Pretend a transfer is in flight; the test completes it below.
            dev.states.push(state);
        });
        ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        ssm.async_abort(SsmError::Io);
        // The "transfer completion" transition observes the cancel instead
        // of running state 1.
        ssm.next_state();
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![0]);
        assert_eq!(dev.outcome, Some(Err(SsmError::Io)));
    }

    #[tokio::test]
    async fn pending_cancel_fires_when_the_machine_idles() {
        let (handle, event_loop) = test_loop();
        let ssm = handle.new_ssm(2, |dev: &mut TestDev, _ssm, state| {
            dev.states.push(state);
        });
        ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        ssm.async_complete();
        ssm.mark_idle();
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![0]);
        assert_eq!(dev.outcome, Some(Ok(())));
    }

    #[tokio::test]
    async fn nested_machine_advances_its_parent() {
        let (handle, event_loop) = test_loop();
        let parent = handle.new_ssm(2, |dev: &mut TestDev, ssm, state| {
            dev.states.push(100 + state);
            match state {
                0 => {
                    let child = dev.handle.new_ssm(2, |dev: &mut TestDev, ssm, state| {
                        dev.states.push(200 + state);
                        ssm.next_state();
                    });
                    ssm.start_subsm(&child);
                }
                _ => ssm.next_state(),
            }
        });
        parent.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![100, 200, 201, 101]);
        assert_eq!(dev.outcome, Some(Ok(())));
    }

    #[tokio::test]
    async fn nested_machine_abort_propagates_to_the_parent() {
        let (handle, event_loop) = test_loop();
        let parent = handle.new_ssm(2, |dev: &mut TestDev, ssm, state| {
            dev.states.push(100 + state);
            let child = dev.handle.new_ssm(1, |_dev: &mut TestDev, ssm, _state| {
                ssm.mark_aborted(SsmError::Io);
            });
            ssm.start_subsm(&child);
        });
        parent.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![100]);
        assert_eq!(dev.outcome, Some(Err(SsmError::Io)));
    }

    #[tokio::test]
    async fn completed_machine_can_be_restarted() {
        let (handle, event_loop) = test_loop();
        let ssm = handle.new_ssm(2, |dev: &mut TestDev, ssm, state| {
            dev.states.push(state);
            ssm.next_state();
        });
        ssm.start(|dev: &mut TestDev, ssm, _outcome| {
            dev.runs += 1;
            ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        });
        let dev = event_loop.run().await;
        assert_eq!(dev.states, vec![0, 1, 0, 1]);
        assert_eq!(dev.runs, 2);
        assert_eq!(dev.outcome, Some(Ok(())));
    }

    #[tokio::test]
    #[should_panic(expected = "jump beyond the last state")]
    async fn jump_past_the_last_state_is_fatal() {
        let (handle, event_loop) = test_loop();
        let ssm = handle.new_ssm(2, |_dev: &mut TestDev, ssm, state| {
            if state == 0 {
                ssm.jump_to_state(2);
            }
        });
        ssm.start(|dev: &mut TestDev, _ssm, outcome| finish(dev, outcome));
        event_loop.run().await;
    }
}
