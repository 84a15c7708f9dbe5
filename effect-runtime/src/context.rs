//! # Fiber Context
//!
//! Per-fiber state and the interpreter loop.
//!
//! ## Run Loop
//!
//! A fiber runs on a worker until it completes, suspends on an async
//! instruction, or exhausts its yield budget. The loop keeps three stacks:
//! continuation frames, interruptibility regions and environments.
//!
//! ## Suspension Protocol
//!
//! ```text
//! Running --Async--> Suspending(epoch) --register returns--> Suspended(epoch)
//!    ^                     |                                      |
//!    |        callback during registration              callback or interrupt
//!    +---------------------+--------------------------------------+
//! ```
//!
//! Each suspension gets a fresh epoch. A callback carries its epoch and is
//! honoured only while the fiber is still waiting on that epoch, so the
//! fiber resumes exactly once whether the callback, a second callback or an
//! interruption arrives first.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cause::Cause;
use crate::continuation::{
    AnyCause, AnyExit, AnyValue, Canceler, Completion, Env, Frame, Instr, Node, Register, Resume,
    Step, TypedExit,
};
use crate::exit::Exit;
use crate::fiber::{next_fiber_id, FiberDescriptor, FiberId, FiberStatus};
use crate::panic;
use crate::runtime::Shared;
use crate::timer::Timer;

/// Typed exit of a finished fiber, shared with observers.
pub(crate) type ExitSlot = Arc<Mutex<TypedExit>>;
/// Callback run once the fiber is done.
pub(crate) type Observer = Box<dyn FnOnce(&ExitSlot) + Send>;

#[derive(Debug, Clone, Copy)]
enum Status {
    Running,
    Suspending(u64),
    Suspended { epoch: u64, interruptible: bool },
    Done,
}

/// Interpreter state of a fiber that is not on a worker.
#[derive(Default)]
pub(crate) struct RunState {
    stack: Vec<Frame>,
    regions: Vec<bool>,
    envs: Vec<Env>,
}

impl RunState {
    fn new(env: Env) -> Self {
        Self {
            stack: Vec::new(),
            regions: Vec::new(),
            envs: vec![env],
        }
    }

    fn is_interruptible(&self) -> bool {
        self.regions.last().copied().unwrap_or(true)
    }

    fn env(&self) -> Env {
        match self.envs.last() {
            Some(env) => Arc::clone(env),
            None => Arc::new(()),
        }
    }
}

struct FiberState {
    status: Status,
    epoch: u64,
    interruptor: Option<FiberId>,
    early: Option<Step>,
    parked: Option<RunState>,
    canceler: Option<Canceler>,
    observers: Vec<Observer>,
    observed: bool,
    exit: Option<ExitSlot>,
    children: Vec<Arc<FiberContext>>,
}

/// A running or finished fiber.
pub(crate) struct FiberContext {
    id: FiberId,
    parent: Option<FiberId>,
    shared: Arc<Shared>,
    completion: Completion,
    interrupted: AtomicBool,
    state: Mutex<FiberState>,
}

fn guarded(f: impl FnOnce() -> Step) -> Step {
    match panic::catch(f) {
        Ok(step) => step,
        Err(defect) => Step::Failure(Cause::die(defect)),
    }
}

impl FiberContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        parent: Option<FiberId>,
        completion: Completion,
    ) -> Arc<Self> {
        shared.stats.record_start();
        Arc::new(Self {
            id: next_fiber_id(),
            parent,
            shared,
            completion,
            interrupted: AtomicBool::new(false),
            state: Mutex::new(FiberState {
                status: Status::Running,
                epoch: 0,
                interruptor: None,
                early: None,
                parked: None,
                canceler: None,
                observers: Vec::new(),
                observed: false,
                exit: None,
                children: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn timer(&self) -> Timer {
        self.shared.timer.clone()
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match self.state.lock().status {
            Status::Running | Status::Suspending(_) => FiberStatus::Running,
            Status::Suspended { .. } => FiberStatus::Suspended,
            Status::Done => FiberStatus::Done,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state.lock().status, Status::Done)
    }

    pub(crate) fn mark_observed(&self) {
        self.state.lock().observed = true;
    }

    /// Start evaluating `instr` with `env` as the root environment.
    pub(crate) fn start(self: &Arc<Self>, env: Env, instr: Instr) {
        trace!(fiber = %self.id, parent = ?self.parent, "starting fiber");
        self.schedule(RunState::new(env), Step::Eval(instr));
    }

    fn schedule(self: &Arc<Self>, state: RunState, step: Step) {
        let fiber = Arc::clone(self);
        self.shared
            .scheduler
            .submit(Box::new(move || fiber.run(state, step)));
    }

    fn should_interrupt(&self, state: &RunState) -> bool {
        state.is_interruptible() && self.interrupted.load(Ordering::Acquire)
    }

    fn interruptor(&self) -> FiberId {
        self.state.lock().interruptor.unwrap_or(self.id)
    }

    fn descriptor(&self, state: &RunState) -> FiberDescriptor {
        FiberDescriptor {
            id: self.id,
            parent: self.parent,
            interruptible: state.is_interruptible(),
            interrupt_requested: self.interrupted.load(Ordering::Acquire),
        }
    }

    fn run(self: Arc<Self>, mut state: RunState, mut step: Step) {
        let budget = self.shared.config.fiber.yield_op_count;
        let mut ops = 0usize;

        loop {
            if self.should_interrupt(&state) && !matches!(step, Step::Failure(_)) {
                step = Step::Failure(Cause::interrupt(self.interruptor()));
            }

            ops += 1;
            if ops > budget {
                self.schedule(state, step);
                return;
            }

            step = match step {
                Step::Eval(instr) => match self.eval(&mut state, instr) {
                    Some(next) => next,
                    None => return,
                },
                Step::Then(instr, k) => {
                    state.stack.push(Frame::ApplyOnce(k));
                    Step::Eval(instr)
                }
                Step::Value(value) => match state.stack.pop() {
                    Some(frame) => apply(&mut state, frame, value),
                    None => {
                        self.complete(Exit::Success(value));
                        return;
                    }
                },
                Step::Failure(cause) => match self.unwind(&mut state, cause) {
                    Some(next) => next,
                    None => return,
                },
            };
        }
    }

    /// Evaluate one instruction. `None` means the fiber left the worker.
    fn eval(self: &Arc<Self>, state: &mut RunState, instr: Instr) -> Option<Step> {
        let next = match &*instr {
            Node::Succeed(f) => guarded(|| Step::Value(f())),
            Node::Fail(f) => guarded(|| Step::Failure(f())),
            Node::Suspend(f) => guarded(|| f()),
            Node::FlatMap(inner, k) => {
                state.stack.push(Frame::Apply(Arc::clone(k)));
                Step::Eval(Arc::clone(inner))
            }
            Node::Fold(inner, recover, k) => {
                state
                    .stack
                    .push(Frame::Fold(Arc::clone(recover), Arc::clone(k)));
                Step::Eval(Arc::clone(inner))
            }
            Node::MapCause(inner, f) => {
                state.stack.push(Frame::MapCause(Arc::clone(f)));
                Step::Eval(Arc::clone(inner))
            }
            Node::SetInterruptible(inner, flag) => {
                state.regions.push(*flag);
                state.stack.push(Frame::RestoreInterruptible);
                Step::Eval(Arc::clone(inner))
            }
            Node::CheckInterruptible(f) => {
                let flag = state.is_interruptible();
                guarded(|| f(flag))
            }
            Node::Access(f) => {
                let env = state.env();
                guarded(|| f(&env))
            }
            Node::Provide(env, inner) => {
                state.envs.push(Arc::clone(env));
                state.stack.push(Frame::PopEnv);
                Step::Eval(Arc::clone(inner))
            }
            Node::Fork {
                instr: child,
                daemon,
                completion,
            } => {
                let fiber = self.fork(Arc::clone(child), *daemon, Arc::clone(completion), state.env());
                Step::Value(Box::new(fiber))
            }
            Node::Descriptor(f) => {
                let descriptor = self.descriptor(state);
                guarded(|| f(descriptor))
            }
            Node::Yield => {
                self.schedule(mem::take(state), Step::Value(Box::new(())));
                return None;
            }
            Node::Async(register) => return self.suspend(state, register),
        };
        Some(next)
    }

    fn unwind(self: &Arc<Self>, state: &mut RunState, mut cause: AnyCause) -> Option<Step> {
        while let Some(frame) = state.stack.pop() {
            match frame {
                Frame::Apply(_) | Frame::ApplyOnce(_) => {}
                Frame::Fold(recover, _) => {
                    if self.should_interrupt(state) {
                        cause = self.discard_failures(cause);
                    } else {
                        return Some(guarded(move || recover(cause)));
                    }
                }
                Frame::MapCause(f) => {
                    cause = match panic::catch(move || f(cause)) {
                        Ok(mapped) => mapped,
                        Err(defect) => Cause::die(defect),
                    };
                }
                Frame::RestoreInterruptible => {
                    state.regions.pop();
                }
                Frame::PopEnv => {
                    state.envs.pop();
                }
            }
        }
        self.complete(Exit::halt(cause));
        None
    }

    /// Typed failures cannot outlive a skipped recovery frame, since the
    /// frames above it expect a different error type.
    fn discard_failures(&self, cause: AnyCause) -> AnyCause {
        let stripped: AnyCause = cause.strip_failures();
        if stripped.is_interrupted() {
            stripped
        } else {
            Cause::then(stripped, Cause::interrupt(self.interruptor()))
        }
    }

    fn suspend(self: &Arc<Self>, state: &mut RunState, register: &Register) -> Option<Step> {
        let epoch = {
            let mut st = self.state.lock();
            st.epoch += 1;
            st.status = Status::Suspending(st.epoch);
            st.early = None;
            st.epoch
        };

        let resume = Resume::new(Arc::clone(self), epoch);
        let canceler = match panic::catch(|| register(resume)) {
            Ok(canceler) => canceler,
            Err(defect) => {
                self.state.lock().status = Status::Running;
                return Some(Step::Failure(Cause::die(defect)));
            }
        };

        let interruptible = state.is_interruptible();
        let mut st = self.state.lock();
        if let Some(step) = st.early.take() {
            st.status = Status::Running;
            return Some(step);
        }
        if interruptible {
            if let Some(by) = st.interruptor {
                st.status = Status::Running;
                drop(st);
                if let Some(cancel) = canceler {
                    let _ = panic::catch(cancel);
                }
                return Some(Step::Failure(Cause::interrupt(by)));
            }
        }
        st.status = Status::Suspended {
            epoch,
            interruptible,
        };
        st.parked = Some(mem::take(state));
        st.canceler = canceler;
        None
    }

    pub(crate) fn resume_async(self: &Arc<Self>, epoch: u64, step: Step) {
        let mut st = self.state.lock();
        match st.status {
            Status::Suspending(current) if current == epoch => {
                if st.early.is_none() {
                    st.early = Some(step);
                }
            }
            Status::Suspended { epoch: current, .. } if current == epoch => {
                st.status = Status::Running;
                st.canceler = None;
                let parked = st.parked.take();
                drop(st);
                if let Some(state) = parked {
                    self.schedule(state, step);
                }
            }
            _ => trace!(fiber = %self.id, epoch, "ignoring stale resumption"),
        }
    }

    /// Ask the fiber to stop. Takes effect at the next interruptible point.
    pub(crate) fn request_interrupt(self: &Arc<Self>, by: FiberId) {
        let mut st = self.state.lock();
        if matches!(st.status, Status::Done) {
            return;
        }
        if st.interruptor.is_none() {
            st.interruptor = Some(by);
            self.interrupted.store(true, Ordering::Release);
            debug!(fiber = %self.id, by = %by, "interruption requested");
        }
        if let Status::Suspended {
            interruptible: true,
            ..
        } = st.status
        {
            let interruptor = st.interruptor.unwrap_or(by);
            st.status = Status::Running;
            let parked = st.parked.take();
            let canceler = st.canceler.take();
            drop(st);
            if let Some(cancel) = canceler {
                let _ = panic::catch(cancel);
            }
            if let Some(state) = parked {
                self.schedule(state, Step::Failure(Cause::interrupt(interruptor)));
            }
        }
    }

    fn fork(
        self: &Arc<Self>,
        instr: Instr,
        daemon: bool,
        completion: Completion,
        env: Env,
    ) -> Arc<FiberContext> {
        let parent = if daemon { None } else { Some(self.id) };
        let child = FiberContext::new(Arc::clone(&self.shared), parent, completion);
        if !daemon {
            let mut st = self.state.lock();
            st.children.retain(|c| !c.is_done());
            st.children.push(Arc::clone(&child));
        }
        trace!(parent = %self.id, child = %child.id, daemon, "forked fiber");
        child.start(env, instr);
        child
    }

    /// Run `observer` once the fiber is done; immediately if it already is.
    pub(crate) fn observe(&self, observer: Observer) {
        let mut st = self.state.lock();
        st.observed = true;
        match st.exit.clone() {
            Some(slot) => {
                drop(st);
                observer(&slot);
            }
            None => st.observers.push(observer),
        }
    }

    /// The exit slot, if the fiber is done.
    pub(crate) fn poll(&self) -> Option<ExitSlot> {
        let mut st = self.state.lock();
        st.observed = true;
        st.exit.clone()
    }

    fn complete(self: &Arc<Self>, exit: AnyExit) {
        self.shared.stats.record_completion();
        let unhandled = match &exit {
            Exit::Failure(cause) => Some(cause.describe()),
            _ => None,
        };
        let typed = match panic::catch(|| (self.completion)(exit)) {
            Ok(typed) => typed,
            Err(defect) => {
                warn!(fiber = %self.id, %defect, "failed to deliver fiber exit");
                Box::new(()) as TypedExit
            }
        };
        let slot: ExitSlot = Arc::new(Mutex::new(typed));

        let (observers, children, observed) = {
            let mut st = self.state.lock();
            st.status = Status::Done;
            st.exit = Some(Arc::clone(&slot));
            st.parked = None;
            st.canceler = None;
            st.early = None;
            (
                mem::take(&mut st.observers),
                mem::take(&mut st.children),
                st.observed,
            )
        };

        trace!(fiber = %self.id, "fiber completed");

        if let Some(cause) = unhandled {
            if !observed {
                self.shared.stats.record_unhandled();
                if self.shared.config.fiber.report_unhandled_failures {
                    warn!(fiber = %self.id, %cause, "fiber failed and nobody observed it");
                }
            }
        }

        for child in children {
            if !child.is_done() {
                child.request_interrupt(self.id);
            }
        }

        for observer in observers {
            observer(&slot);
        }
    }
}

fn apply(state: &mut RunState, frame: Frame, value: AnyValue) -> Step {
    match frame {
        Frame::Apply(k) => guarded(move || k(value)),
        Frame::ApplyOnce(k) => guarded(move || k(value)),
        Frame::Fold(_, k) => guarded(move || k(value)),
        Frame::MapCause(_) => Step::Value(value),
        Frame::RestoreInterruptible => {
            state.regions.pop();
            Step::Value(value)
        }
        Frame::PopEnv => {
            state.envs.pop();
            Step::Value(value)
        }
    }
}
