//! Per-process signal dispositions and deferred delivery.
//!
//! `kill` only marks a signal pending. The kernel calls [`deliver`] on every
//! return to user mode; that is the single place where a pending signal
//! turns into a handler invocation or a termination.

use crate::config::{self, NSIG};
use crate::errno::Errno;
use crate::frame::Registers;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Terminate the process.
    Default,
    Ignore,
    /// User address of the handler, called with the signal number in `rdi`.
    Handler(u64),
}

impl SignalAction {
    pub const RAW_DEFAULT: u64 = 0;
    pub const RAW_IGNORE: u64 = 1;

    pub fn from_raw(raw: u64) -> Self {
        match raw {
            Self::RAW_DEFAULT => SignalAction::Default,
            Self::RAW_IGNORE => SignalAction::Ignore,
            addr => SignalAction::Handler(addr),
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            SignalAction::Default => Self::RAW_DEFAULT,
            SignalAction::Ignore => Self::RAW_IGNORE,
            SignalAction::Handler(addr) => addr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalState {
    actions: [SignalAction; NSIG],
    pending: u32,
    /// Frame interrupted by the running handler, restored by `sigreturn`.
    saved_frame: Option<Registers>,
}

pub fn check_signal(sig: u64) -> Result<usize, Errno> {
    if (sig as usize) < NSIG {
        Ok(sig as usize)
    } else {
        Err(Errno::EINVAL)
    }
}

impl SignalState {
    pub const fn new() -> Self {
        SignalState {
            actions: [SignalAction::Default; NSIG],
            pending: 0,
            saved_frame: None,
        }
    }

    /// What a forked child starts with: same dispositions, nothing pending.
    /// A child forked inside a handler is inside that handler too.
    pub fn inherited(&self) -> Self {
        SignalState {
            actions: self.actions,
            pending: 0,
            saved_frame: self.saved_frame,
        }
    }

    pub fn action(&self, sig: usize) -> SignalAction {
        self.actions[sig]
    }

    /// Installs `action` and returns the previous one.
    pub fn set_action(&mut self, sig: usize, action: SignalAction) -> SignalAction {
        core::mem::replace(&mut self.actions[sig], action)
    }

    pub fn raise(&mut self, sig: usize) {
        self.pending |= 1 << sig;
    }

    pub fn is_pending(&self, sig: usize) -> bool {
        self.pending & (1 << sig) != 0
    }

    pub fn has_pending(&self) -> bool {
        self.pending != 0
    }

    pub fn clear_pending(&mut self) {
        self.pending = 0;
    }

    pub fn in_handler(&self) -> bool {
        self.saved_frame.is_some()
    }

    /// Takes the lowest pending signal that can be acted on now.
    ///
    /// While a handler runs, signals that would need another handler stay
    /// pending until `sigreturn`.
    fn take_next(&mut self) -> Option<(usize, SignalAction)> {
        let mut bits = self.pending;
        while bits != 0 {
            let sig = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            let action = self.actions[sig];
            if matches!(action, SignalAction::Handler(_)) && self.in_handler() {
                continue;
            }
            self.pending &= !(1 << sig);
            return Some((sig, action));
        }
        None
    }

    fn save_frame(&mut self, frame: &Registers) {
        self.saved_frame = Some(*frame);
    }

    pub fn take_saved_frame(&mut self) -> Option<Registers> {
        self.saved_frame.take()
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to the process about to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing to do, or only ignored signals.
    None,
    /// `frame` now enters a handler.
    Handler(usize),
    /// The process was terminated; another one must be picked.
    Terminated(usize),
}

/// Acts on the pending signals of `pid`, whose frame is in flight.
///
/// Must run with interrupts masked and with `pid`'s address space active,
/// since the trampoline address is pushed on its user stack.
pub(crate) fn deliver<H: Hal>(kernel: &Kernel<H>, pid: Pid, frame: &mut Registers) -> Delivery {
    loop {
        let next = {
            let mut table = kernel.processes();
            match table.get_mut(pid) {
                Some(process) => process.signals.take_next(),
                None => return Delivery::None,
            }
        };
        let (sig, action) = match next {
            Some(next) => next,
            None => return Delivery::None,
        };

        match action {
            SignalAction::Ignore => {
                log::trace!("process {} ignores signal {}", pid, sig);
            }
            SignalAction::Default => {
                log::info!("process {} terminated by signal {}", pid, sig);
                kernel.terminate(pid, config::SIGNAL_EXIT_BASE + sig as i32);
                return Delivery::Terminated(sig);
            }
            SignalAction::Handler(handler) => {
                // Skip the red zone, then align so the handler sees a normal call frame.
                let return_slot = (frame.rsp.wrapping_sub(128) & !0xf).wrapping_sub(8);
                let trampoline = kernel.hal().signal_trampoline();
                if kernel
                    .hal()
                    .copy_to_user(return_slot, &trampoline.to_le_bytes())
                    .is_err()
                {
                    log::warn!("process {} has no room for signal {} frame", pid, sig);
                    kernel.terminate(pid, config::SIGNAL_EXIT_BASE + sig as i32);
                    return Delivery::Terminated(sig);
                }

                if let Some(process) = kernel.processes().get_mut(pid) {
                    process.signals.save_frame(frame);
                }
                frame.rsp = return_slot;
                frame.rip = handler;
                frame.rdi = sig as u64;
                log::debug!("process {} enters handler {:#x} for signal {}", pid, handler, sig);
                return Delivery::Handler(sig);
            }
        }
    }
}
