use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config;
use crate::errno::Errno;
use crate::frame::Registers;
use crate::hal::AddressSpace;
use crate::signal::SignalState;

pub type Pid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, or executing right now if it is the current process.
    Running,
    /// Waiting in `waitpid` for a child to exit.
    Blocked,
    /// Exited, status not yet collected.
    Zombie,
}

/// Which children a `waitpid` call accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
}

impl WaitTarget {
    pub fn from_raw(pid: i64) -> Result<Self, Errno> {
        match pid {
            -1 => Ok(WaitTarget::Any),
            p if p > 0 => Ok(WaitTarget::Pid(p as Pid)),
            // Process groups are not supported
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn matches(self, pid: Pid) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Pid(p) => p == pid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    /// 0 for the init process.
    pub parent: Pid,
    pub state: ProcessState,
    /// Where to resume this process. Stale while it is executing.
    pub regs_state: Registers,
    pub syscalling: bool,
    pub address_space: AddressSpace,
    pub signals: SignalState,
    pub exit_status: Option<i32>,
    pub waiting_for: Option<WaitTarget>,
}

impl Process {
    fn new(pid: Pid, parent: Pid, regs_state: Registers, address_space: AddressSpace) -> Self {
        Process {
            pid,
            parent,
            state: ProcessState::Running,
            regs_state,
            syscalling: false,
            address_space,
            signals: SignalState::new(),
            exit_status: None,
            waiting_for: None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ProcessState::Running
    }
}

/// Result of looking for a child to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// A matching child has exited and can be reaped.
    Exited(Pid),
    /// Matching children exist but none has exited yet.
    StillRunning,
    /// Nothing will ever match.
    NoChild,
}

pub struct ProcessTable {
    processes: BTreeMap<Pid, Process>,
    current: Option<Pid>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        ProcessTable {
            processes: BTreeMap::new(),
            current: None,
        }
    }

    /// The process executing on the CPU, `None` while idling.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn set_current(&mut self, pid: Option<Pid>) {
        self.current = pid;
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.processes.keys().copied()
    }

    // Lowest free pid, so reaped pids get reused.
    fn alloc_pid(&self) -> Result<Pid, Errno> {
        (config::INIT_PID..=config::MAX_PROCESSES)
            .find(|pid| !self.processes.contains_key(pid))
            .ok_or(Errno::EAGAIN)
    }

    pub fn has_free_slot(&self) -> bool {
        self.alloc_pid().is_ok()
    }

    /// Creates the first process.
    pub fn spawn(&mut self, regs_state: Registers, address_space: AddressSpace) -> Result<Pid, Errno> {
        let pid = self.alloc_pid()?;
        self.processes.insert(pid, Process::new(pid, 0, regs_state, address_space));
        log::info!("process {} created", pid);
        Ok(pid)
    }

    /// Adds a child of `parent` that resumes at `frame` with `rax = 0`.
    pub fn fork(&mut self, parent: Pid, frame: &Registers, address_space: AddressSpace) -> Result<Pid, Errno> {
        let signals = self
            .processes
            .get(&parent)
            .ok_or(Errno::ESRCH)?
            .signals
            .inherited();
        let pid = self.alloc_pid()?;

        let mut regs_state = *frame;
        regs_state.set_return_value(0);

        let mut child = Process::new(pid, parent, regs_state, address_space);
        child.signals = signals;
        self.processes.insert(pid, child);
        log::debug!("process {} forked from {}", pid, parent);
        Ok(pid)
    }

    /// Turns `pid` into a zombie, hands its children to init and wakes a
    /// parent waiting for it.
    pub fn exit(&mut self, pid: Pid, status: i32) {
        let parent = match self.processes.get_mut(&pid) {
            Some(process) => {
                process.state = ProcessState::Zombie;
                process.exit_status = Some(status);
                process.syscalling = false;
                process.waiting_for = None;
                process.signals.clear_pending();
                process.parent
            }
            None => return,
        };
        log::debug!("process {} exited with status {}", pid, status);

        let orphans: Vec<Pid> = self
            .processes
            .values()
            .filter(|p| p.parent == pid)
            .map(|p| p.pid)
            .collect();
        let init = config::INIT_PID;
        let mut zombie_orphan = false;
        for orphan in orphans {
            if let Some(child) = self.processes.get_mut(&orphan) {
                child.parent = if pid == init { 0 } else { init };
                zombie_orphan |= child.state == ProcessState::Zombie;
            }
        }

        self.wake_waiter(parent, pid);
        if zombie_orphan && pid != init {
            self.wake_any_waiter(init);
        }
    }

    fn wake_waiter(&mut self, parent: Pid, child: Pid) {
        if let Some(process) = self.processes.get_mut(&parent) {
            if process.state == ProcessState::Blocked
                && process.waiting_for.map_or(false, |t| t.matches(child))
            {
                process.state = ProcessState::Running;
                process.waiting_for = None;
                log::debug!("process {} woken by exit of {}", parent, child);
            }
        }
    }

    fn wake_any_waiter(&mut self, parent: Pid) {
        if let Some(process) = self.processes.get_mut(&parent) {
            if process.state == ProcessState::Blocked && process.waiting_for == Some(WaitTarget::Any) {
                process.state = ProcessState::Running;
                process.waiting_for = None;
            }
        }
    }

    /// Looks for a child of `parent` accepted by `target`.
    pub fn find_child(&self, parent: Pid, target: WaitTarget) -> ChildStatus {
        let mut alive = false;
        for child in self.processes.values().filter(|p| p.parent == parent && target.matches(p.pid)) {
            if child.state == ProcessState::Zombie {
                return ChildStatus::Exited(child.pid);
            }
            alive = true;
        }
        if alive {
            ChildStatus::StillRunning
        } else {
            ChildStatus::NoChild
        }
    }

    /// Removes zombies nobody can wait for any more: those whose parent
    /// chain ended when init exited. Init's own record stays.
    pub fn take_orphaned_zombies(&mut self) -> Vec<Process> {
        let orphans: Vec<Pid> = self
            .processes
            .values()
            .filter(|p| p.parent == 0 && p.pid != config::INIT_PID && p.state == ProcessState::Zombie)
            .map(|p| p.pid)
            .collect();
        orphans
            .into_iter()
            .filter_map(|pid| self.processes.remove(&pid))
            .collect()
    }

    /// Removes a zombie and returns its descriptor.
    pub fn reap(&mut self, pid: Pid) -> Option<Process> {
        match self.processes.get(&pid) {
            Some(p) if p.state == ProcessState::Zombie => self.processes.remove(&pid),
            _ => None,
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
