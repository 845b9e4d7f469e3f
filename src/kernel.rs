//! The kernel context: every piece of global trap state in one object.
//!
//! On hardware a single `Kernel<X86Hal>` is built at boot and published
//! through `arch::KERNEL`; the assembly entry hands each frame to
//! [`Kernel::handle_trap`]. Tests build as many independent kernels as
//! they like on top of `MockHal`.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::{IRQ_LINES, TIMESLICE_TICKS};
use crate::errno::{self, Errno};
use crate::frame::Registers;
use crate::hal::{AddressSpace, Hal};
use crate::interrupts::{self, TrapKind};
use crate::process::{Pid, ProcessTable};
use crate::scheduler;
use crate::signal::{self, Delivery};
use crate::spinlock::{IrqSpinlockGuard, Spinlock};
use crate::syscall::{self, SyscallTable};

/// Runs in interrupt context with the line number that fired.
pub type IrqHandler<H> = fn(&Kernel<H>, u8);

pub struct Kernel<H: Hal> {
    hal: H,
    processes: Spinlock<ProcessTable>,
    syscalls: SyscallTable<H>,
    irq_handlers: [Option<IrqHandler<H>>; IRQ_LINES as usize],
    /// Traps currently being handled. 1 inside a top-level trap.
    depth: AtomicUsize,
    ticks: AtomicU64,
    slice_start: AtomicU64,
    need_resched: AtomicBool,
}

impl<H: Hal> Kernel<H> {
    pub fn new(hal: H) -> Self {
        Self::with_syscalls(hal, SyscallTable::standard())
    }

    pub fn with_syscalls(hal: H, syscalls: SyscallTable<H>) -> Self {
        let mut irq_handlers = [None; IRQ_LINES as usize];
        irq_handlers[interrupts::TIMER_IRQ as usize] = Some(interrupts::timer_tick as IrqHandler<H>);
        Kernel {
            hal,
            processes: Spinlock::new(ProcessTable::new()),
            syscalls,
            irq_handlers,
            depth: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            slice_start: AtomicU64::new(0),
            need_resched: AtomicBool::new(false),
        }
    }

    /// Installs the handler for IRQ line `irq`. Only before the kernel is published.
    pub fn register_irq(&mut self, irq: u8, handler: IrqHandler<H>) {
        match self.irq_handlers.get_mut(irq as usize) {
            Some(slot) => *slot = Some(handler),
            None => log::warn!("cannot register handler for irq {}", irq),
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Locks the process table with interrupts masked.
    pub fn processes(&self) -> IrqSpinlockGuard<'_, ProcessTable, H> {
        self.processes.lock_irq(&self.hal)
    }

    pub fn syscalls(&self) -> &SyscallTable<H> {
        &self.syscalls
    }

    pub(crate) fn irq_handler(&self, irq: u8) -> Option<IrqHandler<H>> {
        self.irq_handlers.get(irq as usize).copied().flatten()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if now - self.slice_start.load(Ordering::Relaxed) >= TIMESLICE_TICKS {
            self.need_resched.store(true, Ordering::Relaxed);
        }
    }

    /// Asks for a process switch at the next return to user mode.
    pub fn request_reschedule(&self) {
        self.need_resched.store(true, Ordering::Relaxed);
    }

    /// Creates the init process, which starts at `frame` inside `space`.
    pub fn spawn_init(&self, frame: Registers, space: AddressSpace) -> Result<Pid, Errno> {
        self.processes().spawn(frame, space)
    }

    /// Picks the first context to run and activates its address space.
    pub fn start(&self) -> Registers {
        let mut frame = self.hal.idle_frame();
        self.schedule(&mut frame);
        frame
    }

    /// Makes `pid` a zombie with `status`. Whoever runs it next leaves it
    /// on the next return to user mode.
    pub(crate) fn terminate(&self, pid: Pid, status: i32) {
        self.processes().exit(pid, status);
        if pid == crate::config::INIT_PID {
            log::warn!("init exited with status {}", status);
        }
    }

    /// Handles the trap described by `frame`. Whatever `frame` holds on
    /// return is what the exit path resumes.
    pub fn handle_trap(&self, frame: &mut Registers) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let vector = frame.vector as u8;

        match interrupts::classify(vector) {
            TrapKind::Syscall => {
                let caller = self.processes().current();
                let result = syscall::dispatch(self, frame);
                if self.still_running(caller) {
                    frame.set_return_value(errno::encode(result));
                }
            }
            TrapKind::Exception(vector) => interrupts::handle_exception(self, frame, vector, depth),
            TrapKind::Irq(irq) => interrupts::handle_irq(self, irq),
            TrapKind::Unexpected(vector) => log::warn!("unexpected vector {} at {:#x}", vector, frame.rip),
        }

        let resumes_user = frame.is_user_mode() || self.processes().current().is_none();
        if depth == 1 && resumes_user {
            self.return_to_user(frame);
        }

        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    // The syscall result is dropped if the caller was switched out or is no
    // longer runnable (exit, blocking waitpid).
    fn still_running(&self, caller: Option<Pid>) -> bool {
        let table = self.processes();
        match caller {
            Some(pid) => table.current() == Some(pid) && table.get(pid).map_or(false, |p| p.is_runnable()),
            None => false,
        }
    }

    /// Last step before resuming a user context or the idle loop: switch
    /// if needed, then act on pending signals of whoever runs next.
    fn return_to_user(&self, frame: &mut Registers) {
        loop {
            let must_switch = {
                let table = self.processes();
                match table.current() {
                    Some(pid) => {
                        self.need_resched.load(Ordering::Relaxed)
                            || !table.get(pid).map_or(false, |p| p.is_runnable())
                    }
                    None => true,
                }
            };
            if must_switch {
                self.schedule(frame);
            }

            let pid = match self.processes().current() {
                Some(pid) => pid,
                None => return,
            };
            match signal::deliver(self, pid, frame) {
                Delivery::Terminated(_) => continue,
                Delivery::None | Delivery::Handler(_) => return,
            }
        }
    }

    /// Saves the running process into its descriptor and loads the next one
    /// (or the idle context) into `frame`.
    fn schedule(&self, frame: &mut Registers) {
        self.need_resched.store(false, Ordering::Relaxed);
        self.slice_start.store(self.ticks(), Ordering::Relaxed);

        let mut table = self.processes();
        let prev = table.current();
        if let Some(pid) = prev {
            if let Some(process) = table.get_mut(pid) {
                // Blocked and zombie processes already hold their resume state.
                if process.is_runnable() {
                    process.regs_state = *frame;
                }
            }
        }

        let next = scheduler::pick_next(&table, prev)
            .and_then(|pid| table.get(pid).map(|p| (pid, p.regs_state, p.address_space)));
        match next {
            Some((pid, regs_state, space)) => {
                table.set_current(Some(pid));
                let orphans = table.take_orphaned_zombies();
                drop(table);
                *frame = regs_state;
                if prev != Some(pid) {
                    self.hal.activate(space);
                    log::trace!("switch {:?} -> {}", prev, pid);
                }
                // Only after the switch: one of them may own the old space.
                for orphan in orphans {
                    log::debug!("collected orphaned zombie {}", orphan.pid);
                    self.hal.release(orphan.address_space);
                }
            }
            None => {
                table.set_current(None);
                drop(table);
                *frame = self.hal.idle_frame();
                if prev.is_some() {
                    log::trace!("switch {:?} -> idle", prev);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PIC_1_OFFSET, SYSCALL_VECTOR};
    use crate::interrupts::{BREAKPOINT, DOUBLE_FAULT, GENERAL_PROTECTION, KEYBOARD_IRQ, PAGE_FAULT};
    use crate::hal::Console;
    use crate::process::ProcessState;
    use crate::signal::SignalAction;
    use crate::syscall::{SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_KILL, SYS_SIGNAL, SYS_SIGRETURN, SYS_WAITPID, SYS_WRITE};
    use crate::testing::{self, MockHal, USER_DATA, USER_ENTRY};

    fn irq_frame(irq: u8, from: Registers) -> Registers {
        Registers {
            vector: (PIC_1_OFFSET + irq) as u64,
            ..from
        }
    }

    fn fault_frame(vector: u8, from: Registers) -> Registers {
        Registers {
            vector: vector as u64,
            error_code: 0x2,
            ..from
        }
    }

    #[test]
    fn irqs_are_acknowledged() {
        let kernel = testing::booted_kernel();
        let mut frame = irq_frame(KEYBOARD_IRQ, testing::user_frame(USER_ENTRY));
        kernel.handle_trap(&mut frame);
        assert_eq!(kernel.hal().acked_irqs(), alloc::vec![KEYBOARD_IRQ]);
    }

    #[test]
    fn registered_irq_handler_runs() {
        fn on_keyboard(kernel: &Kernel<MockHal>, irq: u8) {
            kernel.hal().write_bytes(1, &[b'0' + irq]);
        }
        let mut kernel = Kernel::new(MockHal::new());
        kernel.register_irq(KEYBOARD_IRQ, on_keyboard);
        testing::boot(&kernel);

        let mut frame = irq_frame(KEYBOARD_IRQ, testing::user_frame(USER_ENTRY));
        kernel.handle_trap(&mut frame);
        assert_eq!(kernel.hal().console_output(), "1");
    }

    #[test]
    fn timer_preempts_after_a_timeslice() {
        let kernel = testing::booted_kernel();
        let mut frame = Registers {
            rax: SYS_FORK,
            vector: SYSCALL_VECTOR as u64,
            ..testing::user_frame(USER_ENTRY)
        };
        kernel.handle_trap(&mut frame);
        assert_eq!(kernel.processes().current(), Some(1));

        for _ in 0..TIMESLICE_TICKS - 1 {
            let mut tick = irq_frame(0, frame);
            kernel.handle_trap(&mut tick);
            assert_eq!(kernel.processes().current(), Some(1));
        }
        let mut tick = irq_frame(0, frame);
        kernel.handle_trap(&mut tick);
        assert_eq!(kernel.processes().current(), Some(2));
        assert_eq!(tick.rax, 0);
        assert_eq!(kernel.ticks(), TIMESLICE_TICKS);
        assert_eq!(kernel.hal().active_space(), testing::INIT_SPACE + 1);
    }

    #[test]
    fn nested_kernel_mode_irq_does_not_switch() {
        let kernel = testing::booted_kernel();
        kernel.request_reschedule();
        let kernel_frame = Registers {
            vector: PIC_1_OFFSET as u64,
            ..Registers::new_context(0xffff_8000_0000_4000, 0xffff_8000_0010_0000, 0x08, 0x10)
        };
        let mut frame = kernel_frame;
        kernel.handle_trap(&mut frame);
        assert_eq!(frame, kernel_frame);
        assert_eq!(kernel.processes().current(), Some(1));
    }

    #[test]
    fn user_fault_kills_only_the_process() {
        let kernel = testing::booted_kernel();
        let mut frame = fault_frame(GENERAL_PROTECTION, testing::user_frame(USER_ENTRY));
        kernel.handle_trap(&mut frame);

        let init = kernel.processes().get(1).cloned().unwrap();
        assert_eq!(init.state, ProcessState::Zombie);
        assert_eq!(init.exit_status, Some(128 + GENERAL_PROTECTION as i32));
        assert_eq!(frame, kernel.hal().idle_frame());
    }

    #[test]
    fn resolved_page_fault_retries() {
        let kernel = testing::booted_kernel();
        kernel.hal().set_fault_address(0x6000_0000, true);
        let before = fault_frame(PAGE_FAULT, testing::user_frame(USER_ENTRY));
        let mut frame = before;
        kernel.handle_trap(&mut frame);
        assert_eq!(frame, before);
        assert_eq!(kernel.processes().get(1).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn breakpoint_is_survivable() {
        let kernel = testing::booted_kernel();
        let mut frame = fault_frame(BREAKPOINT, testing::user_frame(USER_ENTRY));
        kernel.handle_trap(&mut frame);
        assert_eq!(kernel.processes().get(1).unwrap().state, ProcessState::Running);
    }

    #[test]
    #[should_panic(expected = "double fault")]
    fn double_fault_halts() {
        let kernel = testing::booted_kernel();
        let mut frame = fault_frame(DOUBLE_FAULT, testing::user_frame(USER_ENTRY));
        kernel.handle_trap(&mut frame);
    }

    #[test]
    #[should_panic(expected = "page fault")]
    fn kernel_mode_fault_halts() {
        let kernel = testing::booted_kernel();
        let mut frame = fault_frame(
            PAGE_FAULT,
            Registers::new_context(0xffff_8000_0000_4000, 0xffff_8000_0010_0000, 0x08, 0x10),
        );
        kernel.handle_trap(&mut frame);
    }

    #[test]
    #[should_panic(expected = "unrecoverable general protection")]
    fn fault_inside_trap_handling_halts() {
        fn faulting(kernel: &Kernel<MockHal>, _pid: Pid, frame: &mut Registers) -> errno::SyscallResult {
            // Looks like a user fault, but arrives while the syscall is still being handled.
            let mut nested = fault_frame(GENERAL_PROTECTION, *frame);
            kernel.handle_trap(&mut nested);
            Ok(0)
        }
        let kernel = testing::booted_kernel_with(SyscallTable::new(alloc::vec![Some(
            faulting as syscall::SyscallHandler<MockHal>
        )]));
        let mut frame = Registers {
            rax: 0,
            vector: SYSCALL_VECTOR as u64,
            ..testing::user_frame(USER_ENTRY)
        };
        kernel.handle_trap(&mut frame);
    }

    #[test]
    fn idle_picks_up_woken_work() {
        let kernel = testing::booted_kernel();
        let mut frame = Registers {
            rax: SYS_EXIT,
            vector: SYSCALL_VECTOR as u64,
            ..testing::user_frame(USER_ENTRY)
        };
        kernel.handle_trap(&mut frame);
        assert_eq!(frame, kernel.hal().idle_frame());

        // A timer tick while idling stays idle: nothing is runnable.
        let mut tick = irq_frame(0, frame);
        kernel.handle_trap(&mut tick);
        assert_eq!(tick, kernel.hal().idle_frame());
        assert_eq!(kernel.processes().current(), None);
    }

    // A user program, one syscall at a time:
    //
    //     write(1, "Hello world!\n", 13);
    //     pid = fork();
    //     if (pid == 0) {
    //         signal(0, handler);
    //         kill(getpid(), 0);
    //         exit(43);
    //     }
    //     waitpid(-1, &status, 0);
    #[test]
    fn hello_fork_signal_wait() {
        const HANDLER: u64 = 0x40_3000;
        let kernel = testing::booted_kernel();
        kernel.hal().poke(testing::INIT_SPACE, USER_DATA, b"Hello world!\n");

        let syscall = |frame: &mut Registers, number: u64, args: [u64; 3]| {
            frame.rax = number;
            frame.rdi = args[0];
            frame.rsi = args[1];
            frame.rdx = args[2];
            frame.rip += 2;
            frame.vector = SYSCALL_VECTOR as u64;
            kernel.handle_trap(frame);
        };
        let mut cpu = testing::user_frame(USER_ENTRY);
        assert_eq!(kernel.processes().current(), Some(1));

        syscall(&mut cpu, SYS_WRITE, [1, USER_DATA, 13]);
        assert_eq!(cpu.rax, 13);
        assert_eq!(kernel.hal().console_output(), "Hello world!\n");

        syscall(&mut cpu, SYS_FORK, [0; 3]);
        let child = cpu.rax as Pid;
        assert_eq!(child, 2);
        let after_fork = cpu.rip;

        // Parent blocks; the child takes over at the same call site.
        syscall(&mut cpu, SYS_WAITPID, [-1i64 as u64, USER_DATA + 64, 0]);
        assert_eq!(kernel.processes().current(), Some(child));
        assert_eq!(cpu.rip, after_fork);
        assert_eq!(cpu.rax, 0);

        syscall(&mut cpu, SYS_SIGNAL, [0, HANDLER, 0]);
        assert_eq!(cpu.rax, SignalAction::RAW_DEFAULT);
        syscall(&mut cpu, SYS_GETPID, [0; 3]);
        assert_eq!(cpu.rax, child as u64);

        syscall(&mut cpu, SYS_KILL, [child as u64, 0, 0]);
        let after_kill = cpu;
        assert_eq!(cpu.rip, HANDLER);
        assert_eq!(cpu.rdi, 0);

        // The handler returns into the trampoline, which calls sigreturn.
        cpu.rip = testing::SIGNAL_TRAMPOLINE;
        syscall(&mut cpu, SYS_SIGRETURN, [0; 3]);
        assert_ne!(cpu, after_kill);
        assert_eq!(cpu.rax, 0);
        assert_eq!(cpu.rip, after_fork + 2 * 3);

        syscall(&mut cpu, SYS_EXIT, [43, 0, 0]);

        // Parent re-issues waitpid and collects the child.
        assert_eq!(kernel.processes().current(), Some(1));
        assert_eq!(cpu.rip, after_fork);
        syscall(&mut cpu, SYS_WAITPID, [-1i64 as u64, USER_DATA + 64, 0]);
        assert_eq!(cpu.rax, child as u64);
        assert_eq!(
            kernel.hal().peek(testing::INIT_SPACE, USER_DATA + 64, 4),
            Some(43i32.to_le_bytes().to_vec())
        );
        assert!(kernel.processes().get(child).is_none());
    }

    #[test]
    fn zombies_orphaned_by_init_free_their_slots() {
        let kernel = testing::booted_kernel();
        let mut cpu = testing::user_frame(USER_ENTRY);
        issue(&kernel, &mut cpu, SYS_FORK, [0; 3]);
        let first = cpu.rax as Pid;
        issue(&kernel, &mut cpu, SYS_FORK, [0; 3]);
        let second = cpu.rax as Pid;

        issue(&kernel, &mut cpu, SYS_EXIT, [0; 3]);
        assert_eq!(kernel.processes().current(), Some(first));
        issue(&kernel, &mut cpu, SYS_EXIT, [0; 3]);
        assert_eq!(kernel.processes().current(), Some(second));

        assert!(kernel.processes().get(first).is_none());
        assert_eq!(kernel.hal().released(), alloc::vec![testing::INIT_SPACE + 1]);
        assert_eq!(kernel.processes().get(1).unwrap().state, ProcessState::Zombie);
    }

    fn issue(kernel: &Kernel<MockHal>, frame: &mut Registers, number: u64, args: [u64; 3]) {
        frame.rax = number;
        frame.rdi = args[0];
        frame.rsi = args[1];
        frame.rdx = args[2];
        frame.rip += 2;
        frame.vector = SYSCALL_VECTOR as u64;
        kernel.handle_trap(frame);
    }

    #[test]
    fn kill_of_another_process_is_delivered_when_it_resumes() {
        const HANDLER: u64 = 0x40_5000;
        let kernel = testing::booted_kernel();
        let mut cpu = testing::user_frame(USER_ENTRY);

        issue(&kernel, &mut cpu, SYS_SIGNAL, [5, HANDLER, 0]);
        issue(&kernel, &mut cpu, SYS_FORK, [0; 3]);
        let child = cpu.rax as Pid;
        let after_fork = cpu.rip;

        // The sender carries on; the target only has the signal pending.
        issue(&kernel, &mut cpu, SYS_KILL, [child as u64, 5, 0]);
        assert_eq!(cpu.rax, 0);
        assert_eq!(cpu.rip, after_fork + 2);
        assert_eq!(kernel.processes().current(), Some(1));
        assert!(kernel.processes().get(child).unwrap().signals.is_pending(5));

        issue(&kernel, &mut cpu, SYS_WAITPID, [-1i64 as u64, 0, 0]);
        assert_eq!(kernel.processes().current(), Some(child));
        assert_eq!(cpu.rip, HANDLER);
        assert_eq!(cpu.rdi, 5);
        assert!(!kernel.processes().get(child).unwrap().signals.has_pending());
    }

    #[test]
    fn child_forked_inside_a_handler_can_sigreturn() {
        const HANDLER: u64 = 0x40_5000;
        let kernel = testing::booted_kernel();
        let mut cpu = testing::user_frame(USER_ENTRY);

        issue(&kernel, &mut cpu, SYS_SIGNAL, [5, HANDLER, 0]);
        issue(&kernel, &mut cpu, SYS_KILL, [1, 5, 0]);
        assert_eq!(cpu.rip, HANDLER);
        let interrupted_rip = USER_ENTRY + 2 * 2;

        issue(&kernel, &mut cpu, SYS_FORK, [0; 3]);
        let child = cpu.rax as Pid;
        issue(&kernel, &mut cpu, SYS_WAITPID, [child as u64, 0, 0]);
        assert_eq!(kernel.processes().current(), Some(child));
        assert_eq!(cpu.rax, 0);

        cpu.rip = testing::SIGNAL_TRAMPOLINE;
        issue(&kernel, &mut cpu, SYS_SIGRETURN, [0; 3]);
        assert_ne!(cpu.rax, errno::encode(Err(Errno::EINVAL)));
        assert_eq!(cpu.rax, 0);
        assert_eq!(cpu.rip, interrupted_rip);
        assert!(!kernel.processes().get(child).unwrap().signals.in_handler());
    }
}
