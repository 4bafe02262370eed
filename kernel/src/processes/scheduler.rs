//! Priority round-robin scheduler
//!
//! - One FIFO ready queue per priority level; the highest non-empty queue
//!   always runs first, processes of equal priority take turns
//! - Preemption happens only from the timer interrupt, which calls
//!   [`Scheduler::switch`] with the stack pointer of the interrupted register
//!   frame and resumes from the one it returns
//! - Every process keeps its saved frame on its own kernel stack; a new
//!   process gets a frame built by [`spawn`](Scheduler::spawn)
//! - The running process is not in any queue; it rejoins the tail of its own
//!   queue when preempted
//! - The idle process sits at [`Priority::MIN`] and guarantees there is always
//!   something to run
//! - Terminated processes are reaped on the next switch, once they are no
//!   longer on the CPU

use arrayvec::ArrayVec;
use crossbeam_queue::ArrayQueue;

use crate::{
    arch::Cpu,
    constants::processes::{IDLE_STACK_SIZE, MAX_PROCESSES, MIN_STACK_SIZE, PRIORITY_LEVELS},
    memory::{heap::HeapError, AddressSpace, MemoryManager},
    processes::{
        process::{
            build_initial_frame, KernelStack, Pid, Priority, Process, ProcessFlags, ProcessState,
        },
        registers::Registers,
        timer::{TimerCallback, TimerError, TimerId, TimerQueue},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    OutOfMemory(HeapError),
    TooManyProcesses,
    QueueFull,
    StackTooSmall,
}

impl core::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SpawnError::OutOfMemory(e) => write!(f, "No memory for process stack: {}", e),
            SpawnError::TooManyProcesses => write!(f, "Process table is full"),
            SpawnError::QueueFull => write!(f, "Ready queue is full"),
            SpawnError::StackTooSmall => write!(f, "Stack cannot hold the initial frame"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    NoSuchProcess,
    IsCurrent,
    IsIdle,
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedError::NoSuchProcess => write!(f, "No such process"),
            SchedError::IsCurrent => write!(f, "Operation not allowed on the running process"),
            SchedError::IsIdle => write!(f, "Operation not allowed on the idle process"),
        }
    }
}

pub struct Scheduler {
    processes: ArrayVec<Process, MAX_PROCESSES>,
    ready: [ArrayQueue<Pid>; PRIORITY_LEVELS],
    current: Option<Pid>,
    idle: Option<Pid>,
    next_pid: u32,
    ticks: u64,
    timers: TimerQueue,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// An empty scheduler. Nothing runs until [`init`](Self::init).
    pub fn new() -> Self {
        Scheduler {
            processes: ArrayVec::new(),
            ready: core::array::from_fn(|_| ArrayQueue::new(MAX_PROCESSES)),
            current: None,
            idle: None,
            next_pid: 0,
            ticks: 0,
            timers: TimerQueue::new(),
        }
    }

    /// Adopts the boot thread as the main process and spawns the idle process.
    ///
    /// The main process keeps running on `bootstrap_stack` at
    /// [`Priority::NORMAL`].
    ///
    /// # Panics
    /// If called twice or if the idle process cannot be created.
    pub fn init(&mut self, memory: &mut MemoryManager, bootstrap_stack: KernelStack, idle_entry: usize) {
        assert!(self.current.is_none(), "scheduler already initialized");

        let pid = self.allocate_pid();
        let mut main = Process::new(
            pid,
            0,
            Priority::NORMAL,
            bootstrap_stack,
            ProcessFlags::SUPERVISOR,
            None,
            0,
        );
        main.state = ProcessState::Running;
        self.processes.push(main);
        self.current = Some(pid);

        let idle = self
            .spawn(
                memory,
                idle_entry,
                None,
                Priority::MIN,
                0,
                IDLE_STACK_SIZE,
                ProcessFlags::SUPERVISOR,
            )
            .unwrap_or_else(|e| panic!("failed to spawn idle process: {}", e));
        self.idle = Some(idle);

        log::info!("scheduler started: main {}, idle {}", pid, idle);
    }

    /// Creates a ready process at `entry` with its own kernel stack.
    ///
    /// `address_space` becomes the process's page directory; without one it
    /// shares the kernel directory. If the process cannot be created the
    /// address space is destroyed.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        &mut self,
        memory: &mut MemoryManager,
        entry: usize,
        address_space: Option<AddressSpace>,
        priority: Priority,
        arg: usize,
        stack_size: usize,
        flags: ProcessFlags,
    ) -> Result<Pid, SpawnError> {
        let failed = |memory: &mut MemoryManager,
                      space: Option<AddressSpace>,
                      err: SpawnError|
         -> Result<Pid, SpawnError> {
            if let Some(space) = space {
                memory.destroy_address_space(space);
            }
            log::warn!("spawn of {:#x} failed: {}", entry, err);
            Err(err)
        };

        if self.processes.is_full() {
            return failed(memory, address_space, SpawnError::TooManyProcesses);
        }
        if stack_size < MIN_STACK_SIZE {
            return failed(memory, address_space, SpawnError::StackTooSmall);
        }

        let base = match memory.try_kmalloc(stack_size, false) {
            Ok(base) => base,
            Err(e) => return failed(memory, address_space, SpawnError::OutOfMemory(e)),
        };

        let pid = self.allocate_pid();
        if self.ready[priority.level()].push(pid).is_err() {
            memory.kfree(base);
            return failed(memory, address_space, SpawnError::QueueFull);
        }

        let stack = KernelStack::owned(base, stack_size);
        // The stack was just allocated for this process
        let frame = unsafe { build_initial_frame(&stack, entry, arg, flags) };
        self.processes.push(Process::new(
            pid,
            entry,
            priority,
            stack,
            flags,
            address_space,
            frame,
        ));

        log::debug!(
            "spawned {} at {:#x}, priority {}, stack {:#x}+{:#x}",
            pid,
            entry,
            priority.level(),
            base,
            stack_size
        );
        Ok(pid)
    }

    /// Preempts the current process, whose register frame is at `frame`, and
    /// returns the stack pointer of the next process's saved frame.
    ///
    /// Before [`init`](Self::init) there is nothing to switch to and `frame`
    /// comes back unchanged. A ring 3 process also gets the top of its
    /// kernel stack installed for its next interrupt.
    pub fn switch<C: Cpu + ?Sized>(
        &mut self,
        frame: usize,
        memory: &mut MemoryManager,
        cpu: &C,
    ) -> usize {
        let Some(previous) = self.current else {
            return frame;
        };
        self.reap(memory);

        let kernel_directory = memory.kernel_directory_phys();
        let mut previous_directory = kernel_directory;

        let mut requeue = None;
        if let Some(process) = self.find_mut(previous) {
            debug_assert!(
                process.stack().contains(frame, Registers::KERNEL_FRAME_SIZE),
                "frame {:#x} is outside the stack of process {}",
                frame,
                previous
            );
            previous_directory = process.directory_phys(kernel_directory);
            process.frame = frame;
            if process.state == ProcessState::Running {
                process.state = ProcessState::Ready;
                requeue = Some(process.priority.level());
            }
        }
        if let Some(level) = requeue {
            // A slot was freed when this process left its queue
            let _ = self.ready[level].push(previous);
        }

        let next = self.pop_next().expect("no runnable process");
        self.current = Some(next);

        let process = self.find_mut(next).expect("queued process missing");
        process.state = ProcessState::Running;
        let resume = process.frame;
        let directory = process.directory_phys(kernel_directory);
        if process.flags().contains(ProcessFlags::USER) {
            cpu.set_kernel_stack(process.stack().top());
        }

        if directory != previous_directory {
            memory.load_directory(directory, cpu);
        }

        if next != previous {
            log::trace!("switch {} -> {} at {:#x}", previous, next, resume);
        }
        resume
    }

    /// Accounts one timer tick of `elapsed_ms` and runs due timers.
    pub fn on_tick(&mut self, elapsed_ms: u64) {
        self.ticks += 1;
        if let Some(pid) = self.current {
            if let Some(process) = self.find_mut(pid) {
                process.ticks += 1;
            }
        }
        self.timers.advance(elapsed_ms);
    }

    /// Marks the running process terminated. It stops being scheduled at the
    /// next switch and is reaped after that.
    pub fn exit_current(&mut self) -> Result<Pid, SchedError> {
        let pid = self.current.ok_or(SchedError::NoSuchProcess)?;
        if Some(pid) == self.idle {
            return Err(SchedError::IsIdle);
        }
        if let Some(process) = self.find_mut(pid) {
            process.state = ProcessState::Terminated;
        }
        log::debug!("process {} exited", pid);
        Ok(pid)
    }

    /// Removes a process that is not running and releases its stack and
    /// address space.
    pub fn kill(&mut self, pid: Pid, memory: &mut MemoryManager) -> Result<(), SchedError> {
        if Some(pid) == self.idle {
            return Err(SchedError::IsIdle);
        }
        if Some(pid) == self.current {
            return Err(SchedError::IsCurrent);
        }
        let process = self.find_mut(pid).ok_or(SchedError::NoSuchProcess)?;
        let level = process.priority.level();
        let was_ready = process.state == ProcessState::Ready;
        process.state = ProcessState::Terminated;

        if was_ready {
            self.remove_from_queue(level, pid);
        }
        self.reap(memory);
        log::debug!("process {} killed", pid);
        Ok(())
    }

    /// Changes a process's priority. A ready process moves to the tail of its
    /// new queue; the running one moves when it is next preempted.
    pub fn set_priority(&mut self, pid: Pid, priority: Priority) -> Result<(), SchedError> {
        if Some(pid) == self.idle {
            return Err(SchedError::IsIdle);
        }
        let process = self.find_mut(pid).ok_or(SchedError::NoSuchProcess)?;
        let old = process.priority;
        let state = process.state;
        process.priority = priority;

        if state == ProcessState::Ready && old != priority {
            self.remove_from_queue(old.level(), pid);
            // Every live process fits in any one queue
            let _ = self.ready[priority.level()].push(pid);
        }
        Ok(())
    }

    pub fn add_timer(
        &mut self,
        delay_ms: u64,
        callback: TimerCallback,
        arg: usize,
        repeat: bool,
    ) -> Result<TimerId, TimerError> {
        self.timers.add(delay_ms, callback, arg, repeat)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn idle(&self) -> Option<Pid> {
        self.idle
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.iter().find(|process| process.pid() == pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Timer ticks seen since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of processes waiting at `priority`.
    pub fn ready_count(&self, priority: Priority) -> usize {
        self.ready[priority.level()].len()
    }

    fn find_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.iter_mut().find(|process| process.pid() == pid)
    }

    fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = Pid(self.next_pid);
            self.next_pid = self.next_pid.wrapping_add(1);
            if self.process(pid).is_none() {
                return pid;
            }
        }
    }

    fn pop_next(&mut self) -> Option<Pid> {
        self.ready.iter().rev().find_map(|queue| queue.pop())
    }

    fn remove_from_queue(&mut self, level: usize, pid: Pid) {
        let queue = &self.ready[level];
        for _ in 0..queue.len() {
            match queue.pop() {
                Some(queued) if queued == pid => {}
                Some(queued) => {
                    let _ = queue.push(queued);
                }
                None => break,
            }
        }
    }

    /// Frees every terminated process except the one on the CPU.
    fn reap(&mut self, memory: &mut MemoryManager) {
        while let Some(index) = self
            .processes
            .iter()
            .position(|p| p.state() == ProcessState::Terminated && Some(p.pid()) != self.current)
        {
            let mut process = self.processes.remove(index);
            let stack = process.stack();
            if stack.owned {
                memory.kfree(stack.base);
            }
            if let Some(space) = process.take_address_space() {
                memory.destroy_address_space(space);
            }
            log::debug!("reaped process {}", process.pid());
        }
    }
}
