//! Signals, signal sets and wait statuses
//!
//! Numbering and encodings follow Linux so that values can be handed to
//! the platform unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signal(pub i32);

impl Signal {
    pub const SIGHUP: Signal = Signal(1);
    pub const SIGINT: Signal = Signal(2);
    pub const SIGQUIT: Signal = Signal(3);
    pub const SIGILL: Signal = Signal(4);
    pub const SIGTRAP: Signal = Signal(5);
    pub const SIGABRT: Signal = Signal(6);
    pub const SIGBUS: Signal = Signal(7);
    pub const SIGFPE: Signal = Signal(8);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGUSR1: Signal = Signal(10);
    pub const SIGSEGV: Signal = Signal(11);
    pub const SIGUSR2: Signal = Signal(12);
    pub const SIGPIPE: Signal = Signal(13);
    pub const SIGALRM: Signal = Signal(14);
    pub const SIGTERM: Signal = Signal(15);
    pub const SIGSTKFLT: Signal = Signal(16);
    pub const SIGCHLD: Signal = Signal(17);
    pub const SIGCONT: Signal = Signal(18);
    pub const SIGSTOP: Signal = Signal(19);
    pub const SIGTSTP: Signal = Signal(20);
    pub const SIGTTIN: Signal = Signal(21);
    pub const SIGTTOU: Signal = Signal(22);
    pub const SIGURG: Signal = Signal(23);
    pub const SIGXCPU: Signal = Signal(24);
    pub const SIGXFSZ: Signal = Signal(25);
    pub const SIGVTALRM: Signal = Signal(26);
    pub const SIGPROF: Signal = Signal(27);
    pub const SIGWINCH: Signal = Signal(28);
    pub const SIGIO: Signal = Signal(29);
    pub const SIGPWR: Signal = Signal(30);
    pub const SIGSYS: Signal = Signal(31);
    pub const SIGRTMIN: Signal = Signal(32);
    pub const SIGRTMAX: Signal = Signal(64);

    /// Returns true for signal numbers 1 through 64
    pub fn is_valid(&self) -> bool {
        self.0 >= 1 && self.0 <= Self::SIGRTMAX.0
    }

    /// Returns true for the non-realtime signals, which do not queue
    pub fn is_standard(&self) -> bool {
        self.0 >= 1 && self.0 < Self::SIGRTMIN.0
    }

    pub fn is_realtime(&self) -> bool {
        self.0 >= Self::SIGRTMIN.0 && self.0 <= Self::SIGRTMAX.0
    }

    /// Zero-based index used for per-signal tables
    pub fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    /// Returns true for signals whose default action stops the thread group
    pub fn is_stop(&self) -> bool {
        matches!(
            *self,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        )
    }

    /// The action taken for this signal when no handler is installed
    pub fn default_action(&self) -> DefaultAction {
        match *self {
            Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH => DefaultAction::Ignore,
            Signal::SIGCONT => DefaultAction::Continue,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                DefaultAction::Stop
            }
            Signal::SIGQUIT
            | Signal::SIGILL
            | Signal::SIGTRAP
            | Signal::SIGABRT
            | Signal::SIGBUS
            | Signal::SIGFPE
            | Signal::SIGSEGV
            | Signal::SIGXCPU
            | Signal::SIGXFSZ
            | Signal::SIGSYS => DefaultAction::Core,
            _ => DefaultAction::Term,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal {}", self.0)
    }
}

/// What happens to a thread group when a signal with no handler arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// Terminate the thread group
    Term,
    /// Terminate the thread group and dump core
    Core,
    /// Discard the signal
    Ignore,
    /// Stop every task in the thread group
    Stop,
    /// Continue a stopped thread group
    Continue,
}

/// A set of signals, bit `n - 1` representing signal `n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SignalSet(pub u64);

impl SignalSet {
    /// Signals that can never be blocked or ignored
    pub const UNBLOCKABLE: SignalSet = SignalSet((1 << 8) | (1 << 18));

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(signals: &[Signal]) -> Self {
        let mut set = Self::empty();
        for sig in signals {
            set.add(*sig);
        }
        set
    }

    pub fn contains(&self, sig: Signal) -> bool {
        sig.is_valid() && self.0 & (1u64 << sig.index()) != 0
    }

    pub fn add(&mut self, sig: Signal) {
        if sig.is_valid() {
            self.0 |= 1u64 << sig.index();
        }
    }

    pub fn remove(&mut self, sig: Signal) {
        if sig.is_valid() {
            self.0 &= !(1u64 << sig.index());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns this set with the unblockable signals removed
    pub fn without_unblockable(&self) -> SignalSet {
        SignalSet(self.0 & !Self::UNBLOCKABLE.0)
    }

    /// Iterates the signals in the set, lowest number first
    pub fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
        (1..=Signal::SIGRTMAX.0)
            .map(Signal)
            .filter(move |sig| self.contains(*sig))
    }
}

/// `si_code` values
pub mod code {
    /// Sent by kill(2) or an external caller acting as a user
    pub const SI_USER: i32 = 0;
    /// Sent by the kernel itself
    pub const SI_KERNEL: i32 = 0x80;
    /// Sent by sigqueue(3)
    pub const SI_QUEUE: i32 = -1;
    /// Sent by an expiring timer
    pub const SI_TIMER: i32 = -2;
    /// Child exited
    pub const CLD_EXITED: i32 = 1;
    /// Child was killed
    pub const CLD_KILLED: i32 = 2;
    /// Child dumped core
    pub const CLD_DUMPED: i32 = 3;
    /// Child stopped
    pub const CLD_STOPPED: i32 = 5;
    /// Stopped child continued
    pub const CLD_CONTINUED: i32 = 6;
}

/// The information delivered along with a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    /// Sending process, in the root PID namespace
    pub pid: i32,
    /// Sending user, as a root-namespace UID
    pub uid: u32,
    /// Exit status for SIGCHLD, overrun count for timers
    pub status: i32,
}

impl SignalInfo {
    /// Creates info for a signal sent by the kernel
    pub fn kernel(sig: Signal) -> Self {
        Self {
            signo: sig.0,
            errno: 0,
            code: code::SI_KERNEL,
            pid: 0,
            uid: 0,
            status: 0,
        }
    }

    /// Creates info for a signal sent on behalf of a user
    pub fn user(sig: Signal, pid: i32, uid: u32) -> Self {
        Self {
            signo: sig.0,
            errno: 0,
            code: code::SI_USER,
            pid,
            uid,
            status: 0,
        }
    }

    pub fn signal(&self) -> Signal {
        Signal(self.signo)
    }
}

/// Disposition of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigHandler {
    Default,
    Ignore,
    /// Application handler entry point
    User(u64),
}

/// Flags from `struct sigaction`
pub mod sa_flags {
    pub const SA_NOCLDSTOP: u64 = 0x1;
    pub const SA_NOCLDWAIT: u64 = 0x2;
    pub const SA_SIGINFO: u64 = 0x4;
    pub const SA_ONSTACK: u64 = 0x0800_0000;
    pub const SA_RESTART: u64 = 0x1000_0000;
    pub const SA_NODEFER: u64 = 0x4000_0000;
    pub const SA_RESETHAND: u64 = 0x8000_0000;
}

/// An installed signal action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigAction {
    pub handler: SigHandler,
    pub flags: u64,
    pub restorer: u64,
    /// Signals blocked while the handler runs
    pub mask: SignalSet,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SigHandler::Default,
            flags: 0,
            restorer: 0,
            mask: SignalSet::empty(),
        }
    }
}

/// A wait(2) status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WaitStatus(pub u32);

impl WaitStatus {
    /// Status of a thread group that exited normally
    pub fn exited(code: i32) -> Self {
        Self(((code as u32) & 0xff) << 8)
    }

    /// Status of a thread group killed by a signal
    pub fn signaled(sig: Signal) -> Self {
        Self((sig.0 as u32) & 0x7f)
    }

    /// Status of a thread group killed by a signal that dumped core
    pub fn core_dumped(sig: Signal) -> Self {
        Self(((sig.0 as u32) & 0x7f) | 0x80)
    }

    pub fn is_exited(&self) -> bool {
        self.0 & 0x7f == 0
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.is_exited().then(|| ((self.0 >> 8) & 0xff) as i32)
    }

    pub fn termination_signal(&self) -> Option<Signal> {
        let sig = (self.0 & 0x7f) as i32;
        (sig != 0 && sig != 0x7f).then_some(Signal(sig))
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code(), self.termination_signal()) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(sig)) => write!(f, "killed by {}", sig),
            _ => write!(f, "status {:#x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_classes() {
        assert!(Signal::SIGKILL.is_valid());
        assert!(Signal::SIGKILL.is_standard());
        assert!(!Signal::SIGKILL.is_realtime());
        assert!(Signal::SIGRTMIN.is_realtime());
        assert!(!Signal(0).is_valid());
        assert!(!Signal(65).is_valid());
    }

    #[test]
    fn test_default_actions() {
        assert_eq!(Signal::SIGTERM.default_action(), DefaultAction::Term);
        assert_eq!(Signal::SIGSEGV.default_action(), DefaultAction::Core);
        assert_eq!(Signal::SIGCHLD.default_action(), DefaultAction::Ignore);
        assert_eq!(Signal::SIGSTOP.default_action(), DefaultAction::Stop);
        assert_eq!(Signal::SIGCONT.default_action(), DefaultAction::Continue);
        assert_eq!(Signal::SIGRTMIN.default_action(), DefaultAction::Term);
    }

    #[test]
    fn test_signal_set() {
        let mut set = SignalSet::empty();
        set.add(Signal::SIGUSR1);
        set.add(Signal::SIGRTMAX);
        assert!(set.contains(Signal::SIGUSR1));
        assert!(set.contains(Signal::SIGRTMAX));
        assert!(!set.contains(Signal::SIGUSR2));
        let sigs: Vec<Signal> = set.iter().collect();
        assert_eq!(sigs, vec![Signal::SIGUSR1, Signal::SIGRTMAX]);
        set.remove(Signal::SIGUSR1);
        assert_eq!(set.iter().count(), 1);
    }

    #[test]
    fn test_unblockable() {
        let set = SignalSet::of(&[Signal::SIGKILL, Signal::SIGSTOP, Signal::SIGINT]);
        let masked = set.without_unblockable();
        assert!(!masked.contains(Signal::SIGKILL));
        assert!(!masked.contains(Signal::SIGSTOP));
        assert!(masked.contains(Signal::SIGINT));
    }

    #[test]
    fn test_wait_status() {
        let ws = WaitStatus::exited(3);
        assert_eq!(ws.exit_code(), Some(3));
        assert_eq!(ws.termination_signal(), None);

        let ws = WaitStatus::signaled(Signal::SIGKILL);
        assert_eq!(ws.exit_code(), None);
        assert_eq!(ws.termination_signal(), Some(Signal::SIGKILL));
        assert_eq!(ws.to_string(), "killed by signal 9");

        let ws = WaitStatus::core_dumped(Signal::SIGSEGV);
        assert_eq!(ws.termination_signal(), Some(Signal::SIGSEGV));
    }
}
