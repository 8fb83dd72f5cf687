//! Handles and protocol types shared by every device

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::fmt;
use std::time::Duration;

/// Handle to a device-side buffer object
///
/// Opaque to the host; only the device that issued it can resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoHandle(pub u64);

impl BoHandle {
    /// Create a new buffer handle
    pub const fn new(id: u64) -> Self {
        BoHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo{}", self.0)
    }
}

/// Hardware context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Memory bank a buffer argument must be placed in, as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

/// Placement flags for a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Host-cacheable; used for the instruction stream
    Cacheable,
    /// Host memory the device reaches directly; used for operands
    HostOnly,
}

/// Direction of a buffer synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    ToDevice,
    FromDevice,
}

impl SyncDirection {
    /// Short label used in transfer events
    pub const fn label(self) -> &'static str {
        match self {
            SyncDirection::ToDevice => "H2D",
            SyncDirection::FromDevice => "D2H",
        }
    }
}

/// Dispatch selector passed as the first kernel argument
///
/// The host treats this as an opaque protocol constant; only the program
/// loaded on the device interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

impl Opcode {
    /// Execute the instruction stream passed alongside the operands
    pub const RUN_SEQUENCE: Opcode = Opcode(3);
}

impl Default for Opcode {
    fn default() -> Self {
        Self::RUN_SEQUENCE
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel argument as seen by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Scalar(u64),
    Buffer(BoHandle),
}

/// Device-reported state of a submitted run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed,
    Error(String),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

/// Outcome of polling a [`RunCompletion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Ready(RunState),
    Pending,
    /// Device went away without reporting a final state
    Lost,
}

/// Completion signal for one submitted run
///
/// The device sends exactly one terminal [`RunState`] when the run finishes.
#[derive(Debug)]
pub struct RunCompletion {
    id: u64,
    receiver: Receiver<RunState>,
}

impl RunCompletion {
    pub fn new(id: u64, receiver: Receiver<RunState>) -> Self {
        Self { id, receiver }
    }

    /// Device-wide sequence number of this run
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block for the terminal state, at most `timeout` when given.
    pub fn wait(&self, timeout: Option<Duration>) -> Poll {
        let received = match timeout {
            None => self.receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(limit) => self.receiver.recv_timeout(limit),
        };
        match received {
            Ok(state) => Poll::Ready(state),
            Err(RecvTimeoutError::Timeout) => Poll::Pending,
            Err(RecvTimeoutError::Disconnected) => Poll::Lost,
        }
    }

    pub fn try_poll(&self) -> Poll {
        match self.receiver.try_recv() {
            Ok(state) => Poll::Ready(state),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Lost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(BoHandle::new(42).to_string(), "bo42");
        assert_eq!(BoHandle::new(7).id(), 7);
        assert_eq!(ContextId(3).to_string(), "ctx3");
        assert_eq!(GroupId(5).to_string(), "group5");
    }

    #[test]
    fn test_opcode_default_runs_sequence() {
        assert_eq!(Opcode::default(), Opcode(3));
        assert_eq!(SyncDirection::ToDevice.label(), "H2D");
        assert_eq!(SyncDirection::FromDevice.label(), "D2H");
    }

    #[test]
    fn test_only_running_is_not_terminal() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Error("dma fault".into()).is_terminal());
    }

    #[test]
    fn test_completion_timeout_and_ready() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let completion = RunCompletion::new(9, rx);
        assert_eq!(completion.try_poll(), Poll::Pending);
        assert_eq!(completion.wait(Some(Duration::from_millis(5))), Poll::Pending);

        tx.send(RunState::Completed).unwrap();
        assert_eq!(completion.wait(None), Poll::Ready(RunState::Completed));

        drop(tx);
        assert_eq!(completion.wait(None), Poll::Lost);
    }
}
