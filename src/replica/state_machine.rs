use bytes::Bytes;

/// StateMachine is the application specific view of applying the replicated logs in sequential
/// consistent order.
pub trait StateMachine: Send {
    /// apply_command is called only when its guaranteed that the provided entry has been
    /// committed (i.e. replicated to a majority). Because of this guarantee, you will never need
    /// to reverse an entry once you've been asked to apply it, so your impl of applying an entry
    /// need not be reversible. Note: Entry here is synonymous with a state transition.
    ///
    /// The leader will not respond success to the client's request until this method call
    /// completes. You can optionally provide an opaque data blob as a result of applying the state
    /// transition, and we will return it to your client.
    fn apply_command(&mut self, command: Bytes) -> StateMachineOutput;

    /// Serialize the full state as of the last applied command. The log prefix covered by the
    /// returned blob is discarded afterwards, so it must be self-sufficient.
    fn generate_snapshot(&self) -> Bytes;

    /// Replace the full state with a blob previously produced by `generate_snapshot()`, possibly
    /// on another replica.
    fn apply_snapshot(&mut self, snapshot: Bytes) -> Result<(), StateMachineError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum StateMachineOutput {
    Data(Bytes),
    NoData,
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("Snapshot is corrupt: {0}")]
    CorruptSnapshot(String),
    #[error("State machine failure: {0}")]
    Other(String),
}

/// NoOpStateMachine accepts everything and remembers nothing. Handy for nodes that only exist to
/// vote, and for tests that only care about the log.
#[derive(Default)]
pub struct NoOpStateMachine {
    // nothing
}

impl NoOpStateMachine {
    pub fn new() -> Self {
        NoOpStateMachine {}
    }
}

impl StateMachine for NoOpStateMachine {
    fn apply_command(&mut self, _: Bytes) -> StateMachineOutput {
        StateMachineOutput::NoData
    }

    fn generate_snapshot(&self) -> Bytes {
        Bytes::new()
    }

    fn apply_snapshot(&mut self, _: Bytes) -> Result<(), StateMachineError> {
        Ok(())
    }
}
