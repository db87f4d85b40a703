//! Example `StateMachine` implementations for exercising `raft` end to end.

pub mod counter;
pub mod register;

pub use counter::CounterStateMachine;
pub use register::RegisterStateMachine;
