pub mod dispatcher;
pub mod reducer;

pub use dispatcher::{DispatchGate, SideEffectDispatcher};
pub use reducer::{CycleOutcome, DueEffect, reduce};
