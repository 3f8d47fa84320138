//! Turn management: the conversation state machine and its manager.

mod fsm;
mod manager;
pub mod processor;

pub use fsm::{StateChange, StateListener, StateMachine, TurnState};
pub use manager::{AggressiveStrategy, FrameEmitter, PoliteStrategy, Strategy, TurnManager};
pub use processor::{TurnProcessor, TurnProcessorConfig};
