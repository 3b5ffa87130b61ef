mod factory;
mod types;

pub use factory::CommandFactory;
pub use types::{ClientCommand, CommandClone, CommandFlags, LockstepCommand, TurnCommand};
