mod channel;
mod connecter;

pub use channel::{ControlChannel, ControlStream};
pub use connecter::{Connecter, Role};
