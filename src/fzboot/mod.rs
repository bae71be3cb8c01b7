mod err;
pub mod irq;
pub mod log;
pub mod time;

pub mod errors {
    pub use crate::fzboot::err::*;
}
