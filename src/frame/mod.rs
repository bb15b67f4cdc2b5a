pub mod coe;
pub mod ethercat;
pub mod mailbox;

pub use coe::*;
pub use ethercat::*;
pub use mailbox::*;
