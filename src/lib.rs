pub mod al_state;
pub mod config;
pub mod cycle;
pub mod dc;
pub mod error;
pub mod frame;
pub mod hil;
pub mod mapper;
pub mod master;
pub mod process_image;
pub mod recovery;
pub mod register;
pub mod topology;
pub mod transport;

pub use al_state::*;
pub use config::*;
pub use cycle::*;
pub use dc::*;
pub use error::*;
pub use hil::*;
pub use master::*;
pub use process_image::*;
pub use recovery::*;
pub use topology::*;
