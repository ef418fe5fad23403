pub mod device;
pub mod server;
pub mod waveform;

pub use device::*;
pub use server::*;
pub use waveform::*;
