mod barrier;
mod device;

pub use barrier::{Barrier, CancelledBarrier, LocalBarrier, NopBarrier};
pub use device::DeviceId;
