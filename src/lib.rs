#![doc = include_str!("../README.md")]

pub mod datalink;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use datalink::mstp::{
    Clock, Frame, FrameType, ManualClock, MasterHandle, MasterNodeListener, MasterState,
    MasterStats, MstpMaster, OctetStream, SystemClock, MSTP_BROADCAST_ADDRESS, MSTP_MAX_MASTER,
};
pub use datalink::{DataLinkError, Result};
