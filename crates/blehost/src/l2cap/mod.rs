//! L2CAP fixed-channel framing.
//!
//! Only the two LE fixed channels the host uses are recognized: the ATT
//! channel (0x0004) and the Security Manager channel (0x0006). There is no
//! dynamic channel establishment and no credit-based flow control.

mod packet;

pub use packet::{BasicFrame, CID_ATT, CID_SMP, HEADER_LEN};
