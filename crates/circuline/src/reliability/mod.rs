//! Reliable-delivery bookkeeping: the outstanding-reliable map on the send
//! side and the duplicate-suppression archive on the receive side.

pub mod need_ack;
pub mod packet_archive;

pub use need_ack::{NeedAckMap, OutgoingPacket, ResendSweep};
pub use packet_archive::PacketArchive;
