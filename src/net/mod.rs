pub mod arrival;
pub mod packet_time_window;
pub mod protocol;

pub use arrival::{ArrivalBuffer, ArrivalEvent, ArrivalKind, ArrivalSender};
pub use packet_time_window::PacketTimeWindow;
pub use protocol::{ObserverMessage, ViewStateError};
