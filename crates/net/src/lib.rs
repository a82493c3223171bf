pub mod checksum;
pub mod icmp;
pub mod mapping;
pub mod packet;
pub mod pmtu;
pub mod rate_limit;
pub mod translator;

mod error;
mod gateway;
mod packet_io;
mod source;

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
mod tun;

pub use error::NetError;
pub use gateway::{Control, Gateway};
pub use mapping::{Direction, MappingError, MappingTable};
pub use packet::OutboundPacket;
pub use packet_io::PacketIO;
pub use pmtu::{PathMtuCache, PmtuConfig};
pub use source::{FixedSourceSelector, KernelSourceSelector, SourceAddressSelector};
pub use translator::{DropReason, Translator, TranslatorConfig};

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub use tun::TunDevice;
