mod errors;
pub use errors::{HandshakeError, HubError, PeerError, RegistryError, UserDbError};

mod name;
pub use name::{InvalidNickname, Nickname};

mod config;
pub use config::{HubConfig, Software};

mod users;
pub use users::{MemUserDatabase, UserDatabase};

mod sid;
pub use sid::SidAllocator;

pub mod peer;
pub use peer::{Message, Peer, Protocol, SearchRequest, UserInfo};

mod room;
pub use room::Room;

mod directory;
pub use directory::{NameReservation, PeerDirectory};

mod hub;
pub use hub::Hub;

mod router;

pub mod adc;
pub mod irc;
pub mod nmdc;
