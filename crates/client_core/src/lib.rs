pub mod backbone;
pub mod chat;
pub mod connection;
pub mod contacts;
pub mod error;
pub mod heartbeat;
pub mod login;
pub mod pending;
pub mod router;
pub mod session;
pub mod settings;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use backbone::Backbone;
pub use chat::{ChatEvent, ChatService};
pub use connection::{Connection, ConnectionEvent, ConnectionState, MessageLink};
pub use contacts::{ContactEvent, ContactService};
pub use error::{ConnectionError, RouterError, ServiceError, SettingsError, TransportError};
pub use heartbeat::{HeartbeatEvent, LivenessMonitor};
pub use login::{LoginEvent, LoginFlow};
pub use router::{MessageRouter, RouterEvent};
pub use session::{Session, SessionStore};
pub use settings::{load_settings, load_settings_from, ClientSettings};
pub use transport::{Frame, TransportConnector, TransportLink, WebSocketConnector};
