// Relay transport: publish/subscribe over independent, unreliable relays.

pub mod latency;
pub mod memory;
pub mod pool;
pub mod relay;
pub mod seen;
pub mod store;
pub mod ws;

pub use latency::rank_relays;
pub use memory::{MemoryRelayConnector, MemoryRelayNetwork};
pub use pool::{RelayPool, SubscriptionId};
pub use relay::{RelayConnection, RelayConnector, RelayError, RelayEvent};
pub use seen::SeenCache;
pub use store::{RecordStore, StoreOutcome};
pub use ws::WsRelayConnector;
