//! # bitdht - BitTorrent Mainline DHT
//!
//! A Kademlia DHT node speaking the BitTorrent KRPC protocol:
//!
//! - **BEP 5**: routing table, `ping`/`find_node`/`get_peers`/`announce_peer`
//! - **BEP 42**: node IDs bound to the node's external IP
//! - **BEP 43**: read-only nodes
//! - **BEP 44**: immutable and signed mutable items via `get`/`put`
//! - **BEP 51**: info-hash sampling
//!
//! ## Architecture
//!
//! The protocol core ([`DhtNode`]) is synchronous and single-threaded. It is
//! handed its socket, storage and observer as capabilities and is driven by
//! incoming packets, a periodic tick and lookup requests.
//!
//! [`Dht`] wraps the core in an actor task owning a UDP socket. Handles are
//! cheap to clone and talk to the actor over a channel.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node_id` | 160-bit IDs, XOR distance, BEP 42 generation and checks |
//! | `routing_table` | Bucketed routing table with replacement caches |
//! | `rpc_manager` | Transaction IDs and timeouts of outstanding queries |
//! | `traversal` | Iterative lookups and their store phases |
//! | `node` | Query handling and the glue between all of the above |
//! | `storage` | Peers and BEP 44 items stored for others |
//! | `msg` | Bencode and KRPC message helpers |
//! | `dht` | Async service and upload limiting |

mod dht;
mod dos_blocker;
mod ip_set;
mod ip_voter;
mod item;
mod msg;
mod node;
mod node_entry;
mod node_id;
mod protocols;
mod routing_table;
mod rpc_manager;
mod settings;
mod state;
mod storage;
mod traversal;

pub use dht::{Dht, UdpSender};
pub use dos_blocker::DosBlocker;
pub use ip_set::{compare_ip_cidr, IpSet};
pub use ip_voter::ExternalIpVoter;
pub use item::{
    item_target_id, mutable_target_id, sign_mutable_item, verify_mutable_item, Item, ITEM_MAX_SIZE,
    PUBLIC_KEY_LEN, SALT_MAX_SIZE, SIGNATURE_LEN,
};
pub use msg::{Dict, DictExt, ErrorCode, KrpcError, Message, MessageKind, Value};
pub use node::{DhtNode, NodeStatus};
pub use node_entry::NodeEntry;
pub use node_id::{distance, distance_exp, generate_id, generate_random_id, verify_id, NodeId, ID_LEN};
pub use protocols::{DatagramSocket, DhtObserver, NullObserver, SocketManager};
pub use routing_table::{AddNodeStatus, RoutingTable, TableSize};
pub use settings::DhtSettings;
pub use state::DhtState;
pub use storage::{DefaultStorage, DhtStorage, StorageCounters};
pub use traversal::{AnnounceFlags, GetPeersResult, SampleResult, TraversalId};
