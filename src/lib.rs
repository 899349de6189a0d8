//! Persistent, message oriented connections over TCP, UDP and KCP.
//!
//! ## Layers
//!
//! * `buffers`: a pool of reusable byte buffers, plus the lock-free queues connections use to hand
//!   data between tasks
//! * `stream`: `ByteStream`, the byte pipe between a connection task and a message decoder
//! * `codec`: framing of messages into envelopes, with pluggable post-processing (checksums etc.)
//!   of the payload
//! * `connection`: the connection contract, its TCP, UDP and KCP implementations, servers, and a
//!   URI scheme registry to create them
//! * `channel`: typed message channels on top of a connection
//! * `request`: request / response correlation on top of a channel
//!
//! ## Threading
//!
//! Each connection is driven by a single tokio task that does all of its socket I/O. Other tasks
//!  interact with a connection only through its send queue and the inbound byte stream. In
//!  *positive mode* there is no connection task, and the application drives the connection by
//!  calling `step()` periodically.
//!
//! ## Wire format
//!
//! Every message is framed by an envelope header followed by the payload. All header fields are
//!  unsigned LEB128 varints:
//!
//! ```ascii
//! type     message kind, 0 is reserved
//! flags    bits set by post-processors, e.g. 'checksum appended'
//! seq      the sender's sequence number for this message
//! sseq     for a response, the sequence number of the request it answers; 0 otherwise
//! len      number of payload bytes
//! payload  len bytes
//! ```
//!
//! TCP and KCP transport envelopes as a byte stream. UDP sends each composed message as one
//!  datagram, so a message that does not fit into a datagram is not delivered.
//!
//! KCP connections either use a conversation id that both sides agree on beforehand (`kcpraw`),
//!  or have the server assign one in a handshake on the reserved conversation 0 (`kcp`):
//!
//! ```ascii
//! client -> server    0x01  nonce (u64 BE)
//! server -> client    0x02  nonce (u64 BE)  conv (u32 BE)
//! ```

pub mod buffers;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod request;
pub mod stream;
pub mod util;
