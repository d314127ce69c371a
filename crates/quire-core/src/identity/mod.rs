//! Key identity for writers and groups
//!
//! Every writer owns an Ed25519 key pair; its public half is the
//! [`WriterKey`](crate::types::WriterKey) naming that writer's log. Each group
//! additionally carries a shared signing key pair, distributed in the join
//! link, which countersigns every envelope to prove the writer was admitted.
//!
//! ```rust
//! use quire_core::identity::Keypair;
//!
//! let keypair = Keypair::generate();
//! let signature = keypair.sign(b"entry");
//! assert!(keypair.writer_key().verify(b"entry", &signature));
//! ```

mod keypair;

pub use keypair::{verify_signature, Keypair, SIGNATURE_SIZE};
