//! ActivityPub federation
//!
//! Inbound dispatch, outbound broadcasts, actor resolution, and the
//! signed HTTP transport between them.

pub mod delivery;
pub mod inbox;
pub mod outbox;
pub mod resolver;
pub mod signature;

pub use delivery::{DeliveryResult, SignedDelivery};
pub use inbox::{ActivityType, InboxAction, InboxDispatcher, InboxOutcome};
pub use outbox::{BroadcastReport, OutboxDistributor};
pub use resolver::ActorResolver;
pub use signature::{
    SignatureHeaders, extract_signature_key_id, key_id_matches_actor, sign_request,
    verify_signature,
};
