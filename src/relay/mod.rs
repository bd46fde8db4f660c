//! Standalone relays: the request [`router`] and the publish/subscribe [`bus`].

pub mod bus;
pub mod router;
