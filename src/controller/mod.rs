//! Controller reconciliation logic
//!
//! One reconciler per watched resource, each built on the runtime's
//! controller engine: a rate-limited keyed queue fed by an informer-backed
//! cache, with at most one in-flight sync per key. Errors returned from a
//! sync requeue the key with backoff; a clean sync parks the key until the
//! next change.

pub mod cloudprivateipconfig;
pub mod node;
pub mod secret;
