//! Outbound delivery: type resolution, channel caching and raw invocation.

pub mod codec;
pub mod connections;
pub mod invoker;
pub mod resolver;

pub use codec::{CodecError, RawCodec, RawFrame};
pub use connections::{ConnectionCache, ConnectionError, TransportSecurity};
pub use invoker::{DeliveryError, DynamicInvoker, InternalError};
pub use resolver::{DescriptorResolver, ResolveError, TypeResolver};
