//! Protobuf type URL resolution backed by descriptor sets.

use std::path::Path;

use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use thiserror::Error;

use crate::messages::FILE_DESCRIPTOR_SET;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("type url `{0}` has no message name")]
    InvalidTypeUrl(String),
    #[error("message type `{0}` is not known to the resolver")]
    UnknownType(String),
    #[error("failed to load descriptor set: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),
    #[error("failed to read descriptor set {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("payload is not a valid `{type_name}`: {source}")]
    Decode {
        type_name: String,
        #[source]
        source: prost::DecodeError,
    },
}

/// Maps `type.googleapis.com/pkg.Message` style URLs to message descriptors.
pub trait TypeResolver: Send + Sync {
    fn resolve(&self, type_url: &str) -> Result<MessageDescriptor, ResolveError>;

    /// Decode `data` as the type named by `type_url`.
    fn decode(&self, type_url: &str, data: &[u8]) -> Result<DynamicMessage, ResolveError> {
        let descriptor = self.resolve(type_url)?;
        DynamicMessage::decode(descriptor.clone(), data).map_err(|source| ResolveError::Decode {
            type_name: descriptor.full_name().to_string(),
            source,
        })
    }
}

/// Message name portion of a type URL: everything after the last `/`.
pub fn message_name(type_url: &str) -> Result<&str, ResolveError> {
    let name = type_url.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        return Err(ResolveError::InvalidTypeUrl(type_url.to_string()));
    }
    Ok(name)
}

/// Resolver over a [`DescriptorPool`].
#[derive(Debug, Clone)]
pub struct DescriptorResolver {
    pool: DescriptorPool,
}

impl DescriptorResolver {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Resolver that knows the `sand.v1` messages.
    pub fn builtin() -> Result<Self, ResolveError> {
        Ok(Self::new(DescriptorPool::decode(FILE_DESCRIPTOR_SET)?))
    }

    /// Builtin messages plus every descriptor set file in `paths`.
    pub fn with_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ResolveError> {
        let mut resolver = Self::builtin()?;
        for path in paths {
            let path = path.as_ref();
            let bytes = std::fs::read(path).map_err(|source| ResolveError::Io {
                path: path.display().to_string(),
                source,
            })?;
            resolver.add_file_descriptor_set(&bytes)?;
        }
        Ok(resolver)
    }

    pub fn add_file_descriptor_set(&mut self, bytes: &[u8]) -> Result<(), ResolveError> {
        self.pool.decode_file_descriptor_set(bytes)?;
        Ok(())
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

impl TypeResolver for DescriptorResolver {
    fn resolve(&self, type_url: &str) -> Result<MessageDescriptor, ResolveError> {
        let name = message_name(type_url)?;
        self.pool
            .get_message_by_name(name)
            .ok_or_else(|| ResolveError::UnknownType(name.to_string()))
    }
}
