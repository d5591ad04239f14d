//! Invoke arbitrary unary gRPC methods from stored timer targets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tonic::Code;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, MetadataMap,
};
use tracing::debug;

use super::codec::{CodecError, RawCodec, marshal};
use super::connections::{ConnectionCache, ConnectionError};
use super::resolver::{ResolveError, TypeResolver};
use crate::timer::RpcTarget;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures that happen before the request reaches the remote endpoint.
#[derive(Debug, Error)]
pub enum InternalError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid rpc method path `{0}`")]
    InvalidMethod(String),
    #[error("invalid metadata entry `{0}`")]
    InvalidMetadata(String),
}

/// Outcome of a failed delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("internal: {0}")]
    Internal(#[from] InternalError),
    /// The endpoint, or the transport on its behalf, answered with a status.
    #[error("code = {code:?} desc = {message}")]
    Remote { code: Code, message: String },
}

impl DeliveryError {
    pub fn err_type(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::Remote { .. } => "remote",
        }
    }

    /// Numeric gRPC status of a remote failure.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::Internal(_) => None,
            Self::Remote { code, .. } => Some(*code as i32),
        }
    }

    fn remote(status: tonic::Status) -> Self {
        Self::Remote {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<ResolveError> for DeliveryError {
    fn from(err: ResolveError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ConnectionError> for DeliveryError {
    fn from(err: ConnectionError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<CodecError> for DeliveryError {
    fn from(err: CodecError) -> Self {
        Self::Internal(err.into())
    }
}

/// Sends stored argument bytes to `target.method` over a cached channel.
#[derive(Clone)]
pub struct DynamicInvoker {
    resolver: Arc<dyn TypeResolver>,
    connections: Arc<ConnectionCache>,
    call_timeout: Duration,
}

impl DynamicInvoker {
    pub fn new(resolver: Arc<dyn TypeResolver>, connections: Arc<ConnectionCache>) -> Self {
        Self {
            resolver,
            connections,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Validate the stored arguments and perform the call. Returns the raw
    /// response message bytes.
    pub async fn invoke(&self, target: &RpcTarget) -> Result<Bytes, DeliveryError> {
        // The decoded message is only a validity check; the original bytes are sent.
        self.resolver
            .decode(&target.args_type_url, &target.args_data)?;
        self.resolver.resolve(&target.return_type_url)?;

        let path = PathAndQuery::try_from(target.method.as_str())
            .map_err(|_| InternalError::InvalidMethod(target.method.clone()))?;

        let mut request = tonic::Request::new(marshal(&target.args_data)?);
        apply_metadata(request.metadata_mut(), &target.meta)?;
        request.set_timeout(self.call_timeout);

        let channel = self
            .connections
            .get(&target.addr, &target.authority)
            .await?;
        let mut grpc = Grpc::new(channel);

        let call = async {
            grpc.ready().await.map_err(|err| DeliveryError::Remote {
                code: Code::Unavailable,
                message: err.to_string(),
            })?;
            grpc.unary(request, path, RawCodec::<Bytes>::default())
                .await
                .map_err(DeliveryError::remote)
        };
        let response = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeliveryError::Remote {
                    code: Code::DeadlineExceeded,
                    message: format!("no response within {:?}", self.call_timeout),
                });
            }
        };

        let body = response.into_inner();
        debug!(
            rpc_method = %target.method,
            response_bytes = body.len(),
            "rpc delivered"
        );
        Ok(body)
    }
}

/// Copy a timer's `rpc_meta` onto an outgoing request.
///
/// Keys ending in `-bin` carry the value's bytes as binary metadata; tonic
/// base64-encodes them on the wire.
fn apply_metadata(
    metadata: &mut MetadataMap,
    meta: &HashMap<String, String>,
) -> Result<(), InternalError> {
    for (key, value) in meta {
        let key_name = key.to_ascii_lowercase();
        let invalid = || InternalError::InvalidMetadata(key.clone());
        if key_name.ends_with("-bin") {
            let metadata_key =
                BinaryMetadataKey::from_bytes(key_name.as_bytes()).map_err(|_| invalid())?;
            metadata.insert_bin(metadata_key, BinaryMetadataValue::from_bytes(value.as_bytes()));
        } else {
            let metadata_key =
                AsciiMetadataKey::from_bytes(key_name.as_bytes()).map_err(|_| invalid())?;
            let metadata_value = AsciiMetadataValue::try_from(value.as_str()).map_err(|_| invalid())?;
            metadata.insert(metadata_key, metadata_value);
        }
    }
    Ok(())
}
