//! gRPC propagation of the transaction id.

use tonic::metadata::MetadataMap;

use crate::context::{self, TransactionContext};

/// Metadata key carrying the transaction id. gRPC keys are lowercase.
pub const TRANSACTION_ID_METADATA: &str = "_rtxid";

/// Put the transaction id into outbound metadata.
///
/// Returns false if the id is not a valid metadata value.
pub fn inject(metadata: &mut MetadataMap, transaction_id: &str) -> bool {
    match transaction_id.parse() {
        Ok(value) => {
            metadata.insert(TRANSACTION_ID_METADATA, value);
            true
        }
        Err(_) => false,
    }
}

/// Read the transaction id from inbound metadata.
pub fn extract(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get(TRANSACTION_ID_METADATA)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Create a tonic Request carrying the transaction id.
pub fn transactional_request<T>(msg: T, transaction_id: &str) -> tonic::Request<T> {
    let mut req = tonic::Request::new(msg);
    if !transaction_id.is_empty() {
        inject(req.metadata_mut(), transaction_id);
    }
    req
}

/// Adopt the propagated id of an inbound request, if it carries one.
pub async fn adopt<T>(
    context: &mut TransactionContext,
    request: &tonic::Request<T>,
) -> context::Result<bool> {
    match extract(request.metadata()) {
        Some(transaction_id) => {
            context.set_transaction_id(transaction_id).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}
