//! HTTP propagation of the transaction id.
//!
//! The id travels as the `_rtxId` query parameter on outbound requests.

use http::uri::{PathAndQuery, Uri};
use http::Request;

use crate::config::parse_query_string;
use crate::context::{self, TransactionContext};

/// Query parameter carrying the transaction id.
pub const TRANSACTION_ID_PARAMETER: &str = "_rtxId";

/// Append the transaction id to an outbound URI.
pub fn inject(uri: &Uri, transaction_id: &str) -> Result<Uri, http::Error> {
    let path = match uri.path() {
        "" => "/",
        path => path,
    };
    let path_and_query = match uri.query() {
        Some(query) if !query.is_empty() => format!(
            "{}?{}&{}={}",
            path, query, TRANSACTION_ID_PARAMETER, transaction_id
        ),
        _ => format!("{}?{}={}", path, TRANSACTION_ID_PARAMETER, transaction_id),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query)?);
    Ok(Uri::from_parts(parts)?)
}

/// Read the transaction id from a raw query string.
pub fn extract_from_query(query: &str) -> Option<String> {
    parse_query_string(query)
        .remove(TRANSACTION_ID_PARAMETER)
        .filter(|id| !id.is_empty())
}

/// Read the transaction id from an inbound request.
pub fn extract<B>(request: &Request<B>) -> Option<String> {
    request.uri().query().and_then(extract_from_query)
}

/// The URL an inbound request entered through, without its query.
///
/// Origin-form request targets are completed from the `Host` header.
pub fn entry_url<B>(request: &Request<B>) -> String {
    let uri = request.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = uri.authority().map(|a| a.as_str()).or_else(|| {
        request
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
    });
    match authority {
        Some(authority) => format!("{}://{}{}", scheme, authority, uri.path()),
        None => uri.path().to_string(),
    }
}

/// Record the entry URL and adopt a propagated id, if the request carries one.
///
/// Returns whether an id was adopted.
pub async fn adopt<B>(
    context: &mut TransactionContext,
    request: &Request<B>,
) -> context::Result<bool> {
    context.set_entry_url(entry_url(request));
    match extract(request) {
        Some(transaction_id) => {
            context.set_transaction_id(transaction_id).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_without_query() {
        let uri: Uri = "http://stock:8080/reserve".parse().unwrap();
        let uri = inject(&uri, "tx-1").unwrap();
        assert_eq!(uri.to_string(), "http://stock:8080/reserve?_rtxId=tx-1");
    }

    #[test]
    fn test_inject_with_query() {
        let uri: Uri = "http://stock:8080/reserve?sku=7".parse().unwrap();
        let uri = inject(&uri, "tx-1").unwrap();
        assert_eq!(
            uri.to_string(),
            "http://stock:8080/reserve?sku=7&_rtxId=tx-1"
        );
    }

    #[test]
    fn test_inject_bare_authority() {
        let uri: Uri = "http://stock:8080".parse().unwrap();
        let uri = inject(&uri, "tx-1").unwrap();
        assert_eq!(uri.to_string(), "http://stock:8080/?_rtxId=tx-1");
    }

    #[test]
    fn test_inject_rejects_invalid_id() {
        let uri: Uri = "http://stock:8080/reserve".parse().unwrap();
        assert!(inject(&uri, "tx 1").is_err());
    }

    #[test]
    fn test_extract_from_query() {
        assert_eq!(
            extract_from_query("sku=7&_rtxId=tx-1"),
            Some("tx-1".to_string())
        );
        assert_eq!(extract_from_query("sku=7"), None);
        assert_eq!(extract_from_query("_rtxId="), None);
        assert_eq!(extract_from_query("_rtxid=tx-1"), None);
    }

    #[test]
    fn test_extract_from_request() {
        let request = Request::get("/orders?_rtxId=tx-9").body(()).unwrap();
        assert_eq!(extract(&request), Some("tx-9".to_string()));

        let request = Request::get("/orders").body(()).unwrap();
        assert_eq!(extract(&request), None);
    }

    #[test]
    fn test_entry_url() {
        let request = Request::get("/orders/7?_rtxId=tx-9")
            .header(http::header::HOST, "orders:8080")
            .body(())
            .unwrap();
        assert_eq!(entry_url(&request), "http://orders:8080/orders/7");

        let request = Request::get("https://orders/place").body(()).unwrap();
        assert_eq!(entry_url(&request), "https://orders/place");

        let request = Request::get("/place").body(()).unwrap();
        assert_eq!(entry_url(&request), "/place");
    }
}
