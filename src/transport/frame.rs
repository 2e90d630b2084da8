//! JSON-RPC style frames exchanged with the devices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request envelope. Lives for one `call` only.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl Request<'_> {
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of plain JSON values cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result { id: Option<u64>, result: Value },
    Error { id: Option<u64>, error: RpcError },
}

impl Reply {
    pub fn id(&self) -> Option<u64> {
        match self {
            Reply::Result { id, .. } | Reply::Error { id, .. } => *id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Decode a datagram. Anything that is not a JSON object carrying either
/// `result` or `error` is a decode failure.
pub fn decode(datagram: &[u8]) -> Result<Reply, String> {
    let raw: RawReply = serde_json::from_slice(datagram).map_err(|e| e.to_string())?;
    match (raw.error, raw.result) {
        (Some(error), _) => Ok(Reply::Error { id: raw.id, error }),
        (None, Some(result)) => Ok(Reply::Result { id: raw.id, result }),
        (None, None) => Err("reply carries neither result nor error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_encodes_id_method_params() {
        let params = json!({"id": 0});
        let bytes = Request { id: 7, method: "ES.GetMode", params: &params }.encode();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, json!({"id": 7, "method": "ES.GetMode", "params": {"id": 0}}));
    }

    #[test]
    fn decodes_result_and_error_replies() {
        let ok = decode(br#"{"id":3,"src":"VenusE","result":{"id":0,"mode":"Auto"}}"#).unwrap();
        assert_eq!(ok.id(), Some(3));
        assert!(matches!(ok, Reply::Result { .. }));

        let err = decode(br#"{"id":4,"error":{"code":-32600,"message":"busy"}}"#).unwrap();
        assert_eq!(
            err,
            Reply::Error {
                id: Some(4),
                error: RpcError { code: -32600, message: "busy".into() }
            }
        );
    }

    #[test]
    fn rejects_malformed_datagrams() {
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"id":1}"#).is_err());
        assert!(decode(br#"[1,2]"#).is_err());
    }
}
