use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::code;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub share_id: String,
    pub name: String,
    pub read_only: bool,
}

/// One variant per control message. The serde tag is the wire `type`; field
/// names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    Hello {
        req_id: String,
        proto: String,
        device_id: String,
        device_name: String,
        auth: String,
    },
    HelloAck {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        auth: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_required: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selected_auth: Option<String>,
    },
    Auth {
        req_id: String,
        client_nonce: String,
        mac: String,
    },
    AuthOk {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Ping {
        req_id: String,
    },
    Pong {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    ListShares {
        req_id: String,
    },
    ListSharesResp {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        shares: Vec<ShareInfo>,
    },
    ListDir {
        req_id: String,
        share_id: String,
        path: String,
    },
    ListDirResp {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        entries: Vec<crate::core::models::DirEntry>,
    },
    Stat {
        req_id: String,
        share_id: String,
        path: String,
    },
    StatResp {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stat: Option<crate::core::models::FileStat>,
    },
    HashReq {
        req_id: String,
        share_id: String,
        path: String,
        offset: u64,
        length: u64,
    },
    HashResp {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    DownloadReq {
        req_id: String,
        transfer_id: String,
        share_id: String,
        path: String,
        offset: u64,
    },
    DownloadAck {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<FileInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
    },
    UploadReq {
        req_id: String,
        transfer_id: String,
        share_id: String,
        path: String,
        file: FileInfo,
    },
    UploadAck {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
    },
    UploadDone {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    FileChunk {
        transfer_id: String,
        offset: u64,
        length: u64,
    },
    FileEnd {
        transfer_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<FileInfo>,
    },
}

/// Outcome of decoding a JSON frame: a known message, or enough of the raw
/// envelope to answer `${type}_RESP { ok: false }`.
#[derive(Debug)]
pub enum Decoded {
    Control(ControlMessage),
    Unrecognized { msg_type: String, req_id: String },
}

pub fn encode(message: &ControlMessage) -> AppResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|error| {
        AppError::new(code::INTERNAL_ERROR, "control message encode failed")
            .with_detail(error.to_string())
    })
}

/// Single-parse decode: the payload is parsed to a JSON tree once; the raw
/// `type`/`reqId` are lifted out before the typed conversion so unknown
/// messages keep their identity.
pub fn decode(payload: &[u8]) -> AppResult<Decoded> {
    let value: Value = serde_json::from_slice(payload).map_err(|error| {
        AppError::new(code::BAD_REQUEST, "control frame is not valid JSON")
            .with_detail(error.to_string())
    })?;

    let msg_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();
    let req_id = value
        .get("reqId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match serde_json::from_value::<ControlMessage>(value) {
        Ok(message) => Ok(Decoded::Control(message)),
        Err(_) => Ok(Decoded::Unrecognized { msg_type, req_id }),
    }
}

/// Mechanical request→response type derivation.
pub fn response_type_for(request_type: &str) -> String {
    match request_type {
        "HELLO" => "HELLO_ACK".to_string(),
        "AUTH" => "AUTH_OK".to_string(),
        "PING" => "PONG".to_string(),
        "DOWNLOAD_REQ" => "DOWNLOAD_ACK".to_string(),
        "UPLOAD_REQ" => "UPLOAD_ACK".to_string(),
        other => format!("{other}_RESP"),
    }
}

/// Failure response for a request that never decoded into a typed variant.
pub fn failure_payload(
    request_type: &str,
    req_id: &str,
    error_code: &str,
    message: &str,
) -> AppResult<Vec<u8>> {
    let body = serde_json::json!({
        "type": response_type_for(request_type),
        "reqId": req_id,
        "ok": false,
        "error": { "code": code::to_wire(error_code), "message": message },
    });
    serde_json::to_vec(&body).map_err(|error| {
        AppError::new(code::INTERNAL_ERROR, "failure response encode failed")
            .with_detail(error.to_string())
    })
}

pub fn error_body(error: &AppError) -> ErrorBody {
    ErrorBody {
        code: code::to_wire(&error.code).to_string(),
        message: error.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_should_roundtrip_with_camel_case_fields() {
        let hello = ControlMessage::Hello {
            req_id: "r1".to_string(),
            proto: "1.0".to_string(),
            device_id: "C".to_string(),
            device_name: "cli".to_string(),
            auth: "open".to_string(),
        };
        let bytes = encode(&hello).expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert!(text.contains(r#""type":"HELLO""#));
        assert!(text.contains(r#""reqId":"r1""#));
        assert!(text.contains(r#""deviceName":"cli""#));

        match decode(&bytes).expect("decode") {
            Decoded::Control(ControlMessage::Hello { req_id, proto, .. }) => {
                assert_eq!(req_id, "r1");
                assert_eq!(proto, "1.0");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_should_surface_raw_envelope() {
        let payload = br#"{"type":"FROBNICATE","reqId":"x7"}"#;
        match decode(payload).expect("decode") {
            Decoded::Unrecognized { msg_type, req_id } => {
                assert_eq!(msg_type, "FROBNICATE");
                assert_eq!(req_id, "x7");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn response_types_should_follow_the_table() {
        assert_eq!(response_type_for("HELLO"), "HELLO_ACK");
        assert_eq!(response_type_for("AUTH"), "AUTH_OK");
        assert_eq!(response_type_for("PING"), "PONG");
        assert_eq!(response_type_for("LIST_SHARES"), "LIST_SHARES_RESP");
        assert_eq!(response_type_for("DOWNLOAD_REQ"), "DOWNLOAD_ACK");
        assert_eq!(response_type_for("UPLOAD_REQ"), "UPLOAD_ACK");
        assert_eq!(response_type_for("FROBNICATE"), "FROBNICATE_RESP");
    }

    #[test]
    fn failure_payload_should_carry_bad_request() {
        let bytes = failure_payload("FROBNICATE", "x7", code::BAD_REQUEST, "unknown request")
            .expect("payload");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["type"], "FROBNICATE_RESP");
        assert_eq!(value["reqId"], "x7");
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "BAD_REQUEST");
    }

    #[test]
    fn local_codes_should_never_reach_the_wire() {
        let body = error_body(&AppError::new(code::TIMEOUT, "deadline passed"));
        assert_eq!(body.code, code::INTERNAL_ERROR);
    }
}
