//! JSON-RPC framing of [`MethodCall`]s inside encrypted envelopes.
//!
//! Decoding is strict: a missing or mistyped required field fails with
//! [`Error::InvalidPayload`], carrying the request id whenever one could be read
//! so the caller can still answer the peer. Only `chainId`, `accounts`,
//! `message` and peer metadata are optional.

use crate::crypto::{self, EncryptedPayload};
use crate::types::{
    EXCHANGE_KEY_METHOD, JSONRPC_VERSION, PROTOCOL_METHOD_PREFIX, SEND_TRANSACTION_METHOD,
    SESSION_REQUEST_METHOD, SESSION_UPDATE_METHOD, SIGN_MESSAGE_METHOD,
};
use crate::{
    Error, MethodCall, PeerData, PeerMeta, Result, RpcError, SessionKey, SessionParams,
    TransactionRequest,
};
use serde_json::{json, Map, Value};

/// Decrypts an envelope received from the transport and decodes the call inside.
pub fn parse(payload: &str, key: &SessionKey) -> Result<MethodCall> {
    let envelope: EncryptedPayload =
        serde_json::from_str(payload).map_err(|e| Error::Decode(format!("envelope: {}", e)))?;
    let plaintext = crypto::decrypt(&envelope, key)?;
    let value: Value =
        serde_json::from_slice(&plaintext).map_err(|e| Error::Decode(format!("plaintext: {}", e)))?;
    from_json(&value)
}

/// Encodes a call and encrypts it into the envelope handed to the transport.
pub fn prepare(call: &MethodCall, key: &SessionKey) -> Result<String> {
    let plaintext = serde_json::to_vec(&to_json(call))?;
    let envelope = crypto::encrypt(&plaintext, key)?;
    Ok(serde_json::to_string(&envelope)?)
}

pub fn from_json(value: &Value) -> Result<MethodCall> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::invalid_payload(None, "payload is not an object"))?;
    let id = obj.get("id").and_then(parse_id);

    let method = match obj.get("method") {
        None | Some(Value::Null) => {
            let id = id.ok_or_else(|| Error::invalid_payload(None, "id missing"))?;
            return to_response(id, obj);
        }
        Some(Value::String(method)) => method,
        Some(_) => return Err(Error::invalid_payload(id, "method must be a string")),
    };
    let id = id.ok_or_else(|| Error::invalid_payload(None, "id missing"))?;

    match method.as_str() {
        SESSION_REQUEST_METHOD => Ok(MethodCall::SessionRequest {
            id,
            peer: peer_data(first_param(obj, id)?, id)?,
        }),
        SESSION_UPDATE_METHOD => Ok(MethodCall::SessionUpdate {
            id,
            params: session_params(first_param(obj, id)?, id)?,
        }),
        EXCHANGE_KEY_METHOD => {
            let data = first_param(obj, id)?;
            let next_key = data
                .get("nextKey")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::invalid_payload(Some(id), "nextKey missing"))?;
            let next_key = SessionKey::from_hex(next_key)
                .map_err(|e| Error::invalid_payload(Some(id), format!("nextKey: {}", e)))?;
            Ok(MethodCall::ExchangeKey {
                id,
                next_key,
                peer: peer_data(data, id)?,
            })
        }
        SEND_TRANSACTION_METHOD => {
            let data = first_param(obj, id)?;
            let transaction: TransactionRequest = serde_json::from_value(Value::Object(data.clone()))
                .map_err(|e| Error::invalid_payload(Some(id), format!("transaction: {}", e)))?;
            Ok(MethodCall::SendTransaction { id, transaction })
        }
        SIGN_MESSAGE_METHOD => {
            let params = params_array(obj, id)?;
            let string_at = |index: usize, name: &str| {
                params
                    .get(index)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::invalid_payload(Some(id), format!("{} missing", name)))
            };
            Ok(MethodCall::SignMessage {
                id,
                address: string_at(0, "address")?,
                message: string_at(1, "message")?,
            })
        }
        other if other.starts_with(PROTOCOL_METHOD_PREFIX) => Err(Error::UnsupportedMethod {
            id,
            method: other.to_string(),
        }),
        other => Ok(MethodCall::Custom {
            id,
            method: other.to_string(),
            params: obj.get("params").cloned(),
        }),
    }
}

pub fn to_json(call: &MethodCall) -> Value {
    match call {
        MethodCall::SessionRequest { id, peer } => {
            json_rpc(*id, SESSION_REQUEST_METHOD, Some(json!([peer_json(peer, Map::new())])))
        }
        MethodCall::SessionUpdate { id, params } => {
            json_rpc(*id, SESSION_UPDATE_METHOD, Some(json!([session_params_json(params)])))
        }
        MethodCall::ExchangeKey { id, next_key, peer } => {
            let mut data = Map::new();
            data.insert("nextKey".to_string(), Value::String(next_key.to_hex()));
            json_rpc(*id, EXCHANGE_KEY_METHOD, Some(json!([peer_json(peer, data)])))
        }
        MethodCall::SendTransaction { id, transaction } => json_rpc(
            *id,
            SEND_TRANSACTION_METHOD,
            Some(json!([{
                "from": transaction.from,
                "to": transaction.to,
                "nonce": transaction.nonce,
                "gasPrice": transaction.gas_price,
                "gasLimit": transaction.gas_limit,
                "value": transaction.value,
                "data": transaction.data,
            }])),
        ),
        MethodCall::SignMessage {
            id,
            address,
            message,
        } => json_rpc(*id, SIGN_MESSAGE_METHOD, Some(json!([address, message]))),
        MethodCall::Custom { id, method, params } => json_rpc(*id, method, params.clone()),
        MethodCall::Response { id, result, error } => {
            let mut obj = Map::new();
            obj.insert("id".to_string(), json!(id));
            obj.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
            if let Some(result) = result {
                obj.insert("result".to_string(), result.clone());
            }
            if let Some(error) = error {
                obj.insert(
                    "error".to_string(),
                    json!({ "code": error.code, "message": error.message }),
                );
            }
            Value::Object(obj)
        }
    }
}

/// Result body of an approved or rejected session request.
pub fn session_params_json(params: &SessionParams) -> Value {
    json!({
        "approved": params.approved,
        "chainId": params.chain_id,
        "accounts": params.accounts,
        "message": params.message,
    })
}

pub fn peer_json(peer: &PeerData, mut into: Map<String, Value>) -> Value {
    into.insert("peerId".to_string(), Value::String(peer.id.clone()));
    if let Some(meta) = &peer.meta {
        into.insert(
            "peerMeta".to_string(),
            serde_json::to_value(meta).unwrap_or(Value::Null),
        );
    }
    Value::Object(into)
}

fn json_rpc(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("id".to_string(), json!(id));
    obj.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
    obj.insert("method".to_string(), json!(method));
    if let Some(params) = params {
        obj.insert("params".to_string(), params);
    }
    Value::Object(obj)
}

/// Ids arrive as JSON numbers; integral floats are accepted since some peers send them.
fn parse_id(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

fn params_array(obj: &Map<String, Value>, id: u64) -> Result<&Vec<Value>> {
    obj.get("params")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::invalid_payload(Some(id), "params missing"))
}

fn first_param(obj: &Map<String, Value>, id: u64) -> Result<&Map<String, Value>> {
    params_array(obj, id)?
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| Error::invalid_payload(Some(id), "invalid params"))
}

fn peer_data(data: &Map<String, Value>, id: u64) -> Result<PeerData> {
    let peer_id = data
        .get("peerId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_payload(Some(id), "peerId missing"))?;
    let meta = match data.get("peerMeta") {
        None | Some(Value::Null) => None,
        Some(meta @ Value::Object(_)) => Some(
            serde_json::from_value::<PeerMeta>(meta.clone())
                .map_err(|e| Error::invalid_payload(Some(id), format!("peerMeta: {}", e)))?,
        ),
        Some(_) => return Err(Error::invalid_payload(Some(id), "peerMeta must be an object")),
    };
    Ok(PeerData {
        id: peer_id.to_string(),
        meta,
    })
}

fn session_params(data: &Map<String, Value>, id: u64) -> Result<SessionParams> {
    let approved = data
        .get("approved")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::invalid_payload(Some(id), "approved missing"))?;
    let accounts = data.get("accounts").and_then(Value::as_array).and_then(|list| {
        list.iter()
            .map(|a| a.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
    });
    Ok(SessionParams {
        approved,
        chain_id: data.get("chainId").and_then(parse_id),
        accounts,
        message: data.get("message").and_then(Value::as_str).map(str::to_string),
    })
}

fn to_response(id: u64, obj: &Map<String, Value>) -> Result<MethodCall> {
    let result = obj.get("result").filter(|r| !r.is_null()).cloned();
    let error = match obj.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::Object(error)) => Some(RpcError {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        }),
        Some(_) => return Err(Error::invalid_payload(Some(id), "error must be an object")),
    };
    if result.is_none() && error.is_none() {
        return Err(Error::invalid_payload(Some(id), "no result or error"));
    }
    Ok(MethodCall::Response { id, result, error })
}
