//! JSON-RPC endpoint of the `ps` service

use super::messages::*;
use super::service::PatternService;
use super::telemetry;
use crate::{Error, Result};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

fn decode_params<T: DeserializeOwned>(params: Vec<Value>) -> Result<T> {
    let first = params
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidArgument("missing params".to_string()))?;
    serde_json::from_value(first).map_err(|e| Error::InvalidArgument(e.to_string()))
}

fn outcome_of<R: RpcResponseBody>(response: &R) -> &'static str {
    let generic = response.generic();
    if generic.ignored {
        "ignored"
    } else if generic.error.is_some() {
        "error"
    } else {
        "ok"
    }
}

fn encode<R: RpcResponseBody>(response: R) -> Result<(Value, &'static str)> {
    let outcome = outcome_of(&response);
    Ok((serde_json::to_value(response)?, outcome))
}

/// Route a call to its responder. Returns the encoded response and its
/// outcome label.
async fn dispatch(
    service: &PatternService,
    method: &str,
    params: Vec<Value>,
) -> Result<(Value, &'static str)> {
    let name = method
        .strip_prefix(RPC_SERVICE_NAME)
        .and_then(|rest| rest.strip_prefix('.'))
        .ok_or_else(|| Error::InvalidArgument(format!("unknown service in '{}'", method)))?;

    match name {
        GET_SEEN_EVENT_PROPERTIES => {
            encode(service.get_seen_event_properties(decode_params(params)?).await?)
        }
        GET_SEEN_EVENT_PROPERTY_VALUES => {
            encode(service.get_seen_event_property_values(decode_params(params)?).await?)
        }
        GET_PROJECT_MODELS_INTERVALS => {
            encode(service.get_project_models_intervals(decode_params(params)?).await?)
        }
        GET_USER_AND_EVENTS_INFO => {
            encode(service.get_user_and_events_info(decode_params(params)?).await?)
        }
        GET_ALL_PATTERNS => encode(service.get_all_patterns(decode_params(params)?).await?),
        GET_ALL_CONTAINING_PATTERNS => {
            encode(service.get_all_containing_patterns(decode_params(params)?).await?)
        }
        GET_PATTERNS => encode(service.get_patterns(decode_params(params)?).await?),
        GET_TOTAL_EVENT_COUNT => {
            encode(service.get_total_event_count(decode_params(params)?).await?)
        }
        other => Err(Error::InvalidArgument(format!("unknown method '{}'", other))),
    }
}

/// `POST /rpc`
///
/// The body is decoded here rather than by an extractor so that a malformed
/// envelope is still answered with an envelope.
pub async fn handle_rpc(
    State(service): State<Arc<PatternService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<RpcResponse> {
    let started = Instant::now();
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(req_id = %request_id, error = %e, "Rejected malformed RPC envelope");
            telemetry::record_rpc_call("malformed", "rejected", started.elapsed().as_secs_f64());
            return Json(RpcResponse {
                result: None,
                error: Some(e.to_string()),
                id: Value::Null,
            });
        }
    };

    let result = dispatch(&service, &request.method, request.params).await;
    let elapsed = started.elapsed();

    let (response, outcome) = match result {
        Ok((value, outcome)) => (
            RpcResponse {
                result: Some(value),
                error: None,
                id: request.id,
            },
            outcome,
        ),
        Err(e) => {
            warn!(
                req_id = %request_id,
                method = %request.method,
                error = %e,
                "Rejected RPC call"
            );
            (
                RpcResponse {
                    result: None,
                    error: Some(e.to_string()),
                    id: request.id,
                },
                "rejected",
            )
        }
    };

    info!(
        req_id = %request_id,
        method = %request.method,
        outcome,
        latency_ms = elapsed.as_millis() as u64,
        "Handled RPC call"
    );
    telemetry::record_rpc_call(&request.method, outcome, elapsed.as_secs_f64());

    Json(response)
}

fn decode_request(body: &[u8]) -> Result<RpcRequest> {
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidArgument(format!("malformed request envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_must_be_present() {
        let err = decode_params::<GetProjectModelsIntervalsRequest>(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let request: GetProjectModelsIntervalsRequest =
            decode_params(vec![serde_json::json!({"pid": 3})]).unwrap();
        assert_eq!(request.project_id, 3);
    }

    #[test]
    fn test_malformed_envelope_is_invalid_argument() {
        let err = decode_request(b"{\"method\": ").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = decode_request(br#"{"params": []}"#).unwrap_err();
        assert!(err.to_string().contains("method"));

        let request = decode_request(br#"{"method": "ps.GetPatterns", "params": [{"pid": 1}], "id": 3}"#).unwrap();
        assert_eq!(request.method, "ps.GetPatterns");
        assert_eq!(request.id, serde_json::json!(3));
    }
}
