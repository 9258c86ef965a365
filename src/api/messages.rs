//! RPC message contract shared by the responders and the fan-out client
//!
//! Calls travel as JSON-RPC v1 style envelopes posted to [`RPC_ENDPOINT`]:
//! `{"method": "ps.<Method>", "params": [request], "id": ..}` answered by
//! `{"result": response, "error": null, "id": ..}`. Every response embeds the
//! generic `{pid, mid, ignored, error}` block.

use crate::metadata::ModelInterval;
use crate::schema::UserAndEventsInfo;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RPC_SERVICE_NAME: &str = "ps";
pub const RPC_ENDPOINT: &str = "/rpc";

/// Header carrying a caller-chosen request id, echoed into server logs
pub const REQUEST_ID_HEADER: &str = "x-req-id";

pub const GET_SEEN_EVENT_PROPERTIES: &str = "GetSeenEventProperties";
pub const GET_SEEN_EVENT_PROPERTY_VALUES: &str = "GetSeenEventPropertyValues";
pub const GET_PROJECT_MODELS_INTERVALS: &str = "GetProjectModelsIntervals";
pub const GET_USER_AND_EVENTS_INFO: &str = "GetUserAndEventsInfo";
pub const GET_ALL_PATTERNS: &str = "GetAllPatterns";
pub const GET_ALL_CONTAINING_PATTERNS: &str = "GetAllContainingPatterns";
pub const GET_PATTERNS: &str = "GetPatterns";
pub const GET_TOTAL_EVENT_COUNT: &str = "GetTotalEventCount";

/// Keys of the [`GetSeenEventPropertiesResponse::properties`] map
pub const NUMERICAL_PROPERTIES: &str = "numerical";
pub const CATEGORICAL_PROPERTIES: &str = "categorical";

/// Status block carried by every response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericRpcResponse {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default)]
    pub model_id: u64,
    /// True when the responding node does not own the key
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenericRpcResponse {
    /// Whether this response carries data worth merging
    pub fn is_useful(&self) -> bool {
        !self.ignored && self.error.is_none()
    }
}

/// Access to the status block of a typed response
pub trait RpcResponseBody: Serialize + DeserializeOwned + Default + Send + 'static {
    fn generic(&self) -> &GenericRpcResponse;
    fn generic_mut(&mut self) -> &mut GenericRpcResponse;
}

/// One procedure of the `ps` service
pub trait RpcMethod {
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: RpcResponseBody;

    /// Wire name, `ps.<Method>`
    fn qualified_name() -> String {
        format!("{}.{}", RPC_SERVICE_NAME, Self::NAME)
    }
}

macro_rules! response_body {
    ($ty:ty) => {
        impl RpcResponseBody for $ty {
            fn generic(&self) -> &GenericRpcResponse {
                &self.generic
            }

            fn generic_mut(&mut self) -> &mut GenericRpcResponse {
                &mut self.generic
            }
        }
    };
}

/// A model id of 0 (or none) asks for the project's latest model
pub fn requested_model(model_id: Option<u64>) -> Option<u64> {
    model_id.filter(|mid| *mid != 0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSeenEventPropertiesRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(rename = "en", default)]
    pub event_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSeenEventPropertiesResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    /// `numerical` and `categorical` property names of the event
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<String>>,
}

response_body!(GetSeenEventPropertiesResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSeenEventPropertyValuesRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(rename = "en", default)]
    pub event_name: String,
    #[serde(rename = "pn", default)]
    pub property_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSeenEventPropertyValuesResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    #[serde(default)]
    pub values: Vec<String>,
}

response_body!(GetSeenEventPropertyValuesResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProjectModelsIntervalsRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProjectModelsIntervalsResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    #[serde(default)]
    pub intervals: Vec<ModelInterval>,
}

response_body!(GetProjectModelsIntervalsResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserAndEventsInfoRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserAndEventsInfoResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    #[serde(rename = "uei", default)]
    pub user_and_events_info: UserAndEventsInfo,
}

response_body!(GetUserAndEventsInfoResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllPatternsRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    /// Only patterns starting with this event, when non-empty
    #[serde(rename = "se", default)]
    pub start_event: String,
    /// Only patterns ending with this event, when non-empty
    #[serde(rename = "ee", default)]
    pub end_event: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetAllPatternsResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    /// Raw pattern bodies
    #[serde(rename = "ps", default)]
    pub patterns: Vec<serde_json::Value>,
}

response_body!(GetAllPatternsResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAllContainingPatternsRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(rename = "en", default)]
    pub event_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetAllContainingPatternsResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    #[serde(rename = "ps", default)]
    pub patterns: Vec<serde_json::Value>,
}

response_body!(GetAllContainingPatternsResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPatternsRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    /// Event sequences to look up, each matched exactly
    #[serde(rename = "pe", default)]
    pub pattern_events: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPatternsResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    #[serde(rename = "ps", default)]
    pub patterns: Vec<serde_json::Value>,
}

response_body!(GetPatternsResponse);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTotalEventCountRequest {
    #[serde(rename = "pid", default)]
    pub project_id: u64,
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTotalEventCountResponse {
    #[serde(flatten)]
    pub generic: GenericRpcResponse,
    #[serde(rename = "tec", default)]
    pub total_event_count: u64,
}

response_body!(GetTotalEventCountResponse);

pub struct GetSeenEventProperties;
pub struct GetSeenEventPropertyValues;
pub struct GetProjectModelsIntervals;
pub struct GetUserAndEventsInfo;
pub struct GetAllPatterns;
pub struct GetAllContainingPatterns;
pub struct GetPatterns;
pub struct GetTotalEventCount;

impl RpcMethod for GetSeenEventProperties {
    const NAME: &'static str = GET_SEEN_EVENT_PROPERTIES;
    type Request = GetSeenEventPropertiesRequest;
    type Response = GetSeenEventPropertiesResponse;
}

impl RpcMethod for GetSeenEventPropertyValues {
    const NAME: &'static str = GET_SEEN_EVENT_PROPERTY_VALUES;
    type Request = GetSeenEventPropertyValuesRequest;
    type Response = GetSeenEventPropertyValuesResponse;
}

impl RpcMethod for GetProjectModelsIntervals {
    const NAME: &'static str = GET_PROJECT_MODELS_INTERVALS;
    type Request = GetProjectModelsIntervalsRequest;
    type Response = GetProjectModelsIntervalsResponse;
}

impl RpcMethod for GetUserAndEventsInfo {
    const NAME: &'static str = GET_USER_AND_EVENTS_INFO;
    type Request = GetUserAndEventsInfoRequest;
    type Response = GetUserAndEventsInfoResponse;
}

impl RpcMethod for GetAllPatterns {
    const NAME: &'static str = GET_ALL_PATTERNS;
    type Request = GetAllPatternsRequest;
    type Response = GetAllPatternsResponse;
}

impl RpcMethod for GetAllContainingPatterns {
    const NAME: &'static str = GET_ALL_CONTAINING_PATTERNS;
    type Request = GetAllContainingPatternsRequest;
    type Response = GetAllContainingPatternsResponse;
}

impl RpcMethod for GetPatterns {
    const NAME: &'static str = GET_PATTERNS;
    type Request = GetPatternsRequest;
    type Response = GetPatternsResponse;
}

impl RpcMethod for GetTotalEventCount {
    const NAME: &'static str = GET_TOTAL_EVENT_COUNT;
    type Request = GetTotalEventCountRequest;
    type Response = GetTotalEventCountResponse;
}

/// Request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    #[serde(default)]
    pub id: serde_json::Value,
}

impl RpcRequest {
    pub fn new<M: RpcMethod>(request: &M::Request, id: u64) -> serde_json::Result<Self> {
        Ok(Self {
            method: M::qualified_name(),
            params: vec![serde_json::to_value(request)?],
            id: serde_json::Value::from(id),
        })
    }
}

/// Response envelope. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub id: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let request = GetSeenEventPropertyValuesRequest {
            project_id: 5,
            model_id: None,
            event_name: "signup".to_string(),
            property_name: "plan".to_string(),
        };
        let envelope = RpcRequest::new::<GetSeenEventPropertyValues>(&request, 7).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "method": "ps.GetSeenEventPropertyValues",
                "params": [{"pid": 5, "en": "signup", "pn": "plan"}],
                "id": 7
            })
        );
    }

    #[test]
    fn test_generic_block_is_flattened() {
        let response = GetSeenEventPropertyValuesResponse {
            generic: GenericRpcResponse {
                project_id: 5,
                model_id: 9,
                ignored: false,
                error: None,
            },
            values: vec!["free".to_string()],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"pid": 5, "mid": 9, "ignored": false, "error": null, "values": ["free"]})
        );

        let back: GetSeenEventPropertyValuesResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_pattern_lookup_wire_format() {
        let request = GetPatternsRequest {
            project_id: 4,
            model_id: Some(2),
            pattern_events: vec![vec!["a".to_string(), "b".to_string()]],
        };
        let envelope = RpcRequest::new::<GetPatterns>(&request, 1).unwrap();
        assert_eq!(envelope.method, "ps.GetPatterns");
        assert_eq!(
            envelope.params[0],
            serde_json::json!({"pid": 4, "mid": 2, "pe": [["a", "b"]]})
        );

        let response: GetTotalEventCountResponse =
            serde_json::from_value(serde_json::json!({"pid": 4, "mid": 2, "ignored": false, "tec": 17}))
                .unwrap();
        assert_eq!(response.total_event_count, 17);
        assert!(response.generic.is_useful());
    }

    #[test]
    fn test_zero_model_id_means_latest() {
        assert_eq!(requested_model(None), None);
        assert_eq!(requested_model(Some(0)), None);
        assert_eq!(requested_model(Some(4)), Some(4));
    }

    #[test]
    fn test_ignored_and_errored_responses_are_not_useful() {
        let mut generic = GenericRpcResponse::default();
        assert!(generic.is_useful());
        generic.ignored = true;
        assert!(!generic.is_useful());
        generic.ignored = false;
        generic.error = Some("boom".to_string());
        assert!(!generic.is_useful());
    }
}
