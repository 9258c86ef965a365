//! Ownership-aware responders
//!
//! Every call reads one node state snapshot, resolves the model, and answers
//! only if this node owns the key. Non-owners reply `ignored`. Store failures
//! are reported in the response's `error` field; only malformed requests
//! fail the call itself.

use super::messages::*;
use crate::cluster::{NodeState, NodeStateHandle, PartitionScheme};
use crate::schema::PatternWithMeta;
use crate::store::PatternStore;
use crate::{Error, Result};

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct PatternService {
    store: Arc<PatternStore>,
    state: NodeStateHandle,
}

/// A key this node has decided to answer for
struct Target {
    model_id: u64,
    chunks: Vec<String>,
}

fn require_project(project_id: u64) -> Result<()> {
    if project_id == 0 {
        return Err(Error::InvalidArgument("pid is required".to_string()));
    }
    Ok(())
}

fn require_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{} is required", field)));
    }
    Ok(())
}

impl PatternService {
    pub fn new(store: Arc<PatternStore>, state: NodeStateHandle) -> Self {
        Self { store, state }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn state(&self) -> &NodeStateHandle {
        &self.state
    }

    /// Resolve the model and decide ownership, filling in the status block.
    /// Returns `None` when the response is already complete (ignored, or no
    /// such model).
    fn resolve(
        &self,
        state: &NodeState,
        project_id: u64,
        model_id: Option<u64>,
        generic: &mut GenericRpcResponse,
    ) -> Option<Target> {
        generic.project_id = project_id;

        let resolved = match requested_model(model_id) {
            Some(mid) => state.catalog.model(project_id, mid).map(|data| (mid, data)),
            None => state.latest_model(project_id),
        };
        let model_id = resolved
            .map(|(mid, _)| mid)
            .or(requested_model(model_id))
            .unwrap_or_default();
        generic.model_id = model_id;

        if !state.is_servable(project_id, model_id) {
            debug!(project_id, model_id, ordinal = ?state.ordinal, "Key not owned, ignoring");
            generic.ignored = true;
            return None;
        }

        match resolved {
            Some((mid, data)) => Some(Target {
                model_id: mid,
                chunks: data.chunks.clone(),
            }),
            None => {
                generic.error = Some(format!(
                    "no model found for project {} (metadata version {})",
                    project_id, state.metadata_version
                ));
                None
            }
        }
    }

    pub async fn get_seen_event_properties(
        &self,
        request: GetSeenEventPropertiesRequest,
    ) -> Result<GetSeenEventPropertiesResponse> {
        require_project(request.project_id)?;
        require_name("en", &request.event_name)?;

        let state = self.state.snapshot();
        let mut response = GetSeenEventPropertiesResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        match self
            .store
            .get_event_info(request.project_id, target.model_id)
            .await
        {
            Ok(info) => {
                let event = info.event_properties(&request.event_name);
                response.properties.insert(
                    NUMERICAL_PROPERTIES.to_string(),
                    event.map(|p| p.numerical_keys()).unwrap_or_default(),
                );
                response.properties.insert(
                    CATEGORICAL_PROPERTIES.to_string(),
                    event.map(|p| p.categorical_keys()).unwrap_or_default(),
                );
            }
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }

    pub async fn get_seen_event_property_values(
        &self,
        request: GetSeenEventPropertyValuesRequest,
    ) -> Result<GetSeenEventPropertyValuesResponse> {
        require_project(request.project_id)?;
        require_name("en", &request.event_name)?;
        require_name("pn", &request.property_name)?;

        let state = self.state.snapshot();
        let mut response = GetSeenEventPropertyValuesResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        match self
            .store
            .get_event_info(request.project_id, target.model_id)
            .await
        {
            Ok(info) => {
                response.values = info
                    .event_properties(&request.event_name)
                    .and_then(|p| p.categorical_values(&request.property_name))
                    .unwrap_or_default();
            }
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }

    /// Intervals of the project's models this node owns. Under the project
    /// scheme that is all of them or none.
    pub async fn get_project_models_intervals(
        &self,
        request: GetProjectModelsIntervalsRequest,
    ) -> Result<GetProjectModelsIntervalsResponse> {
        require_project(request.project_id)?;

        let state = self.state.snapshot();
        let assignment = state.assignment();
        let mut response = GetProjectModelsIntervalsResponse::default();
        response.generic.project_id = request.project_id;

        response.intervals = match state.scheme {
            PartitionScheme::Project => {
                if !assignment.is_servable(request.project_id, 0) {
                    response.generic.ignored = true;
                    return Ok(response);
                }
                state.catalog.intervals(request.project_id)
            }
            PartitionScheme::ProjectModel => {
                let owned: Vec<_> = state
                    .catalog
                    .intervals(request.project_id)
                    .into_iter()
                    .filter(|interval| assignment.is_servable(request.project_id, interval.model_id))
                    .collect();
                if owned.is_empty() {
                    response.generic.ignored = true;
                }
                owned
            }
        };
        Ok(response)
    }

    pub async fn get_user_and_events_info(
        &self,
        request: GetUserAndEventsInfoRequest,
    ) -> Result<GetUserAndEventsInfoResponse> {
        require_project(request.project_id)?;

        let state = self.state.snapshot();
        let mut response = GetUserAndEventsInfoResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        match self
            .store
            .get_event_info(request.project_id, target.model_id)
            .await
        {
            Ok(info) => response.user_and_events_info = info.as_ref().clone(),
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }

    /// Walk the patterns of every chunk of the target model
    async fn scan_patterns<F>(&self, project_id: u64, target: &Target, mut visit: F) -> Result<()>
    where
        F: FnMut(&PatternWithMeta),
    {
        for chunk_id in &target.chunks {
            let patterns = self
                .store
                .get_patterns(project_id, target.model_id, chunk_id)
                .await?;
            patterns.iter().for_each(&mut visit);
        }
        Ok(())
    }

    /// Patterns of every chunk of the model, filtered by start/end event
    pub async fn get_all_patterns(
        &self,
        request: GetAllPatternsRequest,
    ) -> Result<GetAllPatternsResponse> {
        require_project(request.project_id)?;

        let state = self.state.snapshot();
        let mut response = GetAllPatternsResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        let mut patterns = Vec::new();
        let scanned = self
            .scan_patterns(request.project_id, &target, |p| {
                if p.matches(&request.start_event, &request.end_event) {
                    patterns.push(p.raw_pattern.clone());
                }
            })
            .await;
        match scanned {
            Ok(()) => response.patterns = patterns,
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }

    /// Patterns whose event sequence includes `en` anywhere
    pub async fn get_all_containing_patterns(
        &self,
        request: GetAllContainingPatternsRequest,
    ) -> Result<GetAllContainingPatternsResponse> {
        require_project(request.project_id)?;
        require_name("en", &request.event_name)?;

        let state = self.state.snapshot();
        let mut response = GetAllContainingPatternsResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        let mut patterns = Vec::new();
        let scanned = self
            .scan_patterns(request.project_id, &target, |p| {
                if p.contains_event(&request.event_name) {
                    patterns.push(p.raw_pattern.clone());
                }
            })
            .await;
        match scanned {
            Ok(()) => response.patterns = patterns,
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }

    /// Exact lookup of the requested event sequences
    pub async fn get_patterns(&self, request: GetPatternsRequest) -> Result<GetPatternsResponse> {
        require_project(request.project_id)?;
        if request.pattern_events.is_empty() {
            return Err(Error::InvalidArgument("pe is required".to_string()));
        }

        let state = self.state.snapshot();
        let mut response = GetPatternsResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        let wanted: HashSet<&[String]> = request
            .pattern_events
            .iter()
            .map(Vec::as_slice)
            .collect();
        let mut patterns = Vec::new();
        let scanned = self
            .scan_patterns(request.project_id, &target, |p| {
                if wanted.contains(p.pattern_events.as_slice()) {
                    patterns.push(p.raw_pattern.clone());
                }
            })
            .await;
        match scanned {
            Ok(()) => response.patterns = patterns,
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }

    /// Sum of the occurrence counts of the model's single-event patterns
    pub async fn get_total_event_count(
        &self,
        request: GetTotalEventCountRequest,
    ) -> Result<GetTotalEventCountResponse> {
        require_project(request.project_id)?;

        let state = self.state.snapshot();
        let mut response = GetTotalEventCountResponse::default();
        let Some(target) = self.resolve(
            &state,
            request.project_id,
            request.model_id,
            &mut response.generic,
        ) else {
            return Ok(response);
        };

        let mut total = 0u64;
        let scanned = self
            .scan_patterns(request.project_id, &target, |p| {
                if p.pattern_events.len() == 1 {
                    total += p.occurrence_count();
                }
            })
            .await;
        match scanned {
            Ok(()) => response.total_event_count = total,
            Err(e) => response.generic.error = Some(e.to_string()),
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeIdentity;
    use crate::config::ProjectSelection;
    use crate::metadata::{ProjectCatalog, ProjectModelMetadata};
    use crate::schema::{PropertiesInfo, UserAndEventsInfo};
    use crate::store::{CloudRouting, StoreConfig};
    use object_store::memory::InMemory;
    use std::collections::BTreeMap;

    fn catalog() -> ProjectCatalog {
        let record = |pid, mid, end| ProjectModelMetadata {
            project_id: pid,
            model_id: mid,
            model_type: "w".to_string(),
            chunks: "1,2".to_string(),
            start_time: 0,
            end_time: end,
        };
        ProjectCatalog::from_records(
            vec![record(4, 1, 10), record(4, 2, 20), record(5, 1, 10)],
            &ProjectSelection::All,
        )
    }

    fn service_for(me: &str, peers: &[&str]) -> PatternService {
        let store = PatternStore::new(
            Arc::new(InMemory::new()),
            CloudRouting::new(Arc::new(InMemory::new())),
            StoreConfig::default(),
        );
        let state = NodeState::new(
            me.parse::<NodeIdentity>().unwrap(),
            PartitionScheme::Project,
            peers.iter().map(|p| p.parse().unwrap()).collect(),
            "version1",
            Arc::new(catalog()),
        );
        PatternService::new(Arc::new(store), NodeStateHandle::new(state))
    }

    fn event_info() -> UserAndEventsInfo {
        let mut categorical = BTreeMap::new();
        categorical.insert(
            "plan".to_string(),
            BTreeMap::from([("free".to_string(), true), ("pro".to_string(), true)]),
        );
        let signup = PropertiesInfo {
            numeric_property_keys: BTreeMap::from([("amount".to_string(), true)]),
            categorical_property_key_values: categorical,
        };
        UserAndEventsInfo {
            user_properties_info: None,
            event_properties_info_map: Some(BTreeMap::from([("signup".to_string(), signup)])),
            model_version: 1,
        }
    }

    #[tokio::test]
    async fn test_missing_arguments_are_rejected() {
        let service = service_for("n1:8100", &["n1:8100"]);
        let err = service
            .get_seen_event_properties(GetSeenEventPropertiesRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = service
            .get_seen_event_property_values(GetSeenEventPropertyValuesRequest {
                project_id: 4,
                event_name: "signup".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_non_owner_ignores() {
        // pid 5 mod 2 == 1, owned by n2.
        let service = service_for("n1:8100", &["n1:8100", "n2:8100"]);
        let response = service
            .get_seen_event_properties(GetSeenEventPropertiesRequest {
                project_id: 5,
                model_id: None,
                event_name: "signup".to_string(),
            })
            .await
            .unwrap();

        assert!(response.generic.ignored);
        assert!(response.generic.error.is_none());
        assert!(response.properties.is_empty());
    }

    #[tokio::test]
    async fn test_owner_answers_from_latest_model() {
        let service = service_for("n1:8100", &["n1:8100", "n2:8100"]);
        service
            .store()
            .put_event_info_cloud(4, 2, &event_info())
            .await
            .unwrap();

        let response = service
            .get_seen_event_properties(GetSeenEventPropertiesRequest {
                project_id: 4,
                model_id: Some(0),
                event_name: "signup".to_string(),
            })
            .await
            .unwrap();

        assert!(response.generic.is_useful());
        assert_eq!(response.generic.model_id, 2);
        assert_eq!(response.properties[NUMERICAL_PROPERTIES], vec!["amount"]);
        assert_eq!(response.properties[CATEGORICAL_PROPERTIES], vec!["plan"]);

        let values = service
            .get_seen_event_property_values(GetSeenEventPropertyValuesRequest {
                project_id: 4,
                model_id: None,
                event_name: "signup".to_string(),
                property_name: "plan".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(values.values, vec!["free", "pro"]);
    }

    #[tokio::test]
    async fn test_store_miss_becomes_response_error() {
        let service = service_for("n1:8100", &["n1:8100"]);
        let response = service
            .get_user_and_events_info(GetUserAndEventsInfoRequest {
                project_id: 4,
                model_id: Some(1),
            })
            .await
            .unwrap();

        assert!(!response.generic.ignored);
        assert!(response.generic.error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_project_is_an_error_only_on_the_owner() {
        let owner = service_for("n1:8100", &["n1:8100", "n2:8100"]);
        let other = service_for("n2:8100", &["n1:8100", "n2:8100"]);
        let request = GetUserAndEventsInfoRequest {
            project_id: 8,
            model_id: None,
        };

        let response = owner.get_user_and_events_info(request.clone()).await.unwrap();
        assert!(response.generic.error.is_some());

        let response = other.get_user_and_events_info(request).await.unwrap();
        assert!(response.generic.ignored);
        assert!(response.generic.error.is_none());
    }

    #[tokio::test]
    async fn test_intervals_for_owned_project() {
        let service = service_for("n1:8100", &["n1:8100"]);
        let response = service
            .get_project_models_intervals(GetProjectModelsIntervalsRequest { project_id: 4 })
            .await
            .unwrap();

        let mids: Vec<u64> = response.intervals.iter().map(|i| i.model_id).collect();
        assert_eq!(mids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_all_patterns_spans_chunks_and_filters() {
        let service = service_for("n1:8100", &["n1:8100"]);
        let pattern = |events: &[&str], n: u32| PatternWithMeta {
            pattern_events: events.iter().map(|e| e.to_string()).collect(),
            raw_pattern: serde_json::json!({ "n": n }),
        };
        let store = service.store();
        store
            .put_patterns_cloud(4, 2, "1", &[pattern(&["a", "b"], 1), pattern(&["b", "c"], 2)])
            .await
            .unwrap();
        store
            .put_patterns_cloud(4, 2, "2", &[pattern(&["a", "c"], 3)])
            .await
            .unwrap();

        let all = service
            .get_all_patterns(GetAllPatternsRequest {
                project_id: 4,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.patterns.len(), 3);

        let from_a = service
            .get_all_patterns(GetAllPatternsRequest {
                project_id: 4,
                start_event: "a".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            from_a.patterns,
            vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 3})]
        );
    }

    async fn seed_patterns(service: &PatternService) {
        let pattern = |events: &[&str], c: u64| PatternWithMeta {
            pattern_events: events.iter().map(|e| e.to_string()).collect(),
            raw_pattern: serde_json::json!({ "en": events, "c": c }),
        };
        let store = service.store();
        store
            .put_patterns_cloud(4, 2, "1", &[pattern(&["a"], 10), pattern(&["a", "b"], 4)])
            .await
            .unwrap();
        store
            .put_patterns_cloud(4, 2, "2", &[pattern(&["b"], 6), pattern(&["b", "c"], 2)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_containing_and_exact_pattern_lookups() {
        let service = service_for("n1:8100", &["n1:8100"]);
        seed_patterns(&service).await;

        let containing = service
            .get_all_containing_patterns(GetAllContainingPatternsRequest {
                project_id: 4,
                model_id: None,
                event_name: "b".to_string(),
            })
            .await
            .unwrap();
        let counts: Vec<u64> = containing.patterns.iter().map(|p| p["c"].as_u64().unwrap()).collect();
        assert_eq!(counts, vec![4, 6, 2]);

        let exact = service
            .get_patterns(GetPatternsRequest {
                project_id: 4,
                model_id: Some(2),
                pattern_events: vec![
                    vec!["b".to_string(), "c".to_string()],
                    vec!["c".to_string(), "b".to_string()],
                ],
            })
            .await
            .unwrap();
        assert_eq!(exact.patterns, vec![serde_json::json!({"en": ["b", "c"], "c": 2})]);

        let err = service
            .get_patterns(GetPatternsRequest {
                project_id: 4,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_total_event_count_sums_single_event_patterns() {
        let owner = service_for("n1:8100", &["n1:8100"]);
        seed_patterns(&owner).await;

        let response = owner
            .get_total_event_count(GetTotalEventCountRequest {
                project_id: 4,
                model_id: None,
            })
            .await
            .unwrap();
        assert!(response.generic.is_useful());
        assert_eq!(response.generic.model_id, 2);
        assert_eq!(response.total_event_count, 16);

        let non_owner = service_for("n2:8100", &["n1:8100", "n2:8100"]);
        let ignored = non_owner
            .get_total_event_count(GetTotalEventCountRequest {
                project_id: 4,
                model_id: None,
            })
            .await
            .unwrap();
        assert!(ignored.generic.ignored);
        assert_eq!(ignored.total_event_count, 0);
    }
}
