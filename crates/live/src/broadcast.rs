// `POST /broadcast`: page lifecycle events pushed by the REST API.

use std::collections::HashSet;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use quire_common::protocol::events::RealtimeEvent;
use quire_common::types::DocumentKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::embeds::{apply_embed_changes, plan_embed_changes, PageMove};
use crate::error::{current_request_id, with_request_id_scope, ErrorCode, LiveError};
use crate::server::AppState;

pub const BROADCAST_SECRET_HEADER: &str = "x-broadcast-secret";

pub fn router() -> Router<AppState> {
    Router::new().route("/broadcast", post(broadcast))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub action: String,
    #[serde(default)]
    pub page_ids: Vec<Uuid>,
    /// The page the action is about. Defaults to the first of `pageIds`.
    #[serde(default)]
    pub page_id: Option<Uuid>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub descendant_ids: Vec<Uuid>,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub data: Value,
}

/// Page hierarchy ids some actions carry inside `data`.
#[derive(Debug, Default, Deserialize)]
struct HierarchyData {
    #[serde(default)]
    new_page_id: Option<Uuid>,
    #[serde(default)]
    old_parent_id: Option<Uuid>,
    #[serde(default)]
    new_parent_id: Option<Uuid>,
    #[serde(default)]
    deleted_page_ids: Vec<Uuid>,
}

impl BroadcastRequest {
    fn subject(&self) -> Option<Uuid> {
        self.page_id.or_else(|| self.page_ids.first().copied())
    }

    fn hierarchy(&self) -> HierarchyData {
        serde_json::from_value(self.data.clone()).unwrap_or_default()
    }

    /// Pages the event describes.
    fn event_pages(&self) -> Vec<Uuid> {
        unique(
            self.page_ids
                .iter()
                .copied()
                .chain(self.page_id)
                .chain(self.descendant_ids.iter().copied()),
        )
    }

    /// Pages whose connections hear about the event: the described pages
    /// plus parents and, for restores, the pages brought back.
    fn affected_pages(&self, hierarchy: &HierarchyData) -> Vec<Uuid> {
        let mut related: Vec<Uuid> = self.parent_id.into_iter().collect();
        match self.action.as_str() {
            "moved_internally" => {
                related.extend(hierarchy.new_parent_id);
                related.extend(hierarchy.old_parent_id);
            }
            "restored" => related.extend(hierarchy.deleted_page_ids.iter().copied()),
            _ => {}
        }
        unique(self.event_pages().into_iter().chain(related))
    }

    fn page_move(&self, hierarchy: &HierarchyData) -> PageMove {
        PageMove {
            page: self.subject(),
            parent: self.parent_id,
            old_parent: hierarchy.old_parent_id,
            new_parent: hierarchy.new_parent_id,
            new_page: hierarchy.new_page_id,
        }
    }
}

fn unique(pages: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    pages.into_iter().filter(|page| seen.insert(*page)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub success: bool,
    pub delivered: usize,
}

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    if expected.len() != provided.len() {
        return false;
    }
    expected.iter().zip(provided).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<BroadcastResponse>, LiveError> {
    let provided = headers
        .get(BROADCAST_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() || !secrets_match(&state.broadcast_secret, provided) {
        warn!("rejected broadcast with a missing or wrong secret");
        return Err(LiveError::new(ErrorCode::AuthInvalidToken, "invalid broadcast secret"));
    }

    let Json(request) = payload.map_err(|rejection| {
        LiveError::new(ErrorCode::ValidationFailed, "invalid broadcast payload")
            .with_details(json!({ "reason": rejection.body_text() }))
    })?;

    if request.action.trim().is_empty() {
        return Err(LiveError::new(ErrorCode::ValidationFailed, "action must not be empty"));
    }
    if request.page_ids.is_empty() && request.page_id.is_none() {
        return Err(LiveError::new(ErrorCode::ValidationFailed, "pageIds must not be empty"));
    }

    let hierarchy = request.hierarchy();
    let targets = request.affected_pages(&hierarchy);
    let changes = plan_embed_changes(&request.action, request.page_move(&hierarchy));

    let event = RealtimeEvent {
        action: request.action.clone(),
        page_ids: request.event_pages(),
        data: request.data,
        user_id: request.user_id,
    };

    let mut delivered = 0;
    for page_id in &targets {
        let key = DocumentKey::new(request.workspace_id, *page_id);
        delivered += state.registry.broadcast_event(key, event.clone()).await;
    }

    info!(
        action = %request.action,
        workspace_id = %request.workspace_id,
        pages = targets.len(),
        delivered,
        embed_changes = changes.len(),
        "realtime event broadcast"
    );

    // Parent documents may need loading first; the caller does not wait.
    if !changes.is_empty() {
        let registry = state.registry.clone();
        let workspace_id = request.workspace_id;
        let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
        tokio::spawn(with_request_id_scope(request_id, async move {
            apply_embed_changes(&registry, workspace_id, changes).await;
        }));
    }

    Ok(Json(BroadcastResponse { success: true, delivered }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::auth::entitlements::EntitlementStore;
    use crate::auth::jwt::TokenService;
    use crate::backplane::Backplane;
    use crate::config::SessionConfig;
    use crate::persistence::{DocumentStore, MemoryStore};
    use crate::server::build_router;
    use crate::embeds::{EmbedChange, EMBED_FRAGMENT, ENTITY_ATTR};
    use crate::session::{ClientHandle, Outbound, SessionRegistry};
    use quire_common::protocol::events::ServerEvent;
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};
    use yrs::{ReadTxn, Xml, XmlFragment, XmlOut};

    const SECRET: &str = "broadcast-secret";

    fn state() -> AppState {
        AppState::new(
            SessionRegistry::new(
                DocumentStore::Memory(MemoryStore::new()),
                Backplane::Disabled,
                SessionConfig::default(),
            ),
            TokenService::new("quire_test_secret_that_is_definitely_long_enough")
                .expect("token service"),
            EntitlementStore::permissive(),
            SECRET,
            1024,
        )
    }

    fn request(secret: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/broadcast")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(BROADCAST_SECRET_HEADER, secret);
        }
        builder.body(Body::from(body.to_string())).expect("broadcast request should build")
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        serde_json::from_slice(&body).expect("body should be json")
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let body = json!({ "action": "locked", "pageIds": [Uuid::new_v4()], "workspaceId": Uuid::new_v4() });
        for secret in [None, Some("nope")] {
            let response = build_router(state())
                .oneshot(request(secret, body.clone()))
                .await
                .expect("request should complete");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn empty_page_ids_fail_validation() {
        let body = json!({ "action": "locked", "pageIds": [], "workspaceId": Uuid::new_v4() });
        let response = build_router(state())
            .oneshot(request(Some(SECRET), body))
            .await
            .expect("request should complete");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn delivers_to_connected_pages() {
        let state = state();
        let workspace_id = Uuid::new_v4();
        let open_page = Uuid::new_v4();
        let (client, mut outbound) = ClientHandle::new(Uuid::new_v4());
        let _membership = state
            .registry
            .acquire(DocumentKey::new(workspace_id, open_page), client)
            .await
            .expect("acquire");

        let body = json!({
            "action": "archived",
            "pageIds": [open_page, Uuid::new_v4()],
            "workspaceId": workspace_id,
            "data": { "reason": "cleanup" },
        });
        let response = build_router(state.clone())
            .oneshot(request(Some(SECRET), body))
            .await
            .expect("request should complete");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "success": true, "delivered": 1 }));

        let Some(Outbound::Event(ServerEvent::Realtime(event))) = outbound.recv().await else {
            panic!("connected page should receive the event");
        };
        assert_eq!(event.action, "archived");
        assert_eq!(event.data["reason"], "cleanup");
    }

    async fn embeds_of(registry: &SessionRegistry, key: DocumentKey) -> Vec<Uuid> {
        registry
            .transact(key, |txn| {
                let Some(root) = txn.get_xml_fragment(EMBED_FRAGMENT) else {
                    return Vec::new();
                };
                (0..root.len(&*txn))
                    .filter_map(|index| match root.get(&*txn, index) {
                        Some(XmlOut::Element(embed)) => embed.get_attribute(&*txn, ENTITY_ATTR),
                        _ => None,
                    })
                    .filter_map(|page| page.parse::<Uuid>().ok())
                    .collect::<Vec<_>>()
            })
            .await
            .expect("parent document should open")
    }

    async fn wait_for_embeds(registry: &SessionRegistry, key: DocumentKey, expected: &[Uuid]) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let embeds = embeds_of(registry, key).await;
            if embeds == expected {
                return;
            }
            assert!(Instant::now() < deadline, "embeds stayed {embeds:?}, expected {expected:?}");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn hierarchy_widens_delivery_beyond_described_pages() {
        let [page, child, parent, old, new, revived] = std::array::from_fn(|_| Uuid::new_v4());
        let moved: BroadcastRequest = serde_json::from_value(json!({
            "action": "moved_internally",
            "pageId": page,
            "descendantIds": [child, page],
            "parentId": parent,
            "workspaceId": Uuid::new_v4(),
            "data": { "old_parent_id": old, "new_parent_id": new },
        }))
        .expect("request should parse");
        assert_eq!(moved.event_pages(), vec![page, child]);
        assert_eq!(moved.affected_pages(&moved.hierarchy()), vec![page, child, parent, new, old]);

        let restored: BroadcastRequest = serde_json::from_value(json!({
            "action": "restored",
            "pageIds": [page],
            "workspaceId": Uuid::new_v4(),
            "data": { "deleted_page_ids": [revived], "old_parent_id": old },
        }))
        .expect("request should parse");
        assert_eq!(restored.affected_pages(&restored.hierarchy()), vec![page, revived]);
    }

    #[tokio::test]
    async fn sub_page_reaches_parent_and_adds_embed() {
        let state = state();
        let workspace_id = Uuid::new_v4();
        let (parent, child) = (Uuid::new_v4(), Uuid::new_v4());
        let parent_key = DocumentKey::new(workspace_id, parent);
        let (client, mut outbound) = ClientHandle::new(Uuid::new_v4());
        let _membership = state.registry.acquire(parent_key, client).await.expect("acquire");

        let body = json!({
            "action": "sub_page",
            "pageIds": [child],
            "parentId": parent,
            "workspaceId": workspace_id,
        });
        let response = build_router(state.clone())
            .oneshot(request(Some(SECRET), body))
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "success": true, "delivered": 1 }));

        let Ok(Some(Outbound::Event(ServerEvent::Realtime(event)))) =
            timeout(Duration::from_secs(2), outbound.recv()).await
        else {
            panic!("parent page should hear about its new sub-page");
        };
        assert_eq!(event.page_ids, vec![child]);

        wait_for_embeds(&state.registry, parent_key, &[child]).await;
        assert!(
            matches!(timeout(Duration::from_secs(2), outbound.recv()).await, Ok(Some(Outbound::Binary(_)))),
            "editor on the parent should receive the embed as an update"
        );
    }

    #[tokio::test]
    async fn internal_move_shifts_embed_between_parents() {
        let state = state();
        let workspace_id = Uuid::new_v4();
        let (old_parent, new_parent, page) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let old_key = DocumentKey::new(workspace_id, old_parent);
        let new_key = DocumentKey::new(workspace_id, new_parent);
        state
            .registry
            .transact(old_key, move |txn| {
                EmbedChange::Append { parent: old_parent, page }.apply(txn, workspace_id)
            })
            .await
            .expect("seed embed");

        let body = json!({
            "action": "moved_internally",
            "pageIds": [page],
            "workspaceId": workspace_id,
            "data": { "old_parent_id": old_parent, "new_parent_id": new_parent },
        });
        let response = build_router(state.clone())
            .oneshot(request(Some(SECRET), body))
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::OK);

        wait_for_embeds(&state.registry, old_key, &[]).await;
        wait_for_embeds(&state.registry, new_key, &[page]).await;
    }

    #[tokio::test]
    async fn deleted_page_leaves_parent() {
        let state = state();
        let workspace_id = Uuid::new_v4();
        let (parent, kept, deleted) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let parent_key = DocumentKey::new(workspace_id, parent);
        for page in [kept, deleted] {
            state
                .registry
                .transact(parent_key, move |txn| EmbedChange::Append { parent, page }.apply(txn, workspace_id))
                .await
                .expect("seed embed");
        }

        let body = json!({
            "action": "deleted",
            "pageId": deleted,
            "parentId": parent,
            "workspaceId": workspace_id,
        });
        let response = build_router(state.clone())
            .oneshot(request(Some(SECRET), body))
            .await
            .expect("request should complete");
        assert_eq!(response.status(), StatusCode::OK);

        wait_for_embeds(&state.registry, parent_key, &[kept]).await;
    }
}
