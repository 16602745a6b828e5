//! The remote authority structural changes are replayed against.

use serde_json::Value;

use super::types::{ChangeRequest, EntityType};
use crate::BoxFuture;
use crate::error::{Result, SyncError};

/// What the remote answered for an accepted change.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAck {
    /// Id of the entity on the server. Differs from the request's id when a
    /// create with a temporary id was assigned a real one.
    pub id: String,
    /// The entity as the server now stores it, when returned
    pub entity: Option<Value>,
}

/// Authoritative store for folders, document metadata and workspaces.
///
/// Errors follow the [`SyncError`](crate::SyncError) taxonomy: network
/// failures, timeouts and 5xx/408/429 responses are transient, any other
/// rejection is permanent.
pub trait RemoteAuthority: Send + Sync {
    /// Apply one change.
    fn apply<'a>(&'a self, change: &'a ChangeRequest) -> BoxFuture<'a, Result<RemoteAck>>;

    /// Fetch every entity of `entity_type` in a workspace.
    fn list<'a>(
        &'a self,
        entity_type: EntityType,
        workspace_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Value>>>;

    /// Whether there is a remote to talk to at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Stand-in used when no API endpoint is configured. Changes stay queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredRemote;

impl RemoteAuthority for UnconfiguredRemote {
    fn apply<'a>(&'a self, _change: &'a ChangeRequest) -> BoxFuture<'a, Result<RemoteAck>> {
        Box::pin(async { Err(SyncError::Network("no remote API configured".to_string())) })
    }

    fn list<'a>(
        &'a self,
        _entity_type: EntityType,
        _workspace_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async { Err(SyncError::Network("no remote API configured".to_string())) })
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use http::HttpRemoteAuthority;

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
mod http {
    use std::time::Duration;

    use reqwest::{Client, Method, RequestBuilder, Response};
    use serde_json::Value;

    use super::{RemoteAck, RemoteAuthority};
    use crate::BoxFuture;
    use crate::error::{Result, SyncError};
    use crate::queue::types::{ChangeOperation, ChangeRequest, EntityType};

    /// REST client for the MDReader API (`/api/v1/...`).
    ///
    /// A folder update whose body carries `parent_id` is a move and goes to
    /// `PATCH /api/v1/folders/{id}/move`.
    #[derive(Debug, Clone)]
    pub struct HttpRemoteAuthority {
        client: Client,
        base_url: String,
        token: Option<String>,
        timeout: Duration,
    }

    impl HttpRemoteAuthority {
        /// Client for the API at `base_url`, authenticating with `token`.
        pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
            Self {
                client: Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                token,
                timeout,
            }
        }

        fn collection(entity_type: EntityType) -> &'static str {
            match entity_type {
                EntityType::Folder => "folders",
                EntityType::Document => "documents",
                EntityType::Workspace => "workspaces",
            }
        }

        fn request(&self, method: Method, path: &str) -> RequestBuilder {
            let url = format!("{}/api/v1/{}", self.base_url, path);
            let builder = self.client.request(method, url).timeout(self.timeout);
            match &self.token {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            }
        }

        fn route(&self, change: &ChangeRequest) -> RequestBuilder {
            let collection = Self::collection(change.entity_type);
            let id = &change.entity_id;
            let scoped = change.entity_type != EntityType::Workspace;

            let builder = match change.operation {
                ChangeOperation::Create => self.request(Method::POST, collection).json(&change.data),
                ChangeOperation::Update => {
                    let is_move = change.entity_type == EntityType::Folder
                        && change.data.get("parent_id").is_some();
                    let path = if is_move {
                        format!("{}/{}/move", collection, id)
                    } else {
                        format!("{}/{}", collection, id)
                    };
                    self.request(Method::PATCH, &path).json(&change.data)
                }
                ChangeOperation::Delete => {
                    self.request(Method::DELETE, &format!("{}/{}", collection, id))
                }
            };
            if scoped {
                builder.query(&[("workspace_id", &change.workspace_id)])
            } else {
                builder
            }
        }

        async fn send(&self, builder: RequestBuilder) -> Result<Response> {
            let response = builder.send().await.map_err(|e| self.transport_error(e))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            Err(SyncError::Rejected {
                status: status.as_u16(),
                message,
            })
        }

        fn transport_error(&self, e: reqwest::Error) -> SyncError {
            if e.is_timeout() {
                SyncError::Timeout(self.timeout.as_millis() as u64)
            } else {
                SyncError::Network(e.to_string())
            }
        }
    }

    impl RemoteAuthority for HttpRemoteAuthority {
        fn apply<'a>(&'a self, change: &'a ChangeRequest) -> BoxFuture<'a, Result<RemoteAck>> {
            Box::pin(async move {
                let response = self.send(self.route(change)).await?;
                log::debug!(
                    "[RemoteAuthority] {} {} {} -> {}",
                    change.operation,
                    change.entity_type,
                    change.entity_id,
                    response.status()
                );

                if change.operation == ChangeOperation::Delete {
                    return Ok(RemoteAck {
                        id: change.entity_id.clone(),
                        entity: None,
                    });
                }
                let body: Value = response.json().await.map_err(|e| self.transport_error(e))?;
                let id = body
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| change.entity_id.clone());
                Ok(RemoteAck {
                    id,
                    entity: Some(body),
                })
            })
        }

        fn list<'a>(
            &'a self,
            entity_type: EntityType,
            workspace_id: &'a str,
        ) -> BoxFuture<'a, Result<Vec<Value>>> {
            Box::pin(async move {
                let path = format!("{}/workspace/{}", Self::collection(entity_type), workspace_id);
                let response = self.send(self.request(Method::GET, &path)).await?;
                let body: Value = response.json().await.map_err(|e| self.transport_error(e))?;
                // List endpoints answer `{ items, total }`
                let items = match body {
                    Value::Object(mut map) => map.remove("items").unwrap_or(Value::Null),
                    other => other,
                };
                match items {
                    Value::Array(items) => Ok(items),
                    _ => Err(SyncError::Network(format!(
                        "unexpected {} list response",
                        entity_type
                    ))),
                }
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        fn authority() -> HttpRemoteAuthority {
            HttpRemoteAuthority::new(
                "https://api.test/",
                Some("tok".into()),
                Duration::from_secs(1),
            )
        }

        fn route(change: ChangeRequest) -> (Method, String) {
            let request = authority().route(&change).build().unwrap();
            (request.method().clone(), request.url().to_string())
        }

        #[test]
        fn test_folder_routes() {
            let create = ChangeRequest::new(
                EntityType::Folder,
                "temp-folder-a",
                "ws1",
                ChangeOperation::Create,
                json!({"name": "A"}),
            );
            assert_eq!(
                route(create),
                (
                    Method::POST,
                    "https://api.test/api/v1/folders?workspace_id=ws1".to_string()
                )
            );

            let rename = ChangeRequest::new(
                EntityType::Folder,
                "f1",
                "ws1",
                ChangeOperation::Update,
                json!({"name": "B"}),
            );
            assert_eq!(
                route(rename),
                (
                    Method::PATCH,
                    "https://api.test/api/v1/folders/f1?workspace_id=ws1".to_string()
                )
            );

            let moved = ChangeRequest::new(
                EntityType::Folder,
                "f1",
                "ws1",
                ChangeOperation::Update,
                json!({"parent_id": null, "position": 2}),
            );
            assert_eq!(
                route(moved).1,
                "https://api.test/api/v1/folders/f1/move?workspace_id=ws1"
            );

            let delete = ChangeRequest::new(
                EntityType::Folder,
                "f1",
                "ws1",
                ChangeOperation::Delete,
                Value::Null,
            );
            assert_eq!(route(delete).0, Method::DELETE);
        }

        #[test]
        fn test_workspace_routes_are_not_scoped() {
            let update = ChangeRequest::new(
                EntityType::Workspace,
                "ws1",
                "ws1",
                ChangeOperation::Update,
                json!({"name": "Team"}),
            );
            assert_eq!(
                route(update).1,
                "https://api.test/api/v1/workspaces/ws1"
            );
        }

        #[test]
        fn test_bearer_token_is_sent() {
            let change = ChangeRequest::new(
                EntityType::Document,
                "d1",
                "ws1",
                ChangeOperation::Delete,
                Value::Null,
            );
            let request = authority().route(&change).build().unwrap();
            assert_eq!(
                request.headers()["authorization"].to_str().unwrap(),
                "Bearer tok"
            );
        }
    }
}
