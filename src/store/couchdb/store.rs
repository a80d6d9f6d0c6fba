use std::{sync::Arc, time::Duration};

use futures::{StreamExt, future::BoxFuture};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::store::{
    ChangeEvent, ChangeStream, EntityKind, RemoteStore,
    error::StoreResult,
};

use super::{
    config::CouchConfig,
    error::{CouchResult, CouchStoreError},
};

/// Separator replacing `/` inside CouchDB document ids.
const ID_SEPARATOR: &str = "::";
/// High sentinel closing a prefix range in `_all_docs` queries.
const END_SUFFIX: &str = "\u{ffff}";
/// Longpoll timeout requested from the `_changes` feed.
const CHANGES_TIMEOUT_MS: u64 = 30_000;
/// Pause before retrying a failed `_changes` poll.
const CHANGES_RETRY_DELAY: Duration = Duration::from_secs(5);

/// CouchDB-backed [`RemoteStore`].
///
/// Each logical path maps to one document whose `_id` is the path with `/`
/// replaced by `::` and whose payload lives under a `value` field. Interior
/// reads reassemble the collection from a `_all_docs` prefix range, and the
/// subscription channel polls the `_changes` longpoll feed.
#[derive(Clone)]
pub struct CouchStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
struct CouchDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none", default)]
    rev: Option<String>,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    #[serde(default)]
    doc: Option<CouchDocument>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
}

fn doc_id(path: &str) -> String {
    path.replace('/', ID_SEPARATOR)
}

fn doc_path(doc_id: &str) -> String {
    doc_id.replace(ID_SEPARATOR, "/")
}

impl CouchStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchStoreError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn request(&self, method: Method, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, endpoint);
        let builder = self.client.request(method, url);
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = format!("{}/{}", self.base_url, self.database);
        let mut builder = self.client.get(&url);
        if let Some((ref user, ref pass)) = self.auth {
            builder = builder.basic_auth(user.as_ref(), Some(pass.as_ref()));
        }

        let response = builder
            .send()
            .await
            .map_err(|source| CouchStoreError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let mut builder = self.client.put(&url);
                if let Some((ref user, ref pass)) = self.auth {
                    builder = builder.basic_auth(user.as_ref(), Some(pass.as_ref()));
                }
                let create =
                    builder
                        .send()
                        .await
                        .map_err(|source| CouchStoreError::DatabaseCreate {
                            database: database.clone(),
                            source,
                        })?;
                if create.status().is_success() {
                    Ok(())
                } else {
                    Err(CouchStoreError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchStoreError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document(&self, doc_id: &str) -> CouchResult<Option<CouchDocument>> {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchStoreError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<CouchDocument>()
                .await
                .map(Some)
                .map_err(|source| CouchStoreError::DecodeResponse {
                    path: doc_id.to_string(),
                    source,
                }),
            other => Err(CouchStoreError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document(&self, document: &CouchDocument) -> CouchResult<()> {
        let response = self
            .request(Method::PUT, &document.id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchStoreError::RequestSend {
                path: document.id.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchStoreError::RequestStatus {
                path: document.id.clone(),
                status: response.status(),
            })
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchStoreError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            other => Err(CouchStoreError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn list_documents(&self, prefix: &str) -> CouchResult<Vec<CouchDocument>> {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{prefix}\"")),
            ("endkey", format!("\"{prefix}{END_SUFFIX}\"")),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchStoreError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchStoreError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchStoreError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        Ok(payload.rows.into_iter().filter_map(|row| row.doc).collect())
    }

    async fn poll_changes(&self, since: &str) -> CouchResult<(String, Vec<String>)> {
        const CHANGES: &str = "_changes";
        let query = [
            ("feed", "longpoll".to_string()),
            ("since", since.to_string()),
            ("timeout", CHANGES_TIMEOUT_MS.to_string()),
        ];

        let response = self
            .request(Method::GET, CHANGES)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchStoreError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchStoreError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<ChangesResponse>().await.map_err(|source| {
            CouchStoreError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            }
        })?;

        let last_seq = match payload.last_seq {
            Value::String(seq) => seq,
            other => other.to_string(),
        };
        let ids = payload.results.into_iter().map(|row| row.id).collect();
        Ok((last_seq, ids))
    }
}

impl RemoteStore for CouchStore {
    fn get(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>> {
        let store = self.clone();
        let path = path.to_string();
        Box::pin(async move {
            if path.contains('/') {
                let maybe_doc = store.get_document(&doc_id(&path)).await?;
                return Ok(maybe_doc.map(|doc| doc.value));
            }

            // Interior path: reassemble the collection from the id prefix.
            let prefix = format!("{path}{ID_SEPARATOR}");
            let docs = store.list_documents(&prefix).await?;
            if docs.is_empty() {
                return Ok(None);
            }
            let mut children = Map::new();
            for doc in docs {
                if let Some(child_id) = doc.id.strip_prefix(&prefix) {
                    children.insert(child_id.to_string(), doc.value);
                }
            }
            Ok(Some(Value::Object(children)))
        })
    }

    fn set(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let path = path.to_string();
        Box::pin(async move {
            let id = doc_id(&path);
            let rev = store.get_document(&id).await?.and_then(|doc| doc.rev);
            let document = CouchDocument { id, rev, value };
            store.put_document(&document).await.map_err(Into::into)
        })
    }

    fn update(
        &self,
        path: &str,
        partial: Map<String, Value>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let path = path.to_string();
        Box::pin(async move {
            let id = doc_id(&path);
            let (rev, merged) = match store.get_document(&id).await? {
                Some(doc) => {
                    let mut fields = match doc.value {
                        Value::Object(fields) => fields,
                        _ => Map::new(),
                    };
                    fields.extend(partial);
                    (doc.rev, fields)
                }
                None => (None, partial),
            };
            let document = CouchDocument {
                id,
                rev,
                value: Value::Object(merged),
            };
            store.put_document(&document).await.map_err(Into::into)
        })
    }

    fn remove(&self, path: &str) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let path = path.to_string();
        Box::pin(async move {
            let id = doc_id(&path);
            let Some(doc) = store.get_document(&id).await? else {
                return Ok(());
            };
            let Some(rev) = doc.rev else {
                return Ok(());
            };
            store.delete_document(&id, &rev).await.map_err(Into::into)
        })
    }

    fn push(&self, _path: &str) -> BoxFuture<'static, StoreResult<String>> {
        // Push keys are client-generated; CouchDB has no server-side
        // counterpart to a child-key reservation.
        Box::pin(async move { Ok(Uuid::new_v4().simple().to_string()) })
    }

    fn subscribe(&self, entity: EntityKind, record_id: Option<String>) -> ChangeStream {
        let store = self.clone();
        async_stream::stream! {
            let mut since = "now".to_string();
            loop {
                match store.poll_changes(&since).await {
                    Ok((last_seq, ids)) => {
                        since = last_seq;
                        for id in ids {
                            let path = doc_path(&id);
                            if EntityKind::from_path(&path) != Some(entity) {
                                continue;
                            }
                            let changed_record = path.split('/').nth(1).map(str::to_string);
                            if let Some(wanted) = &record_id {
                                if changed_record.as_deref() != Some(wanted.as_str()) {
                                    continue;
                                }
                            }
                            yield ChangeEvent {
                                entity,
                                record_id: changed_record,
                            };
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "CouchDB changes poll failed; retrying");
                        sleep(CHANGES_RETRY_DELAY).await;
                    }
                }
            }
        }
        .boxed()
    }
}
