use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use icat_core::error::{IcatError, Result};
use icat_core::jsonstream;
use icat_core::portfile::{AttributeScope, DuplicateAction};
use icat_core::search::{SearchParameter, SearchQuery};
use reqwest::multipart;
use reqwest::Response;
use tokio_util::io::ReaderStream;

use crate::client::{check_status, io_error, transport, Icat};

/// A RESTful ICAT session.
///
/// A session is an immutable pair of server handle and sessionId; it
/// carries no other state and is cheap to clone. Every operation performs
/// one HTTP round trip and surfaces any failure immediately; there are no
/// retries. The server is authoritative for the session lifecycle: after
/// [`logout`](Session::logout) (or TTL expiry) any further operation
/// fails with [`ErrorKind::Session`](icat_core::ErrorKind::Session).
#[derive(Debug, Clone)]
pub struct Session {
    icat: Icat,
    session_id: String,
}

/// Constraints for the indexed-search operations. Absent fields do not
/// constrain; `samples` and `user_full_name` only apply to
/// investigation searches. `sort` and `facets` are opaque JSON passed
/// through to the server.
#[derive(Debug, Clone, Default)]
pub struct DataSearch {
    pub user: Option<String>,
    pub text: Option<String>,
    pub lower: Option<DateTime<Utc>>,
    pub upper: Option<DateTime<Utc>>,
    pub parameters: Vec<SearchParameter>,
    pub samples: Vec<String>,
    pub user_full_name: Option<String>,
    /// Cursor from a previous search; results start after this document.
    pub search_after: Option<String>,
    pub max_count: i32,
    pub sort: Option<String>,
    pub facets: Option<serde_json::Value>,
}

impl Session {
    pub(crate) fn new(icat: Icat, session_id: String) -> Self {
        Self { icat, session_id }
    }

    /// The opaque sessionId issued by the server.
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Log out, invalidating the session server-side. Further operations
    /// on this sessionId fail with a session error.
    pub async fn logout(&self) -> Result<()> {
        let url = self
            .icat
            .url_for(&format!("session/{}", self.session_id), &[])?;
        let response = self.icat.client.delete(url).send().await.map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Reset the session lifetime to its full value.
    pub async fn refresh(&self) -> Result<()> {
        let url = self
            .icat
            .url_for(&format!("session/{}", self.session_id), &[])?;
        let response = self.icat.client.put(url).send().await.map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Return the time remaining in the session in minutes.
    pub async fn get_remaining_minutes(&self) -> Result<f64> {
        let url = self
            .icat
            .url_for(&format!("session/{}", self.session_id), &[])?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        let body = self.icat.get_string(response).await?;
        jsonstream::string_value(&body, "remainingMinutes")?
            .parse()
            .map_err(|e| IcatError::internal(format!("std::num::ParseFloatError {e}")))
    }

    /// Return the user name associated with the session.
    pub async fn get_user_name(&self) -> Result<String> {
        let url = self
            .icat
            .url_for(&format!("session/{}", self.session_id), &[])?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        let body = self.icat.get_string(response).await?;
        jsonstream::string_value(&body, "userName")
    }

    /// Write (create or update) entities from a JSON document, returning
    /// the ids of the top level entities created. If there is only one
    /// entity the outer `[` `]` may be omitted.
    pub async fn write(&self, entities: &str) -> Result<Vec<i64>> {
        let url = self.icat.url_for("entityManager", &[])?;
        let response = self
            .icat
            .client
            .post(url)
            .form(&[("sessionId", self.session_id.as_str()), ("entities", entities)])
            .send()
            .await
            .map_err(transport)?;
        let body = self.icat.get_string(response).await?;
        jsonstream::long_array(&body)
    }

    /// Delete the entities described by a JSON document.
    pub async fn delete(&self, entities: &str) -> Result<()> {
        let url = self.icat.url_for(
            "entityManager",
            &[("sessionId", self.session_id.as_str()), ("entities", entities)],
        )?;
        let response = self.icat.client.delete(url).send().await.map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Get the entity with the given id selected by the query. The
    /// response JSON is returned undecoded.
    pub async fn get(&self, query: &str, id: i64) -> Result<String> {
        let id = id.to_string();
        let url = self.icat.url_for(
            "entityManager",
            &[
                ("sessionId", self.session_id.as_str()),
                ("query", query),
                ("id", &id),
            ],
        )?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        self.icat.get_string(response).await
    }

    /// Run a query, returning the response JSON undecoded.
    pub async fn search(&self, query: &str) -> Result<String> {
        let url = self.icat.url_for(
            "entityManager",
            &[("sessionId", self.session_id.as_str()), ("query", query)],
        )?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        self.icat.get_string(response).await
    }

    /// Clone an entity, overriding the fields in `keys`, and return the
    /// id of the clone.
    pub async fn clone_entity(
        &self,
        name: &str,
        id: i64,
        keys: &HashMap<String, String>,
    ) -> Result<i64> {
        let keys_json = serde_json::to_string(keys)
            .map_err(|e| IcatError::internal(format!("serde_json::Error {e}")))?;
        let url = self.icat.url_for("cloner", &[])?;
        let response = self
            .icat
            .client
            .post(url)
            .form(&[
                ("sessionId", self.session_id.as_str()),
                ("name", name),
                ("id", &id.to_string()),
                ("keys", &keys_json),
            ])
            .send()
            .await
            .map_err(transport)?;
        let body = self.icat.get_string(response).await?;
        jsonstream::long_value(&body, "id")
    }

    /// List the members of the path, returning the response JSON
    /// undecoded.
    pub async fn list(&self, path: &str) -> Result<String> {
        let url = self.icat.url_for(
            "list",
            &[("sessionId", self.session_id.as_str()), ("path", path)],
        )?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        self.icat.get_string(response).await
    }

    /// Export metadata as a port file stream. With no query everything
    /// visible to the user is exported; otherwise the query selects the
    /// entities to export.
    ///
    /// The returned [`MetadataExport`] keeps the transport connection
    /// open until the caller is done with it.
    pub async fn export_meta_data(
        &self,
        query: Option<&str>,
        attributes: AttributeScope,
    ) -> Result<MetadataExport> {
        let mut arg = serde_json::Map::new();
        arg.insert("sessionId".into(), self.session_id.clone().into());
        if let Some(query) = query {
            arg.insert("query".into(), query.into());
        }
        arg.insert("attributes".into(), attributes.as_str().into());
        let json = serde_json::Value::Object(arg).to_string();

        let url = self.icat.url_for("port", &[("json", &json)])?;
        tracing::debug!(scope = attributes.as_str(), "Starting metadata export");
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(MetadataExport { response })
        } else {
            // Consuming the body here drops the connection before the
            // handle is ever constructed
            let body = response.text().await.map_err(transport)?;
            check_status(status, &body)?;
            Err(IcatError::internal("No explanation provided"))
        }
    }

    /// Import metadata from a port file on the local filesystem. The
    /// file is streamed into the request, not buffered in memory.
    pub async fn import_meta_data(
        &self,
        path: &Path,
        duplicate: DuplicateAction,
        attributes: AttributeScope,
    ) -> Result<()> {
        let arg = serde_json::json!({
            "sessionId": self.session_id,
            "duplicate": duplicate.as_str(),
            "attributes": attributes.as_str(),
        });
        let url = self.icat.url_for("port", &[])?;

        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let part = multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .file_name("")
            .mime_str("application/octet-stream")
            .map_err(transport)?;
        let form = multipart::Form::new()
            .text("json", arg.to_string())
            .part("file", part);

        tracing::debug!(path = %path.display(), "Starting metadata import");
        let response = self
            .icat
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Return indexed documents for Investigations satisfying the search
    /// constraints, as raw JSON.
    pub async fn search_investigations(&self, search: &DataSearch) -> Result<String> {
        self.search_documents("Investigation", search, true).await
    }

    /// Return indexed documents for Datasets satisfying the search
    /// constraints, as raw JSON.
    pub async fn search_datasets(&self, search: &DataSearch) -> Result<String> {
        self.search_documents("Dataset", search, false).await
    }

    /// Return indexed documents for Datafiles satisfying the search
    /// constraints, as raw JSON.
    pub async fn search_datafiles(&self, search: &DataSearch) -> Result<String> {
        self.search_documents("Datafile", search, false).await
    }

    async fn search_documents(
        &self,
        target: &str,
        search: &DataSearch,
        investigation_fields: bool,
    ) -> Result<String> {
        let mut query = SearchQuery::new(target);
        query.user = search.user.clone();
        query.text = search.text.clone();
        if let Some(t) = search.lower {
            query = query.lower(t);
        }
        if let Some(t) = search.upper {
            query = query.upper(t);
        }
        query.parameters = search.parameters.clone();
        if investigation_fields {
            query.samples = search.samples.clone();
            query.user_full_name = search.user_full_name.clone();
        }
        query.facets = search.facets.clone();
        let query_json = serde_json::to_string(&query)
            .map_err(|e| IcatError::internal(format!("serde_json::Error {e}")))?;

        let max_count = search.max_count.to_string();
        let mut params = vec![
            ("sessionId", self.session_id.as_str()),
            ("query", query_json.as_str()),
            ("maxCount", max_count.as_str()),
        ];
        if let Some(after) = &search.search_after {
            params.push(("search_after", after));
        }
        if let Some(sort) = &search.sort {
            params.push(("sort", sort));
        }
        let url = self.icat.url_for("search/documents", &params)?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        self.icat.get_string(response).await
    }

    /// Trigger asynchronous (re)indexing of an entity type, starting
    /// above `min_id` and stopping at `max_id` if given. With `delete`
    /// set, existing index documents for the type are removed first.
    pub async fn search_populate(
        &self,
        entity_name: &str,
        min_id: i64,
        max_id: Option<i64>,
        delete: bool,
    ) -> Result<()> {
        let url = self
            .icat
            .url_for(&format!("search/populate/{entity_name}"), &[])?;
        let mut form = vec![
            ("sessionId", self.session_id.clone()),
            ("minId", min_id.to_string()),
            ("delete", delete.to_string()),
        ];
        if let Some(max_id) = max_id {
            form.push(("maxId", max_id.to_string()));
        }
        let response = self
            .icat
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Trigger asynchronous reindexing of an entity type with an id at or
    /// above `min_id`.
    pub async fn lucene_populate(&self, entity_name: &str, min_id: i64) -> Result<()> {
        let url = self
            .icat
            .url_for(&format!("lucene/db/{entity_name}/{min_id}"), &[])?;
        let response = self
            .icat
            .client
            .post(url)
            .form(&[("sessionId", self.session_id.as_str())])
            .send()
            .await
            .map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Return the entity type names whose index population is still
    /// running.
    pub async fn lucene_get_populating(&self) -> Result<Vec<String>> {
        let url = self
            .icat
            .url_for("lucene/db", &[("sessionId", self.session_id.as_str())])?;
        let response = self.icat.client.get(url).send().await.map_err(transport)?;
        let body = self.icat.get_string(response).await?;
        jsonstream::string_array(&body)
    }

    /// Clear the search index.
    pub async fn lucene_clear(&self) -> Result<()> {
        let url = self
            .icat
            .url_for("lucene/db", &[("sessionId", self.session_id.as_str())])?;
        let response = self.icat.client.delete(url).send().await.map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Force a commit of the search index.
    pub async fn lucene_commit(&self) -> Result<()> {
        let url = self.icat.url_for("lucene/db", &[])?;
        let response = self
            .icat
            .client
            .post(url)
            .form(&[("sessionId", self.session_id.as_str())])
            .send()
            .await
            .map_err(transport)?;
        self.icat.expect_nothing(response).await
    }

    /// Ask the server to wait before responding. Only useful for
    /// testing.
    pub async fn wait_millis(&self, ms: u64) -> Result<()> {
        let url = self.icat.url_for("waitMillis", &[])?;
        let response = self
            .icat
            .client
            .post(url)
            .form(&[
                ("sessionId", self.session_id.as_str()),
                ("ms", &ms.to_string()),
            ])
            .send()
            .await
            .map_err(transport)?;
        self.icat.expect_nothing(response).await
    }
}

/// A streamed metadata export.
///
/// The underlying transport connection stays open while this handle
/// exists and is released exactly once when the handle (or a stream made
/// from it) is dropped: by the caller after reading, or by
/// [`Session::export_meta_data`] itself if construction fails before the
/// handle is returned. Ownership makes a double close unrepresentable.
#[derive(Debug)]
pub struct MetadataExport {
    response: Response,
}

impl MetadataExport {
    /// The export as a stream of chunks.
    pub fn bytes_stream(self) -> impl Stream<Item = Result<Bytes>> {
        self.response.bytes_stream().map(|r| r.map_err(transport))
    }

    /// Pull the next chunk, or `None` once the export is exhausted.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(transport)
    }

    /// Read the whole export into a string. Convenient for small
    /// catalogs; prefer [`bytes_stream`](Self::bytes_stream) for bulk
    /// data.
    pub async fn text(self) -> Result<String> {
        self.response.text().await.map_err(transport)
    }
}
