//! Thin HTTP access to the columnar store (ClickHouse's HTTP interface).
//!
//! The adapter performs no retries and holds no query-specific state; it is
//! shared across concurrent per-table flushes via `Arc`, relying on
//! `reqwest::Client`'s internal connection pool for concurrency.

use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Rows decoded from a `query` call.
#[derive(Debug)]
pub struct QueryResult<T> {
    pub data: Vec<T>,
}

#[derive(Clone)]
pub struct StoreAdapter {
    client: Client,
    base_url: String,
}

impl StoreAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into() }
    }

    /// Execute a SELECT-style statement and decode the rows.
    pub async fn query<T>(&self, database: &str, sql: &str) -> Result<QueryResult<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let formatted = format!("{sql} FORMAT JSONEachRow");
        let response = self
            .client
            .post(&self.base_url)
            .query(&[("database", database)])
            .body(formatted)
            .send()
            .await?;

        let body = Self::check_status(response).await?;

        // ClickHouse's JSONEachRow is newline-delimited rows, not a JSON
        // array; wrap it into an array so a single `serde_json` call can
        // decode it as one `Vec<T>`.
        let mut wrapped = String::from("[");
        for (i, line) in body.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            if i > 0 {
                wrapped.push(',');
            }
            wrapped.push_str(line);
        }
        wrapped.push(']');

        let data: Vec<T> = serde_json::from_str(&wrapped)?;
        Ok(QueryResult { data })
    }

    /// Execute a DDL/DELETE-style statement that returns no rows.
    pub async fn command(&self, database: &str, sql: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .post(&self.base_url)
            .query(&[("database", database)])
            .body(sql.to_owned())
            .send()
            .await?;

        Self::check_status(response).await?;
        Ok(())
    }

    /// Bulk-insert using the store's JSON-each-row ingestion format.
    ///
    /// `body` is a lazy byte stream so a flush never has to buffer the whole
    /// serialized payload up front.
    pub async fn insert<S>(&self, database: &str, table: &str, body: S) -> Result<(), StoreError>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static,
    {
        let query = format!("INSERT INTO {table} FORMAT JSONEachRow");
        let response = self
            .client
            .post(&self.base_url)
            .query(&[("database", database), ("query", &query)])
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;

        Self::check_status(response).await?;
        Ok(())
    }

    async fn check_status(response: reqwest::Response) -> Result<String, StoreError> {
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(StoreError::Server { status: status.as_u16(), message: body });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        number: u64,
        hash: String,
    }

    #[tokio::test]
    async fn query_decodes_json_each_row_lines_into_a_vec() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(200)
            .with_body("{\"number\":1,\"hash\":\"a\"}\n{\"number\":2,\"hash\":\"b\"}\n")
            .create_async()
            .await;

        let store = StoreAdapter::new(server.url());
        let result = store.query::<Row>("db", "SELECT number, hash FROM blocks").await.unwrap();
        assert_eq!(result.data, vec![Row { number: 1, hash: "a".into() }, Row { number: 2, hash: "b".into() }]);
    }

    #[tokio::test]
    async fn query_on_empty_body_returns_empty_vec() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("POST", "/").with_status(200).with_body("").create_async().await;

        let store = StoreAdapter::new(server.url());
        let result = store.query::<Row>("db", "SELECT number, hash FROM blocks").await.unwrap();
        assert!(result.data.is_empty());
    }

    #[tokio::test]
    async fn non_200_response_is_surfaced_as_a_server_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("POST", "/").with_status(500).with_body("nope").create_async().await;

        let store = StoreAdapter::new(server.url());
        let err = store.command("db", "ALTER TABLE t DELETE WHERE 1").await.unwrap_err();
        assert!(matches!(err, StoreError::Server { status: 500, .. }));
    }

    #[tokio::test]
    async fn insert_streams_the_request_body() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("POST", "/").with_status(200).with_body("").create_async().await;

        let store = StoreAdapter::new(server.url());
        let body = Bytes::from("{\"n\":1}\n");
        let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(body) });
        store.insert("db", "items", stream).await.unwrap();
    }
}
