//! PostgREST-style HTTP backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ItemRow, NoteRow, OrderRow, RemoteBackend};
use crate::error::{Error, Result};

const NOTES_TABLE: &str = "notes";
const ITEMS_TABLE: &str = "items";
const ORDER_TABLE: &str = "note_order";

pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    table_prefix: String,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: &str, table_prefix: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            table_prefix: table_prefix.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}{}", self.base_url, self.table_prefix, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn upsert<T: Serialize + Sync>(&self, table: &str, on_conflict: &str, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let resp = self
            .authed(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;
        check_status(resp, table).await?;

        debug!(table, rows = rows.len(), "upserted remote rows");
        Ok(())
    }

    async fn fetch<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let resp = self
            .authed(self.client.get(self.table_url(table)))
            .query(&[("select", "*")])
            .send()
            .await?;
        let rows: Vec<T> = check_status(resp, table).await?.json().await?;

        debug!(table, rows = rows.len(), "fetched remote rows");
        Ok(rows)
    }

    async fn delete(&self, table: &str, filters: &[(&str, String)]) -> Result<()> {
        let resp = self
            .authed(self.client.delete(self.table_url(table)))
            .query(filters)
            .send()
            .await?;
        check_status(resp, table).await?;
        Ok(())
    }
}

async fn check_status(resp: Response, table: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Remote(format!(
        "{} request failed with {}: {}",
        table, status, body
    )))
}

fn quoted_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("\"{}\"", id)).collect();
    format!("({})", quoted.join(","))
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn upsert_notes(&self, rows: &[NoteRow]) -> Result<()> {
        self.upsert(NOTES_TABLE, "id", rows).await
    }

    async fn upsert_items(&self, rows: &[ItemRow]) -> Result<()> {
        self.upsert(ITEMS_TABLE, "id", rows).await
    }

    async fn upsert_order(&self, rows: &[OrderRow]) -> Result<()> {
        self.upsert(ORDER_TABLE, "note_id", rows).await
    }

    async fn delete_items_except(&self, note_id: &str, keep: &[String]) -> Result<()> {
        let mut filters = vec![("note_id", format!("eq.{}", note_id))];
        if !keep.is_empty() {
            filters.push(("id", format!("not.in.{}", quoted_list(keep))));
        }
        self.delete(ITEMS_TABLE, &filters).await
    }

    async fn delete_note(&self, note_id: &str) -> Result<()> {
        self.delete(ITEMS_TABLE, &[("note_id", format!("eq.{}", note_id))])
            .await?;
        self.delete(ORDER_TABLE, &[("note_id", format!("eq.{}", note_id))])
            .await?;
        self.delete(NOTES_TABLE, &[("id", format!("eq.{}", note_id))])
            .await
    }

    async fn fetch_notes(&self) -> Result<Vec<NoteRow>> {
        self.fetch(NOTES_TABLE).await
    }

    async fn fetch_items(&self) -> Result<Vec<ItemRow>> {
        self.fetch(ITEMS_TABLE).await
    }

    async fn fetch_order(&self) -> Result<Vec<OrderRow>> {
        self.fetch(ORDER_TABLE).await
    }
}
