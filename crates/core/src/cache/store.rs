//! Named request/response store.
//!
//! A [`CacheStore`] is a view over one named cache inside a [`CacheDb`]. It
//! offers the primitives of a browser-style cache storage: lookup by URL,
//! atomic per-key put and delete, and a scan of stored requests. Nothing here
//! spans more than one key; callers that touch several entries do so with
//! independent statements.

use super::connection::CacheDb;
use super::entry::{CachedRequest, CachedResponse, Headers};
use crate::Error;
use tokio_rusqlite::{params, rusqlite};

/// Store scoped to a single cache name.
#[derive(Clone, Debug)]
pub struct CacheStore {
    db: CacheDb,
    name: String,
}

impl CacheStore {
    pub fn new(db: CacheDb, name: impl Into<String>) -> Self {
        Self { db, name: name.into() }
    }

    /// Name of the cache this store is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &CacheDb {
        &self.db
    }

    /// Look up the stored pair for `url`.
    pub async fn match_url(&self, url: &str) -> Result<Option<(CachedRequest, CachedResponse)>, Error> {
        let name = self.name.clone();
        let url = url.to_string();
        self.db
            .conn
            .call(move |conn| -> Result<Option<(CachedRequest, CachedResponse)>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT url, request_headers, status, status_text, response_headers, body
                     FROM cache_entries WHERE cache_name = ?1 AND url = ?2",
                )?;

                let row = stmt.query_row(params![name, url], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u16>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                });

                match row {
                    Ok((url, req_headers, status, status_text, resp_headers, body)) => {
                        let request = CachedRequest { url, headers: decode_headers(&req_headers)? };
                        let response =
                            CachedResponse { status, status_text, headers: decode_headers(&resp_headers)?, body };
                        Ok(Some((request, response)))
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or replace the pair stored under `request.url`.
    pub async fn put(&self, request: &CachedRequest, response: &CachedResponse) -> Result<(), Error> {
        let name = self.name.clone();
        let url = request.url.clone();
        let req_headers = serde_json::to_string(&request.headers)?;
        let resp_headers = serde_json::to_string(&response.headers)?;
        let status = response.status;
        let status_text = response.status_text.clone();
        let body = response.body.clone();

        self.db
            .conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO cache_entries (
                        cache_name, url, request_headers, status, status_text, response_headers, body, seq
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                        (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries WHERE cache_name = ?1))
                    ON CONFLICT(cache_name, url) DO UPDATE SET
                        request_headers = excluded.request_headers,
                        status = excluded.status,
                        status_text = excluded.status_text,
                        response_headers = excluded.response_headers,
                        body = excluded.body",
                    params![name, url, req_headers, status, status_text, resp_headers, body],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Remove the pair stored under `url`. Returns whether anything was removed.
    pub async fn delete(&self, url: &str) -> Result<bool, Error> {
        let name = self.name.clone();
        let url = url.to_string();
        self.db
            .conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute(
                    "DELETE FROM cache_entries WHERE cache_name = ?1 AND url = ?2",
                    params![name, url],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// All stored requests, in first-insertion order.
    pub async fn keys(&self) -> Result<Vec<CachedRequest>, Error> {
        let name = self.name.clone();
        self.db
            .conn
            .call(move |conn| -> Result<Vec<CachedRequest>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT url, request_headers FROM cache_entries WHERE cache_name = ?1 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map(params![name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(url, headers)| -> Result<CachedRequest, Error> {
                        Ok(CachedRequest { url, headers: decode_headers(&headers)? })
                    })
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Number of stored entries.
    pub async fn len(&self) -> Result<usize, Error> {
        let name = self.name.clone();
        self.db
            .conn
            .call(move |conn| -> Result<usize, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len().await? == 0)
    }

    /// Drop every entry of this cache. Returns the number removed.
    pub async fn clear(&self) -> Result<u64, Error> {
        let name = self.name.clone();
        self.db
            .conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM cache_entries WHERE cache_name = ?1", params![name])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}

fn decode_headers(raw: &str) -> Result<Headers, Error> {
    serde_json::from_str(raw).map_err(|e| Error::Serialization(format!("stored headers: {e}")))
}
