//! Embedded SQLite filter database.
use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{
    bip158::{BlockFilter, FilterHash, FilterHeader},
    BlockHash,
};
use rusqlite::{params, Connection};
use std::{path::PathBuf, str::FromStr};
use tokio::task;

use crate::{
    store::{FilterHeaderEntry, FilterStore},
    types::{FilterType, Position},
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tips (
        filter_type INTEGER NOT NULL,
        chain       TEXT    NOT NULL,
        height      INTEGER NOT NULL,
        hash        TEXT    NOT NULL,
        PRIMARY KEY (filter_type, chain)
    );

    CREATE TABLE IF NOT EXISTS filter_headers (
        filter_type INTEGER NOT NULL,
        block       TEXT    NOT NULL,
        header      TEXT    NOT NULL,
        filter_hash TEXT    NOT NULL,
        PRIMARY KEY (filter_type, block)
    );

    CREATE TABLE IF NOT EXISTS filters (
        filter_type INTEGER NOT NULL,
        block       TEXT    NOT NULL,
        content     BLOB    NOT NULL,
        PRIMARY KEY (filter_type, block)
    );
"#;

const HEADER_CHAIN: &str = "header";
const FILTER_CHAIN: &str = "filter";

/// Tables:
///   tips(filter_type, chain, height, hash): one row per filter type and
///     chain (`header` or `filter`)
///   filter_headers(filter_type, block, header, filter_hash)
///   filters(filter_type, block, content)
///
/// Hashes are stored as their display hex, filter types as wire codes.
/// Every batch write runs in one transaction.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { path })
    }

    async fn blocking<T, F>(&self, work: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)
                .with_context(|| format!("open sqlite at {}", path.display()))?;
            work(&mut conn)
        })
        .await?
    }

    fn tip_get(conn: &Connection, ty: FilterType, chain: &str) -> anyhow::Result<Option<Position>> {
        let mut stmt =
            conn.prepare("SELECT height, hash FROM tips WHERE filter_type = ?1 AND chain = ?2")?;
        let mut rows = stmt.query(params![ty.wire_code(), chain])?;
        if let Some(row) = rows.next()? {
            let height: u32 = row.get(0)?;
            let hash: String = row.get(1)?;
            let hash = BlockHash::from_str(&hash).context("parse tip hash")?;
            Ok(Some(Position::new(height, hash)))
        } else {
            Ok(None)
        }
    }

    fn tip_set(conn: &Connection, ty: FilterType, chain: &str, tip: Position) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO tips(filter_type, chain, height, hash) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(filter_type, chain) DO UPDATE SET height=excluded.height, hash=excluded.hash",
            params![ty.wire_code(), chain, tip.height, tip.hash.to_string()],
        )?;
        Ok(())
    }

    fn headers_put(conn: &Connection, ty: FilterType, headers: &[FilterHeaderEntry]) -> anyhow::Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO filter_headers(filter_type, block, header, filter_hash) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(filter_type, block) DO UPDATE SET header=excluded.header, filter_hash=excluded.filter_hash",
        )?;
        for entry in headers {
            stmt.execute(params![
                ty.wire_code(),
                entry.block.to_string(),
                entry.header.to_string(),
                entry.filter_hash.to_string()
            ])?;
        }
        Ok(())
    }

    fn filters_put(conn: &Connection, ty: FilterType, filters: &[(BlockHash, BlockFilter)]) -> anyhow::Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO filters(filter_type, block, content) VALUES(?1, ?2, ?3)
             ON CONFLICT(filter_type, block) DO UPDATE SET content=excluded.content",
        )?;
        for (block, filter) in filters {
            stmt.execute(params![ty.wire_code(), block.to_string(), filter.content])?;
        }
        Ok(())
    }

    fn header_column(
        conn: &Connection,
        ty: FilterType,
        block: &BlockHash,
        column: &str,
    ) -> anyhow::Result<Option<String>> {
        let sql = format!("SELECT {column} FROM filter_headers WHERE filter_type = ?1 AND block = ?2");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![ty.wire_code(), block.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FilterStore for SqliteStore {
    async fn filter_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<Position>> {
        self.blocking(move |conn| Self::tip_get(conn, filter_type, FILTER_CHAIN))
            .await
    }

    async fn filter_header_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<Position>> {
        self.blocking(move |conn| Self::tip_get(conn, filter_type, HEADER_CHAIN))
            .await
    }

    async fn set_filter_tip(&self, filter_type: FilterType, tip: Position) -> anyhow::Result<()> {
        self.blocking(move |conn| Self::tip_set(conn, filter_type, FILTER_CHAIN, tip))
            .await
    }

    async fn set_filter_header_tip(&self, filter_type: FilterType, tip: Position) -> anyhow::Result<()> {
        self.blocking(move |conn| Self::tip_set(conn, filter_type, HEADER_CHAIN, tip))
            .await
    }

    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<BlockFilter>> {
        let block = *block;
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT content FROM filters WHERE filter_type = ?1 AND block = ?2")?;
            let mut rows = stmt.query(params![filter_type.wire_code(), block.to_string()])?;
            match rows.next()? {
                Some(row) => {
                    let content: Vec<u8> = row.get(0)?;
                    Ok(Some(BlockFilter::new(&content)))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHeader>> {
        let block = *block;
        self.blocking(move |conn| {
            Self::header_column(conn, filter_type, &block, "header")?
                .map(|s| FilterHeader::from_str(&s).context("parse filter header"))
                .transpose()
        })
        .await
    }

    async fn load_filter_hash(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHash>> {
        let block = *block;
        self.blocking(move |conn| {
            Self::header_column(conn, filter_type, &block, "filter_hash")?
                .map(|s| FilterHash::from_str(&s).context("parse filter hash"))
                .transpose()
        })
        .await
    }

    async fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[FilterHeaderEntry],
        tip: Option<Position>,
    ) -> anyhow::Result<()> {
        let headers = headers.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            Self::headers_put(&tx, filter_type, &headers)?;
            if let Some(tip) = tip {
                Self::tip_set(&tx, filter_type, HEADER_CHAIN, tip)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn store_filters(
        &self,
        filter_type: FilterType,
        filters: &[(BlockHash, BlockFilter)],
        tip: Option<Position>,
    ) -> anyhow::Result<()> {
        let filters = filters.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            Self::filters_put(&tx, filter_type, &filters)?;
            if let Some(tip) = tip {
                Self::tip_set(&tx, filter_type, FILTER_CHAIN, tip)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn store_filters_with_headers(
        &self,
        filter_type: FilterType,
        headers: &[FilterHeaderEntry],
        filters: &[(BlockHash, BlockFilter)],
        header_tip: Option<Position>,
        filter_tip: Option<Position>,
    ) -> anyhow::Result<()> {
        let headers = headers.to_vec();
        let filters = filters.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            Self::headers_put(&tx, filter_type, &headers)?;
            Self::filters_put(&tx, filter_type, &filters)?;
            if let Some(tip) = header_tip {
                Self::tip_set(&tx, filter_type, HEADER_CHAIN, tip)?;
            }
            if let Some(tip) = filter_tip {
                Self::tip_set(&tx, filter_type, FILTER_CHAIN, tip)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
