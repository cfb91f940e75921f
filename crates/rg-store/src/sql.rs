//! Relational message store
//!
//! One table per direction (`connections_messages`, `applications_messages`).
//! SMS-shaped properties get dedicated columns; every other property, and any
//! known property whose value does not fit its column, lands in the JSON
//! `other` column so a save/list round trip is lossless.
//!
//! Timestamps are stored as BIGINT epoch millis so the same schema works
//! across SQLite, PostgreSQL and MySQL through `sqlx::AnyPool`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rg_common::{
    DestinationType, Direction, Message, MessageCriteria, MessageStatus, OrderType, SourceType,
};
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::repository::MessageStore;

const CONNECTIONS_TABLE: &str = "connections_messages";
const APPLICATIONS_TABLE: &str = "applications_messages";

const BASE_COLUMNS: &str = "id, reference, account_id, message_type, direction, source, source_type, \
     destination, destination_type, status, creation_time, modification_time, other";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    MySql,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(SqlDialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Some(SqlDialect::Postgres)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Some(SqlDialect::MySql)
        } else {
            None
        }
    }

    fn placeholder(self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", n),
            SqlDialect::Sqlite | SqlDialect::MySql => "?".to_string(),
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            SqlDialect::Postgres => "id BIGSERIAL PRIMARY KEY",
            SqlDialect::MySql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
        }
    }

    /// Text extraction of a top-level key from the `other` column. The JSON
    /// path (or key, for PostgreSQL) is bound as a parameter.
    fn json_extract(self, placeholder: &str) -> String {
        match self {
            SqlDialect::Sqlite => format!("json_extract(other, {})", placeholder),
            SqlDialect::Postgres => format!("(other::jsonb ->> {})", placeholder),
            SqlDialect::MySql => format!("JSON_UNQUOTE(JSON_EXTRACT(other, {}))", placeholder),
        }
    }

    fn json_key_argument(self, key: &str) -> String {
        match self {
            SqlDialect::Postgres => key.to_string(),
            SqlDialect::Sqlite | SqlDialect::MySql => {
                format!("$.\"{}\"", key.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    /// VARCHAR of at most `max_len` characters
    Text { max_len: usize },
    Integer,
}

const SHORT_TEXT: ColumnKind = ColumnKind::Text { max_len: 255 };

/// Properties with dedicated columns: (property, column, kind)
const KNOWN_PROPERTIES: &[(&str, &str, ColumnKind)] = &[
    ("to", "smsc_to", SHORT_TEXT),
    ("from", "smsc_from", SHORT_TEXT),
    ("text", "smsc_text", ColumnKind::Text { max_len: 1000 }),
    ("sequenceNumber", "smsc_sequencenumber", ColumnKind::Integer),
    ("messageId", "smsc_messageid", SHORT_TEXT),
    ("commandStatus", "smsc_commandstatus", ColumnKind::Integer),
    ("receiptStatus", "smsc_receiptstatus", SHORT_TEXT),
    ("receiptTime", "smsc_receipttime", SHORT_TEXT),
];

fn known_property(key: &str) -> Option<(&'static str, ColumnKind)> {
    KNOWN_PROPERTIES
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, column, kind)| (*column, *kind))
}

#[derive(Debug, Clone, PartialEq)]
enum SqlArg {
    Text(Option<String>),
    Int(Option<i64>),
    Float(f64),
}

impl ColumnKind {
    /// Column value for `value`, or `None` when it only fits the overflow
    fn arg_for(self, value: &Value) -> Option<SqlArg> {
        match (self, value) {
            (ColumnKind::Text { max_len }, Value::String(s)) if s.chars().count() <= max_len => {
                Some(SqlArg::Text(Some(s.clone())))
            }
            (ColumnKind::Integer, Value::Number(n)) => n.as_i64().map(|i| SqlArg::Int(Some(i))),
            _ => None,
        }
    }
}

/// Split message properties into known-column arguments (in
/// `KNOWN_PROPERTIES` order) and the JSON overflow document.
fn split_properties(properties: &HashMap<String, Value>) -> Result<(Vec<SqlArg>, Option<String>)> {
    let mut columns = Vec::with_capacity(KNOWN_PROPERTIES.len());
    for (name, _, kind) in KNOWN_PROPERTIES {
        let arg = properties
            .get(*name)
            .and_then(|v| kind.arg_for(v))
            .unwrap_or(match kind {
                ColumnKind::Text { .. } => SqlArg::Text(None),
                ColumnKind::Integer => SqlArg::Int(None),
            });
        columns.push(arg);
    }

    let mut other = Map::new();
    for (key, value) in properties {
        let in_column = known_property(key)
            .map(|(_, kind)| kind.arg_for(value).is_some())
            .unwrap_or(false);
        if !in_column {
            other.insert(key.clone(), value.clone());
        }
    }

    let other = if other.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&Value::Object(other))?)
    };
    Ok((columns, other))
}

struct QueryBuilder {
    dialect: SqlDialect,
    args: Vec<SqlArg>,
}

impl QueryBuilder {
    fn new(dialect: SqlDialect) -> Self {
        Self { dialect, args: Vec::new() }
    }

    fn push(&mut self, arg: SqlArg) -> String {
        self.args.push(arg);
        self.dialect.placeholder(self.args.len())
    }

    /// Conditions for everything in `criteria` except direction, ordering
    /// and paging
    fn where_clause(&mut self, criteria: &MessageCriteria) -> String {
        let mut conditions: Vec<String> = Vec::new();

        if !criteria.statuses.is_empty() {
            let alternatives: Vec<String> = criteria
                .statuses
                .iter()
                .map(|s| {
                    let p = self.push(SqlArg::Int(Some(s.code() as i64)));
                    format!("status = {}", p)
                })
                .collect();
            conditions.push(format!("({})", alternatives.join(" OR ")));
        }
        if let Some(ref message_type) = criteria.message_type {
            let p = self.push(SqlArg::Text(Some(message_type.clone())));
            conditions.push(format!("message_type = {}", p));
        }
        if let Some(ref destination) = criteria.destination {
            let p = self.push(SqlArg::Text(Some(destination.clone())));
            conditions.push(format!("destination = {}", p));
        }
        if let Some(destination_type) = criteria.destination_type {
            let p = self.push(SqlArg::Int(Some(destination_type.code() as i64)));
            conditions.push(format!("destination_type = {}", p));
        }
        for (key, value) in &criteria.properties {
            conditions.push(self.property_condition(key, value));
        }

        if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        }
    }

    fn property_condition(&mut self, key: &str, value: &Value) -> String {
        let known = known_property(key).and_then(|(column, kind)| kind.arg_for(value).map(|a| (column, a)));
        if let Some((column, arg)) = known {
            let p = self.push(arg);
            return format!("{} = {}", column, p);
        }

        let path = self.push(SqlArg::Text(Some(self.dialect.json_key_argument(key))));
        let extracted = self.dialect.json_extract(&path);
        let expected = self.json_comparison_arg(value);
        let p = self.push(expected);
        format!("{} = {}", extracted, p)
    }

    /// SQLite keeps JSON scalar types on extraction; the other dialects
    /// extract text.
    fn json_comparison_arg(&self, value: &Value) -> SqlArg {
        match (self.dialect, value) {
            (_, Value::String(s)) => SqlArg::Text(Some(s.clone())),
            (SqlDialect::Sqlite, Value::Bool(b)) => SqlArg::Int(Some(*b as i64)),
            (SqlDialect::Sqlite, Value::Number(n)) => match n.as_i64() {
                Some(i) => SqlArg::Int(Some(i)),
                None => SqlArg::Float(n.as_f64().unwrap_or_default()),
            },
            (_, other) => SqlArg::Text(Some(other.to_string())),
        }
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    args: Vec<SqlArg>,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlArg::Text(v) => query.bind(v),
            SqlArg::Int(v) => query.bind(v),
            SqlArg::Float(v) => query.bind(v),
        };
    }
    query
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::invalid_data(format!("invalid timestamp {}", millis)))
}

fn row_to_message(row: &AnyRow) -> Result<Message> {
    let status_code: i64 = row.try_get("status")?;
    let status = MessageStatus::from_code(status_code as i32)
        .ok_or_else(|| StoreError::invalid_data(format!("unknown status code {}", status_code)))?;

    let mut properties = HashMap::new();
    for (name, column, kind) in KNOWN_PROPERTIES {
        let value = match kind {
            ColumnKind::Text { .. } => row.try_get::<Option<String>, _>(*column)?.map(Value::String),
            ColumnKind::Integer => row.try_get::<Option<i64>, _>(*column)?.map(Value::from),
        };
        if let Some(value) = value {
            properties.insert(name.to_string(), value);
        }
    }
    if let Some(other) = row.try_get::<Option<String>, _>("other")? {
        match serde_json::from_str::<Value>(&other)? {
            Value::Object(map) => properties.extend(map),
            _ => return Err(StoreError::invalid_data("overflow column is not a JSON object")),
        }
    }

    let modification_time = row
        .try_get::<Option<i64>, _>("modification_time")?
        .map(from_millis)
        .transpose()?;

    Ok(Message {
        id: Some(row.try_get("id")?),
        reference: row.try_get("reference")?,
        account_id: row.try_get("account_id")?,
        message_type: row.try_get("message_type")?,
        direction: Direction::from_code(row.try_get::<i64, _>("direction")? as i32),
        source: row.try_get("source")?,
        source_type: SourceType::from_code(row.try_get::<i64, _>("source_type")? as i32),
        destination: row.try_get("destination")?,
        destination_type: DestinationType::from_code(row.try_get::<i64, _>("destination_type")? as i32),
        status,
        properties,
        creation_time: from_millis(row.try_get("creation_time")?)?,
        modification_time,
    })
}

pub struct SqlMessageStore {
    pool: AnyPool,
    dialect: SqlDialect,
}

impl SqlMessageStore {
    pub fn new(pool: AnyPool, dialect: SqlDialect) -> Self {
        Self { pool, dialect }
    }

    /// Connect with the dialect inferred from the URL scheme. In-memory
    /// SQLite databases are per-connection, so use `max_connections = 1`
    /// with `sqlite::memory:`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let dialect = SqlDialect::from_url(url)
            .ok_or_else(|| StoreError::rejected(format!("unsupported database url scheme: {}", url)))?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(dialect = ?dialect, max_connections, "Connected relational message store");
        Ok(Self::new(pool, dialect))
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub async fn init_schema(&self) -> Result<()> {
        let known_columns: Vec<String> = KNOWN_PROPERTIES
            .iter()
            .map(|(_, column, kind)| match kind {
                ColumnKind::Text { max_len } => format!("{} VARCHAR({})", column, max_len),
                ColumnKind::Integer => format!("{} BIGINT", column),
            })
            .collect();

        for table in [CONNECTIONS_TABLE, APPLICATIONS_TABLE] {
            let ddl = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    {id},
                    reference VARCHAR(64) NOT NULL,
                    account_id VARCHAR(128) NOT NULL,
                    message_type VARCHAR(64) NOT NULL,
                    direction BIGINT NOT NULL,
                    source VARCHAR(255),
                    source_type BIGINT NOT NULL,
                    destination VARCHAR(255),
                    destination_type BIGINT NOT NULL,
                    status BIGINT NOT NULL,
                    creation_time BIGINT NOT NULL,
                    modification_time BIGINT,
                    {known},
                    other TEXT
                )
                "#,
                table = table,
                id = self.dialect.id_column(),
                known = known_columns.join(",\n                    "),
            );
            sqlx::query(&ddl).execute(&self.pool).await?;

            // MySQL has no CREATE INDEX IF NOT EXISTS
            if self.dialect != SqlDialect::MySql {
                let index = format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status)",
                    table = table
                );
                sqlx::query(&index).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    fn table_for(direction: Direction) -> Option<&'static str> {
        match direction {
            Direction::ToConnections => Some(CONNECTIONS_TABLE),
            Direction::ToApplications => Some(APPLICATIONS_TABLE),
            Direction::Unknown => None,
        }
    }

    fn tables_for(criteria: &MessageCriteria) -> Vec<&'static str> {
        match criteria.direction {
            Some(direction) => Self::table_for(direction).into_iter().collect(),
            None => vec![CONNECTIONS_TABLE, APPLICATIONS_TABLE],
        }
    }

    fn known_column_list() -> String {
        KNOWN_PROPERTIES
            .iter()
            .map(|(_, column, _)| *column)
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn insert(&self, table: &str, message: &mut Message) -> Result<()> {
        let (known_args, other) = split_properties(&message.properties)?;

        let mut args = vec![
            SqlArg::Text(Some(message.reference.clone())),
            SqlArg::Text(Some(message.account_id.clone())),
            SqlArg::Text(Some(message.message_type.clone())),
            SqlArg::Int(Some(message.direction.code() as i64)),
            SqlArg::Text(message.source.clone()),
            SqlArg::Int(Some(message.source_type.code() as i64)),
            SqlArg::Text(message.destination.clone()),
            SqlArg::Int(Some(message.destination_type.code() as i64)),
            SqlArg::Int(Some(message.status.code() as i64)),
            SqlArg::Int(Some(message.creation_time.timestamp_millis())),
            SqlArg::Int(message.modification_time.map(|t| t.timestamp_millis())),
        ];
        args.extend(known_args);
        args.push(SqlArg::Text(other));

        let placeholders: Vec<String> = (1..=args.len()).map(|n| self.dialect.placeholder(n)).collect();
        let mut sql = format!(
            "INSERT INTO {} (reference, account_id, message_type, direction, source, source_type, \
             destination, destination_type, status, creation_time, modification_time, {}, other) \
             VALUES ({})",
            table,
            Self::known_column_list(),
            placeholders.join(", ")
        );

        let id = match self.dialect {
            SqlDialect::MySql => {
                let result = bind_all(sqlx::query(&sql), args).execute(&self.pool).await?;
                result
                    .last_insert_id()
                    .ok_or_else(|| StoreError::invalid_data("insert did not report an id"))?
            }
            SqlDialect::Sqlite | SqlDialect::Postgres => {
                sql.push_str(" RETURNING id");
                let row = bind_all(sqlx::query(&sql), args).fetch_one(&self.pool).await?;
                row.try_get::<i64, _>("id")?
            }
        };

        message.id = Some(id);
        debug!(table, message_id = id, "Inserted message");
        Ok(())
    }

    async fn update(&self, table: &str, message: &Message, id: i64) -> Result<()> {
        let (known_args, other) = split_properties(&message.properties)?;

        let mut assignments = vec![
            "reference", "account_id", "message_type", "direction", "source", "source_type",
            "destination", "destination_type", "status", "creation_time", "modification_time",
        ];
        assignments.extend(KNOWN_PROPERTIES.iter().map(|(_, column, _)| *column));
        assignments.push("other");

        let mut args = vec![
            SqlArg::Text(Some(message.reference.clone())),
            SqlArg::Text(Some(message.account_id.clone())),
            SqlArg::Text(Some(message.message_type.clone())),
            SqlArg::Int(Some(message.direction.code() as i64)),
            SqlArg::Text(message.source.clone()),
            SqlArg::Int(Some(message.source_type.code() as i64)),
            SqlArg::Text(message.destination.clone()),
            SqlArg::Int(Some(message.destination_type.code() as i64)),
            SqlArg::Int(Some(message.status.code() as i64)),
            SqlArg::Int(Some(message.creation_time.timestamp_millis())),
            SqlArg::Int(message.modification_time.map(|t| t.timestamp_millis())),
        ];
        args.extend(known_args);
        args.push(SqlArg::Text(other));
        args.push(SqlArg::Int(Some(id)));

        let set_clause: Vec<String> = assignments
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = {}", column, self.dialect.placeholder(i + 1)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = {}",
            table,
            set_clause.join(", "),
            self.dialect.placeholder(assignments.len() + 1)
        );

        let result = bind_all(sqlx::query(&sql), args).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id });
        }
        debug!(table, message_id = id, status = %message.status, "Updated message");
        Ok(())
    }

    async fn list_table(&self, table: &str, criteria: &MessageCriteria) -> Result<Vec<Message>> {
        let mut builder = QueryBuilder::new(self.dialect);
        let where_clause = builder.where_clause(criteria);

        let order_column = criteria.order_by.map(|f| f.column()).unwrap_or("id");
        let order = match criteria.order_type {
            OrderType::Upwards => "ASC",
            OrderType::Downwards => "DESC",
        };
        let sql = format!(
            "SELECT {}, {} FROM {}{} ORDER BY {} {}, id {} LIMIT {} OFFSET {}",
            BASE_COLUMNS,
            Self::known_column_list(),
            table,
            where_clause,
            order_column,
            order,
            order,
            criteria.effective_limit(),
            criteria.offset
        );

        let rows = bind_all(sqlx::query(&sql), builder.args)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }
}

#[async_trait]
impl MessageStore for SqlMessageStore {
    async fn save_or_update(&self, message: &mut Message) -> Result<()> {
        let table = Self::table_for(message.direction).ok_or_else(|| {
            StoreError::rejected(format!(
                "direction {:?} of message {} is not supported",
                message.direction, message.reference
            ))
        })?;

        match message.id {
            None => self.insert(table, message).await,
            Some(id) => self.update(table, message, id).await,
        }
    }

    async fn update_status(&self, criteria: &MessageCriteria, status: MessageStatus) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let mut updated = 0;

        for table in Self::tables_for(criteria) {
            let mut builder = QueryBuilder::new(self.dialect);
            let status_p = builder.push(SqlArg::Int(Some(status.code() as i64)));
            let time_p = builder.push(SqlArg::Int(Some(now)));
            let where_clause = builder.where_clause(criteria);
            let sql = format!(
                "UPDATE {} SET status = {}, modification_time = {}{}",
                table, status_p, time_p, where_clause
            );

            let result = bind_all(sqlx::query(&sql), builder.args)
                .execute(&self.pool)
                .await?;
            updated += result.rows_affected();
        }

        debug!(status = %status, updated, "Bulk status update");
        Ok(updated)
    }

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>> {
        let tables = Self::tables_for(criteria);
        if tables.len() == 1 {
            return self.list_table(tables[0], criteria).await;
        }

        let wide = criteria.widened();
        let mut merged = Vec::new();
        for table in tables {
            merged.extend(self.list_table(table, &wide).await?);
        }
        Ok(criteria.sort_and_page(merged))
    }
}
