//! PostgreSQL sink.
//!
//! Each source family gets two tables: `<prefix>_info` holds the static
//! identity rows (upserted on conflict) and `<prefix>_metric` is append-only
//! with one row per label per cycle. All rows of one cycle go through a
//! single transaction; a failed row rolls the whole batch back so a
//! timestamp is never half-written.
//!
//! The connection is lazy and self-repairing: every write starts with
//! `ensure_connection`, which is a no-op while connected, attempts exactly
//! one bounded connect otherwise, and never raises. A failed write marks
//! the connection down so the next cycle reconnects.

use std::marker::PhantomData;

use postgres::types::ToSql;
use postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::sample::{LabelSet, LabelValue, MetricSet, Sample};

/// Connection settings, with libpq-style defaults.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Bound on one connect attempt, seconds.
    pub connect_timeout_secs: u64,
    /// Server-side statement timeout, milliseconds. Keep this strictly
    /// shorter than the collection interval so a hung server cannot stall
    /// the scheduler.
    pub statement_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            connect_timeout_secs: 5,
            statement_timeout_ms: 2000,
        }
    }
}

impl ConnectionConfig {
    /// Builds the config from the standard `PG*` environment variables,
    /// falling back to the defaults above.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("PGHOST") {
            config.host = host;
        }
        if let Some(port) = std::env::var("PGPORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Ok(dbname) = std::env::var("PGDATABASE") {
            config.dbname = dbname;
        }
        if let Ok(user) = std::env::var("PGUSER").or_else(|_| std::env::var("USER")) {
            config.user = user;
        }
        config.password = std::env::var("PGPASSWORD").unwrap_or_default();
        config
    }

    fn connection_string(&self) -> String {
        let mut conn = format!(
            "host={} port={} dbname={} user={} connect_timeout={} \
             options='-c statement_timeout={}'",
            self.host,
            self.port,
            self.dbname,
            self.user,
            self.connect_timeout_secs,
            self.statement_timeout_ms
        );
        if !self.password.is_empty() {
            conn.push_str(&format!(" password={}", self.password));
        }
        conn
    }
}

pub struct DatabaseSink<L, M> {
    config: ConnectionConfig,
    client: Option<Client>,
    schema_ready: bool,
    last_error: Option<String>,
    metric_table: String,
    info_table: String,
    metric_insert_sql: String,
    info_upsert_sql: String,
    _marker: PhantomData<fn() -> (L, M)>,
}

impl<L: LabelSet, M: MetricSet> DatabaseSink<L, M> {
    /// Builds the sink and its SQL text. No connection is attempted here;
    /// the first write (or an explicit [`ensure_connection`]) connects.
    ///
    /// [`ensure_connection`]: Self::ensure_connection
    pub fn new(config: ConnectionConfig, table_prefix: &str) -> Self {
        let metric_table = format!("{}_metric", table_prefix);
        let info_table = format!("{}_info", table_prefix);
        let metric_insert_sql = build_metric_insert(&metric_table, L::COLUMNS, M::FIELDS);
        let info_upsert_sql = build_info_upsert(&info_table, L::COLUMNS, L::KEY);
        Self {
            config,
            client: None,
            schema_ready: false,
            last_error: None,
            metric_table,
            info_table,
            metric_insert_sql,
            info_upsert_sql,
            _marker: PhantomData,
        }
    }

    /// Returns true when a connection is available, attempting exactly one
    /// connect when there is none. Never raises; a failure is recorded in
    /// `last_error` and surfaces as a skipped write.
    pub fn ensure_connection(&mut self) -> bool {
        if self.client.is_some() {
            return true;
        }
        match Client::connect(&self.config.connection_string(), NoTls) {
            Ok(client) => {
                info!(
                    host = %self.config.host,
                    dbname = %self.config.dbname,
                    "connected to database"
                );
                self.client = Some(client);
                // Tables are (re)checked once per connection.
                self.schema_ready = false;
                self.last_error = None;
                true
            }
            Err(e) => {
                let msg = e.to_string();
                warn!(host = %self.config.host, error = %msg, "database connect failed");
                self.last_error = Some(msg);
                false
            }
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Creates both tables if needed and upserts the identity rows.
    ///
    /// Called on the first write of every connection; label topology is
    /// stable for the collector's lifetime so once per connection is enough.
    fn ensure_schema(&mut self, labels: &[L]) -> bool {
        let Some(first) = labels.first() else {
            return false;
        };
        let create_metric = build_create_metric(&self.metric_table, first, M::FIELDS);
        let create_info = build_create_info(&self.info_table, first, L::KEY);
        let info_upsert_sql = self.info_upsert_sql.clone();

        let Some(client) = self.client.as_mut() else {
            return false;
        };
        let result: Result<(), postgres::Error> = (|| {
            client.batch_execute(&create_metric)?;
            client.batch_execute(&create_info)?;
            let mut tx = client.transaction()?;
            for label in labels {
                let values = label.values();
                let params = label_params(&values);
                tx.execute(&info_upsert_sql, &params)?;
            }
            tx.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(table = %self.info_table, rows = labels.len(), "identity rows upserted");
                self.schema_ready = true;
                true
            }
            Err(e) => {
                warn!(table = %self.info_table, error = %e, "schema setup failed");
                self.fail(e);
                false
            }
        }
    }

    /// Writes all metric rows of one cycle inside one transaction.
    ///
    /// Aborts without raising when no connection is available; a failed row
    /// rolls back the whole batch and marks it failed, never partial.
    pub fn write_metrics(&mut self, sample: &Sample<'_, L, M>) {
        if !self.ensure_connection() {
            return;
        }
        if !self.schema_ready && !self.ensure_schema(sample.labels) {
            return;
        }

        let timestamp = sample.timestamp.naive_local();
        let metric_insert_sql = self.metric_insert_sql.clone();
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let result: Result<usize, postgres::Error> = (|| {
            let mut tx = client.transaction()?;
            let mut inserted = 0;
            for (label, metric) in sample.pairs() {
                let label_values = label.values();
                let metric_values = metric.values();
                let mut params: Vec<&(dyn ToSql + Sync)> = vec![&timestamp];
                params.extend(label_params(&label_values));
                for value in &metric_values {
                    params.push(value);
                }
                tx.execute(&metric_insert_sql, &params)?;
                inserted += 1;
            }
            tx.commit()?;
            Ok(inserted)
        })();

        match result {
            Ok(rows) => {
                debug!(table = %self.metric_table, rows, "metric rows inserted");
                self.last_error = None;
            }
            Err(e) => {
                warn!(table = %self.metric_table, error = %e, "metric batch rolled back");
                self.fail(e);
            }
        }
    }

    /// Records a failure and drops a dead connection so the next cycle
    /// reconnects.
    fn fail(&mut self, e: postgres::Error) {
        self.last_error = Some(e.to_string());
        if e.is_closed() {
            self.client = None;
            self.schema_ready = false;
        }
    }
}

fn label_params(values: &[LabelValue]) -> Vec<&(dyn ToSql + Sync)> {
    values
        .iter()
        .map(|v| match v {
            LabelValue::Int(i) => i as &(dyn ToSql + Sync),
            LabelValue::Text(s) => s as &(dyn ToSql + Sync),
        })
        .collect()
}

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_metric_insert(table: &str, columns: &[&str], fields: &[&str]) -> String {
    let mut names = vec!["ts"];
    names.extend_from_slice(columns);
    names.extend_from_slice(fields);
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        placeholders(1, names.len())
    )
}

fn build_info_upsert(table: &str, columns: &[&str], key: &[&str]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();
    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table,
        columns.join(", "),
        placeholders(1, columns.len()),
        key.join(", "),
        conflict_action
    )
}

fn build_create_metric<L: LabelSet>(table: &str, label: &L, fields: &[&str]) -> String {
    let mut columns = vec!["ts TIMESTAMP NOT NULL".to_string()];
    for (name, value) in L::COLUMNS.iter().zip(label.values()) {
        columns.push(format!("{} {} NOT NULL", name, value.sql_type()));
    }
    for field in fields {
        columns.push(format!("{} DOUBLE PRECISION", field));
    }
    format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", "))
}

fn build_create_info<L: LabelSet>(table: &str, label: &L, key: &[&str]) -> String {
    let mut columns = Vec::new();
    for (name, value) in L::COLUMNS.iter().zip(label.values()) {
        columns.push(format!("{} {} NOT NULL", name, value.sql_type()));
    }
    columns.push(format!("PRIMARY KEY ({})", key.join(", ")));
    format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", "))
}
