//! Change-notification trigger definition and idempotent installation.
//!
//! Installation runs two kinds of statements:
//!
//! 1. the trigger function definition (`post_change_notify_trigger()`),
//! 2. one `CREATE TRIGGER "post_change_notify"` per watched table.
//!
//! Both are expected to fail on an already instrumented database ("already
//! exists"). Such failures are logged and swallowed; one table failing never
//! stops the others, and nothing is retried.

use futures_util::future::join_all;
use once_cell::sync::Lazy;
use pgcache_core::InstallError;
use regex::Regex;

use crate::transport::{quote_ident, SqlExecutor};

/// Name of the trigger function every per-table trigger executes.
pub const TRIGGER_FUNCTION_NAME: &str = "post_change_notify_trigger";

/// Name of the per-table trigger.
pub const TRIGGER_NAME: &str = "post_change_notify";

/// Built-in trigger function.
///
/// Emits `{timestamp, operation, schema, table, record}` as JSON through
/// `PG_NOTIFY` on a channel named after the table. `record` is the new row for
/// INSERT/UPDATE and the old row for DELETE, with every column as text.
pub const DEFAULT_TRIGGER_DEFINITION: &str = r#"CREATE FUNCTION post_change_notify_trigger()
RETURNS TRIGGER
LANGUAGE plpgsql
AS $$
DECLARE
    rec RECORD;
    payload TEXT;
    payload_items TEXT[];
    column_names TEXT[];
    column_name TEXT;
    column_value TEXT;
    channel CHARACTER VARYING(255);
BEGIN
    channel := TG_TABLE_NAME;

    CASE TG_OP
        WHEN 'INSERT', 'UPDATE' THEN rec := NEW;
        WHEN 'DELETE' THEN rec := OLD;
        ELSE RAISE EXCEPTION 'NOTIFY: Invalid operation "%"!', TG_OP;
    END CASE;

    SELECT array_agg("c"."column_name"::TEXT)
    INTO column_names
    FROM "information_schema"."columns" AS "c"
    WHERE "c"."table_name" = TG_TABLE_NAME
      AND "c"."table_schema" = TG_TABLE_SCHEMA;

    FOREACH column_name IN ARRAY column_names
    LOOP
        EXECUTE FORMAT('SELECT $1.%I::TEXT', column_name)
            INTO column_value
            USING rec;

        payload_items := ARRAY_CAT(
            payload_items,
            ARRAY [column_name, column_value]
        );
    END LOOP;

    payload := json_build_object(
        'timestamp', CURRENT_TIMESTAMP,
        'operation', TG_OP,
        'schema', TG_TABLE_SCHEMA,
        'table', TG_TABLE_NAME,
        'record', TO_JSON(JSON_OBJECT(payload_items))
    );

    PERFORM PG_NOTIFY(channel, payload);

    RETURN rec;
END;
$$;
"#;

static TRIGGER_SHAPE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"(?is)\bcreate\s+(?:or\s+replace\s+)?function\s+(?:"?[a-z_][a-z0-9_]*"?\s*\.\s*)?"?post_change_notify_trigger"?\s*\([^)]*\).*?returns\s+trigger\b"#,
    )
    .ok()
});

/// Whether a custom definition has the required shape: it must create a
/// function named `post_change_notify_trigger` returning `trigger`. Case and
/// whitespace are ignored, `OR REPLACE` is allowed, and the statement may be
/// preceded by other SQL such as comments or `BEGIN;`.
pub fn is_valid_trigger_definition(sql: &str) -> bool {
    TRIGGER_SHAPE
        .as_ref()
        .map(|rx| rx.is_match(sql))
        .unwrap_or(false)
}

/// Trigger function SQL, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDefinition {
    sql: String,
    custom: bool,
}

impl TriggerDefinition {
    /// Use `custom` if it has the required shape, otherwise the built-in
    /// default. The substitution is silent apart from a debug line.
    pub fn resolve(custom: Option<&str>) -> Self {
        match custom {
            Some(sql) if is_valid_trigger_definition(sql) => Self {
                sql: sql.to_string(),
                custom: true,
            },
            Some(_) => {
                tracing::debug!("custom trigger definition rejected, using built-in default");
                Self::default()
            }
            None => Self::default(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether a caller-supplied definition was accepted.
    pub fn is_custom(&self) -> bool {
        self.custom
    }
}

impl Default for TriggerDefinition {
    fn default() -> Self {
        Self {
            sql: DEFAULT_TRIGGER_DEFINITION.to_string(),
            custom: false,
        }
    }
}

/// Statement binding the notify trigger to one table.
pub fn create_trigger_sql(table: &str) -> String {
    format!(
        "CREATE TRIGGER {trigger}\n    AFTER INSERT OR UPDATE OR DELETE\n    ON {table}\n    FOR EACH ROW\nEXECUTE PROCEDURE {function}()",
        trigger = quote_ident(TRIGGER_NAME),
        table = quote_ident(table),
        function = TRIGGER_FUNCTION_NAME,
    )
}

/// Outcome of one installation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Whether the function statement succeeded on this pass.
    pub function_installed: bool,
    /// Tables attempted, in input order.
    pub attempted: Vec<String>,
    /// Tables whose trigger statement succeeded on this pass.
    pub installed: Vec<String>,
    /// Swallowed failures, function first then per table.
    pub failures: Vec<InstallError>,
}

impl InstallReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Installs the trigger function and per-table triggers.
#[derive(Debug, Clone, Default)]
pub struct TriggerInstaller {
    definition: TriggerDefinition,
}

impl TriggerInstaller {
    pub fn new(definition: TriggerDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &TriggerDefinition {
        &self.definition
    }

    /// Run one installation pass. Never fails; see [`InstallReport`].
    pub async fn install<E>(&self, executor: &E, tables: &[String]) -> InstallReport
    where
        E: SqlExecutor + ?Sized,
    {
        let mut report = InstallReport {
            attempted: tables.to_vec(),
            ..Default::default()
        };

        match executor.execute(self.definition.sql()).await {
            Ok(()) => {
                report.function_installed = true;
                tracing::debug!(function = TRIGGER_FUNCTION_NAME, "trigger function created");
            }
            Err(err) => {
                tracing::debug!(function = TRIGGER_FUNCTION_NAME, error = %err, "create trigger function errored");
                report.failures.push(InstallError::FunctionFailed {
                    reason: err.to_string(),
                });
            }
        }

        let results = join_all(tables.iter().map(|table| async move {
            let outcome = executor.execute(&create_trigger_sql(table)).await;
            (table, outcome)
        }))
        .await;

        for (table, outcome) in results {
            match outcome {
                Ok(()) => {
                    tracing::debug!(table = %table, "trigger created");
                    report.installed.push(table.clone());
                }
                Err(err) => {
                    tracing::debug!(table = %table, error = %err, "create trigger errored");
                    report.failures.push(InstallError::TriggerFailed {
                        table: table.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        report
    }
}
