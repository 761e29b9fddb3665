//! # Error Logging Module
//!
//! This module provides error logging with database persistence. It captures
//! guard and delegate failures, stores them in the `error_logs` table for
//! later analysis, and logs them through the tracing system for immediate
//! visibility.
//!
//! ## Features
//!
//! - **Database Persistence**: Store errors for later analysis
//! - **Tracing Integration**: Standard tracing::error! for immediate logging
//! - **Non-blocking**: The insert runs on a spawned task, off the request path
//! - **Automatic Cleanup**: Background cleanup of old error records

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::error;
use uuid::Uuid;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Error severity levels for database storage
#[derive(Debug, Clone)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Error conditions that should be investigated
    Error,
    /// Warning conditions that may lead to errors
    Warning,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Warning => "warning",
        }
    }
}

/// Request context attached to an error record.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub path: Option<String>,
    pub method: Option<String>,
    pub identity: Option<String>,
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, method: String, path: String) -> Self {
        self.method = Some(method);
        self.path = Some(path);
        self
    }

    pub fn with_identity(mut self, identity: String) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Serialize context to JSON string for database storage
    pub fn to_json(&self) -> String {
        let mut context = json!({});

        if let Some(ref path) = self.path {
            context["path"] = json!(path);
        }
        if let Some(ref method) = self.method {
            context["method"] = json!(method);
        }
        if let Some(ref identity) = self.identity {
            context["identity"] = json!(identity);
        }
        if let Some(ref request_id) = self.request_id {
            context["request_id"] = json!(request_id);
        }

        context.to_string()
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Log an error to both the tracing system and the database.
///
/// The tracing line is emitted immediately; the database insert happens on a
/// spawned task so request handling never waits on it. Use the `file!()`,
/// `line!()` and `function_name!()` macros at the call site.
pub async fn log_error_async(
    pool: &SqlitePool,
    severity: ErrorSeverity,
    message: String,
    context: Option<ErrorContext>,
    file: &str,
    line: u32,
    function: Option<String>,
) {
    error!(
        target: "turnstile::error_logging",
        file = file,
        line = line,
        function = function.as_deref().unwrap_or("unknown"),
        severity = severity.as_str(),
        "{}",
        message
    );

    let pool_clone = pool.clone();
    let severity_str = severity.as_str().to_string();
    let context_json = context.map(|c| c.to_json());
    let file_str = file.to_string();
    let function_str = function;

    tokio::spawn(async move {
        if let Err(e) = store_error_in_database(
            &pool_clone,
            &message,
            &severity_str,
            context_json.as_deref(),
            &file_str,
            line,
            function_str.as_deref(),
        )
        .await
        {
            // If we can't store in database, at least log this failure
            error!(
                target: "turnstile::error_logging",
                "Failed to store error in database: {}. Original error: {}",
                e,
                message
            );
        }
    });
}

/// Store error information in the database
async fn store_error_in_database(
    pool: &SqlitePool,
    message: &str,
    severity: &str,
    context: Option<&str>,
    file: &str,
    line: u32,
    function: Option<&str>,
) -> Result<(), sqlx::Error> {
    let error_id = Uuid::new_v4().to_string();
    let timestamp = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO error_logs
         (id, error_message, severity, context, file_location, line_number, function_name, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&error_id)
    .bind(message)
    .bind(severity)
    .bind(context)
    .bind(file)
    .bind(line as i64)
    .bind(function)
    .bind(&timestamp)
    .execute(pool)
    .await?;

    Ok(())
}

/// Clean up error logs older than the specified number of days, returning
/// the number of deleted records. Called by the background cleanup task.
pub async fn cleanup_old_error_logs(
    pool: &SqlitePool,
    retention_days: u32,
) -> Result<u64, sqlx::Error> {
    let cutoff_date = Utc::now()
        .checked_sub_signed(chrono::Duration::days(retention_days as i64))
        .unwrap_or_else(Utc::now)
        .to_rfc3339();

    let result = sqlx::query("DELETE FROM error_logs WHERE created_at < ?")
        .bind(&cutoff_date)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
