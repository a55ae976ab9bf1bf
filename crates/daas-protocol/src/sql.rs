use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Database id that selects a server's master/system database.
pub const MASTER_DATABASE_ID: &str = "master";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default, JsonSchema)]
pub enum SqlErrorKind {
    /// Raised by the database engine while executing T-SQL.
    #[default]
    TSql,
    /// Raised by the proxy or the network between the proxy and the server.
    Infrastructure,
}

impl SqlErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlErrorKind::TSql => "TSql",
            SqlErrorKind::Infrastructure => "Infrastructure",
        }
    }
}

impl fmt::Display for SqlErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct SqlError {
    pub kind: SqlErrorKind,
    pub message: String,
    #[serde(default)]
    pub class: u8,
    #[serde(default)]
    pub number: i32,
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub state: u8,
    #[serde(default)]
    pub line_number: i32,
}

impl SqlError {
    pub fn tsql(number: i32, line_number: i32, message: impl Into<String>) -> Self {
        Self {
            kind: SqlErrorKind::TSql,
            message: message.into(),
            number,
            line_number,
            ..Self::default()
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            kind: SqlErrorKind::Infrastructure,
            message: message.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SqlErrorKind::TSql => write!(
                f,
                "[{}] Error on line {} ({}): {}",
                self.kind, self.line_number, self.number, self.message
            ),
            SqlErrorKind::Infrastructure => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Subset of SQL Server parameter types the provisioner binds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum SqlDbType {
    NVarChar,
    VarChar,
    Int,
    BigInt,
    Bit,
    UniqueIdentifier,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    pub name: String,
    pub data_type: SqlDbType,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i32,
    #[serde(default)]
    pub value: Option<Value>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl Parameter {
    pub fn nvarchar(name: impl Into<String>, size: i32, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: SqlDbType::NVarChar,
            size,
            value: Some(Value::String(value.into())),
        }
    }
}

/// Body posted to the proxy's command and query endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct SqlRequest {
    pub server_id: String,
    pub database_id: String,
    #[serde(default)]
    pub sql: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub execute_as_admin_user: bool,
}

impl SqlRequest {
    pub fn new(
        server_id: impl Into<String>,
        database_id: impl Into<String>,
        sql: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            database_id: database_id.into(),
            sql: sql.into_iter().collect(),
            parameters: Vec::new(),
            execute_as_admin_user: false,
        }
    }

    pub fn with_parameters(mut self, parameters: impl IntoIterator<Item = Parameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn as_admin(mut self) -> Self {
        self.execute_as_admin_user = true;
        self
    }

    pub fn targets_master(&self) -> bool {
        self.database_id == MASTER_DATABASE_ID
    }
}

/// Outcome of a non-query batch.
///
/// There is deliberately no `success` field: success is whatever
/// [`CommandResult::success`] says about the current error list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct CommandResult {
    #[serde(default)]
    pub result_code: i32,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub errors: Vec<SqlError>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub type ResultRow = BTreeMap<String, Value>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct ResultSet {
    #[serde(default)]
    pub rows: Vec<ResultSetRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct ResultSetRow {
    #[serde(default)]
    pub columns: ResultRow,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct QueryResult {
    #[serde(default)]
    pub result_code: i32,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub errors: Vec<SqlError>,
    #[serde(default)]
    pub result_sets: Vec<ResultSet>,
}

impl QueryResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Rows of the first result set; empty when the batch produced none.
    pub fn first_rows(&self) -> &[ResultSetRow] {
        self.result_sets
            .first()
            .map(|set| set.rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn into_command_result(self) -> CommandResult {
        CommandResult {
            result_code: self.result_code,
            messages: self.messages,
            errors: self.errors,
        }
    }
}
