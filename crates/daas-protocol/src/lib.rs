//! Wire contracts spoken between the provisioner, the SQL/document proxy, and
//! the metrics endpoint.

pub mod prometheus;
pub mod sql;

pub use prometheus::{
    from_ticks, to_ticks, CodecError, InstantSample, PrometheusValue, QueryData, QueryError,
    QueryResponse, QueryStatus, RangeSeries,
};
pub use sql::{
    CommandResult, Parameter, QueryResult, ResultRow, ResultSet, ResultSetRow, SqlDbType,
    SqlError, SqlErrorKind, SqlRequest, MASTER_DATABASE_ID,
};
