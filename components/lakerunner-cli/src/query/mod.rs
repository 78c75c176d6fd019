pub mod query;
pub mod time_range;

pub use query::{
    BaseExpr, Filter, FilterOp, GraphRequest, LogFilterArgs, QueryClause, QueryError, QueryParams,
};
pub use time_range::TimeRange;
