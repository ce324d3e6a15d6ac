//! Postgres-backed Stream Engine and Schema Deployer (`spec.md` §4.1, §4.2).

pub mod engine;
pub mod options;
pub mod row;
pub mod schema;

pub use engine::{PgStreamEngine, StreamEngine, StreamStats, VisibilityScanner};
pub use options::{FetchBackoff, FetchOptions, PublishOptions};
pub use row::{FetchedMessage, StreamRow};
pub use schema::{deploy, deploy_sql};
