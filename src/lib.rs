//! Sales ingestion pipeline: turns a caller-supplied Arrow sales upload
//! into normalized entities inside a generic EAV schema in Postgres, with
//! deterministic identifiers, address canonicalization, dynamic
//! column-to-attribute binding, balanced chunking, and idempotent
//! re-execution.

pub mod address;
pub mod arrow_io;
pub mod chunks;
pub mod cleanup;
pub mod db;
pub mod eav;
pub mod ids;
pub mod infer;
pub mod payload;
pub mod pipeline;
pub mod schema;
pub mod staging;
pub mod tracing;

pub mod util {
    pub mod env;
}
