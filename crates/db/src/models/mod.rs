//! Domain model structs and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` entity struct
//! matching the database row plus the `Deserialize` DTOs used to create
//! and query it.

pub mod job;
pub mod status;
