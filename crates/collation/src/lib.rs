//! Total ordering over JSON values, canonical serialization, and the
//! SQLite hooks (collation + scalar functions) which expose both to SQL.

mod compare;
mod normalize;
mod sqlite;

pub use compare::{value_cmp, value_cmp_serialized};
pub use normalize::{normalize, to_canonical_string};
pub use sqlite::{install, COLLATION_NAME, FN_FIELD_MATCHES, FN_PID_CONTAINS};
