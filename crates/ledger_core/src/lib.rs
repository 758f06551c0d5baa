pub mod api;
pub mod error;
pub mod health;
pub mod ids;
pub mod model;
pub mod normalize;
pub mod time;

pub use api::*;
pub use error::{LedgerError, LedgerResult};
pub use health::{BreakerSnapshot, BreakerState, LedgerHealth, PoolHealth};
pub use ids::*;
pub use model::*;
pub use normalize::{
    NormalizedLicense, address_overlap, address_tokens, display_name, normalize_license,
    normalize_name, normalize_optional_license,
};
pub use time::*;
