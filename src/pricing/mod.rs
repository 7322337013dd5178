pub mod cache;
pub mod calculator;
pub mod catalog;
pub mod estimate;
pub mod models;

pub use cache::{Freshness, PriceLookup, PricingCache, PricingError};
pub use calculator::{CostBreakdown, CostSource, TierParameters, Usage};
pub use catalog::{CatalogError, CatalogSource, OpenRouterCatalog};
pub use models::ModelPrice;
