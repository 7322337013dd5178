//! Pricing Cache
//!
//! Lock-free reads from a `DashMap`. A miss or an expired entry triggers a
//! catalog refresh; each refreshed entry is an independent upsert, so
//! writers resolve by last write wins. When the catalog is unreachable a
//! stale entry is still served.
//!
//! Only one refresh runs at a time; callers that waited on it reuse its
//! result. Models the catalog did not list are remembered for one TTL so
//! repeated lookups do not refetch it.

use crate::money::parse_decimal;
use crate::pricing::catalog::{CatalogError, CatalogSource};
use crate::pricing::models::ModelPrice;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum PricingError {
    /// Catalog reachable, model not listed
    #[error("unknown model: {0}")]
    UnknownModel(String),
    /// Catalog unreachable and nothing cached
    #[error("pricing unavailable for {model}: {source}")]
    Unavailable {
        model: String,
        #[source]
        source: CatalogError,
    },
    #[error("catalog refresh failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served from cache within the TTL
    Cached,
    /// Just fetched from the catalog
    Refreshed,
    /// Expired entry served because the catalog was unreachable
    Stale,
}

#[derive(Debug, Clone)]
pub struct PriceLookup {
    pub price: ModelPrice,
    pub freshness: Freshness,
}

impl PriceLookup {
    /// True only when the price was fetched for this lookup
    pub fn fresh(&self) -> bool {
        self.freshness == Freshness::Refreshed
    }
}

#[derive(sqlx::FromRow)]
struct ModelPriceRow {
    model_id: String,
    provider: String,
    display_name: String,
    context_length: Option<i64>,
    prompt_price: String,
    completion_price: String,
    fetched_at: DateTime<Utc>,
    is_active: bool,
}

impl ModelPriceRow {
    fn into_price(self) -> Option<ModelPrice> {
        Some(ModelPrice {
            prompt_price_per_token: parse_decimal(&self.prompt_price).ok()?,
            completion_price_per_token: parse_decimal(&self.completion_price).ok()?,
            model_id: self.model_id,
            provider: self.provider,
            display_name: self.display_name,
            context_length: self.context_length,
            fetched_at: self.fetched_at,
            is_active: self.is_active,
        })
    }
}

pub struct PricingCache {
    entries: DashMap<String, ModelPrice>,
    /// Model ids missing from the last successful refresh, with when that was seen
    unknown: DashMap<String, DateTime<Utc>>,
    /// Held for the duration of a refresh; holds the last successful refresh time
    last_refresh: Mutex<Option<DateTime<Utc>>>,
    source: Arc<dyn CatalogSource>,
    /// Write-through persistence; absent in pure in-memory use
    store: Option<SqlitePool>,
    ttl: chrono::Duration,
}

impl PricingCache {
    pub fn new(source: Arc<dyn CatalogSource>, store: Option<SqlitePool>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            unknown: DashMap::new(),
            last_refresh: Mutex::new(None),
            source,
            store,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Price for `model_id`, refreshing from the catalog when missing or expired
    pub async fn get_price(&self, model_id: &str) -> Result<PriceLookup, PricingError> {
        if let Some(lookup) = self.cached(model_id) {
            return Ok(lookup);
        }
        if self.known_unknown(model_id) {
            return Err(PricingError::UnknownModel(model_id.to_string()));
        }

        let waiting_since = Utc::now();
        let mut last_refresh = self.last_refresh.lock().await;

        // Another caller refreshed while this one waited
        if last_refresh.is_some_and(|at| at >= waiting_since) {
            return match self.cached(model_id) {
                Some(lookup) => Ok(PriceLookup {
                    freshness: Freshness::Refreshed,
                    ..lookup
                }),
                None => Err(PricingError::UnknownModel(model_id.to_string())),
            };
        }

        let cached = self.entries.get(model_id).map(|entry| entry.value().clone());

        match self.refresh_locked(&mut last_refresh).await {
            Ok(_) => match self.entries.get(model_id) {
                Some(entry) if entry.is_active => Ok(PriceLookup {
                    price: entry.value().clone(),
                    freshness: Freshness::Refreshed,
                }),
                _ => {
                    self.unknown.insert(model_id.to_string(), Utc::now());
                    Err(PricingError::UnknownModel(model_id.to_string()))
                }
            },
            Err(PricingError::Catalog(source)) => match cached {
                Some(price) if price.is_active => {
                    warn!(
                        model = %model_id,
                        fetched_at = %price.fetched_at,
                        error = %source,
                        "⚠️  Catalog unreachable, serving stale price"
                    );
                    Ok(PriceLookup {
                        price,
                        freshness: Freshness::Stale,
                    })
                }
                _ => Err(PricingError::Unavailable {
                    model: model_id.to_string(),
                    source,
                }),
            },
            Err(e) => Err(e),
        }
    }

    fn cached(&self, model_id: &str) -> Option<PriceLookup> {
        let price = self.entries.get(model_id)?.value().clone();
        if price.is_active && price.is_fresh(self.ttl, Utc::now()) {
            Some(PriceLookup {
                price,
                freshness: Freshness::Cached,
            })
        } else {
            None
        }
    }

    fn known_unknown(&self, model_id: &str) -> bool {
        self.unknown
            .get(model_id)
            .is_some_and(|seen_at| Utc::now() - *seen_at < self.ttl)
    }

    /// Fetch the whole catalog and upsert every entry. Models that vanished
    /// from the catalog are marked inactive. Returns the number of prices stored.
    pub async fn refresh_all(&self) -> Result<usize, PricingError> {
        let mut last_refresh = self.last_refresh.lock().await;
        self.refresh_locked(&mut last_refresh).await
    }

    async fn refresh_locked(&self, last_refresh: &mut Option<DateTime<Utc>>) -> Result<usize, PricingError> {
        let prices = self.source.fetch_catalog().await?;
        let count = prices.len();

        let listed: HashSet<String> = prices.iter().map(|p| p.model_id.clone()).collect();

        self.persist_all(&prices).await;
        for price in prices {
            self.entries.insert(price.model_id.clone(), price);
        }

        let delisted: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_active && !listed.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for model_id in &delisted {
            if let Some(mut entry) = self.entries.get_mut(model_id) {
                entry.is_active = false;
            }
            if let Some(pool) = &self.store {
                if let Err(e) = sqlx::query("UPDATE model_prices SET is_active = 0 WHERE model_id = ?")
                    .bind(model_id)
                    .execute(pool)
                    .await
                {
                    error!(model = %model_id, error = %e, "Failed to deactivate model price");
                }
            }
        }

        self.unknown.retain(|model_id, _| !listed.contains(model_id));
        *last_refresh = Some(Utc::now());

        info!(models = count, delisted = delisted.len(), "Pricing catalog refreshed");
        Ok(count)
    }

    /// Upsert a refreshed catalog in one transaction
    async fn persist_all(&self, prices: &[ModelPrice]) {
        let Some(pool) = &self.store else {
            return;
        };

        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "Failed to start pricing transaction");
                return;
            }
        };
        for price in prices {
            if let Err(e) = upsert_price(&mut *tx, price).await {
                error!(model = %price.model_id, error = %e, "Failed to persist model price");
            }
        }
        if let Err(e) = tx.commit().await {
            error!(error = %e, "Failed to commit model prices");
        }
    }

    /// Upsert a single entry, bypassing the catalog
    pub async fn insert(&self, price: ModelPrice) -> Result<(), PricingError> {
        if let Some(pool) = &self.store {
            upsert_price(pool, &price).await?;
        }
        self.unknown.remove(&price.model_id);
        self.entries.insert(price.model_id.clone(), price);
        Ok(())
    }

    /// Warm the cache from persisted prices. Returns how many were loaded.
    pub async fn load_from_store(&self) -> Result<usize, PricingError> {
        let Some(pool) = &self.store else {
            return Ok(0);
        };

        let rows = sqlx::query_as::<_, ModelPriceRow>(
            r#"
            SELECT model_id, provider, display_name, context_length,
                   prompt_price, completion_price, fetched_at, is_active
            FROM model_prices
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut loaded = 0;
        for row in rows {
            let model_id = row.model_id.clone();
            match row.into_price() {
                Some(price) => {
                    self.entries.insert(model_id, price);
                    loaded += 1;
                }
                None => warn!(model = %model_id, "Skipping stored price with unparseable amount"),
            }
        }

        info!("Loaded {} model prices into cache", loaded);
        Ok(loaded)
    }

    /// Active prices, sorted by model id
    pub fn list_active(&self) -> Vec<ModelPrice> {
        let mut prices: Vec<ModelPrice> = self
            .entries
            .iter()
            .filter(|entry| entry.is_active)
            .map(|entry| entry.value().clone())
            .collect();
        prices.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        prices
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically re-sync the whole catalog
    pub fn spawn_refresher(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting pricing refresher (interval: {:?})", interval);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; startup already handled it
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_all().await {
                    error!("Pricing refresh failed: {}", e);
                }
            }
        })
    }
}

async fn upsert_price<'e, E>(executor: E, price: &ModelPrice) -> Result<(), sqlx::Error>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO model_prices (
            model_id, provider, display_name, context_length,
            prompt_price, completion_price, fetched_at, is_active
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(model_id) DO UPDATE SET
            provider = excluded.provider,
            display_name = excluded.display_name,
            context_length = excluded.context_length,
            prompt_price = excluded.prompt_price,
            completion_price = excluded.completion_price,
            fetched_at = excluded.fetched_at,
            is_active = excluded.is_active
        "#,
    )
    .bind(&price.model_id)
    .bind(&price.provider)
    .bind(&price.display_name)
    .bind(price.context_length)
    .bind(price.prompt_price_per_token.to_string())
    .bind(price.completion_price_per_token.to_string())
    .bind(price.fetched_at)
    .bind(price.is_active)
    .execute(executor)
    .await?;

    Ok(())
}
