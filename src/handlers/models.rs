use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::handlers::chat_completions::AppState;
use crate::pricing::ModelPrice;

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<i64>,
    pub pricing: ModelPricing,
}

/// Upstream prices per token, as decimal strings
#[derive(Debug, Serialize)]
pub struct ModelPricing {
    pub prompt: String,
    pub completion: String,
}

impl From<&ModelPrice> for ModelObject {
    fn from(price: &ModelPrice) -> Self {
        Self {
            id: price.model_id.clone(),
            object: "model",
            created: price.fetched_at.timestamp(),
            owned_by: price.provider.clone(),
            name: price.display_name.clone(),
            context_length: price.context_length,
            pricing: ModelPricing {
                prompt: price.prompt_price_per_token.normalize().to_string(),
                completion: price.completion_price_per_token.normalize().to_string(),
            },
        }
    }
}

/// Handle /v1/models endpoint
/// Lists every active model the pricing cache knows a price for
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let data = state.pricing.list_active().iter().map(ModelObject::from).collect();

    Json(ModelsResponse { object: "list", data })
}
