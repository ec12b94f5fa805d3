//! Control-plane access.
//!
//! The daemon talks to Home Assistant through three REST endpoints:
//! * `GET /api/states/{entity}` for a single entity
//! * `GET /api/states` for auto-discovery at startup
//! * `POST /api/services/{domain}/{service}` for every side effect
//!
//! [`ControlPlane`] abstracts over these so that the coordinators can be
//! exercised against a recording double in tests. The provided methods wrap
//! the handful of services the daemon uses.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    config::{Config, Entities},
    error::Result,
    http::Client as HttpClient,
};

/// State and attributes of one control-plane entity.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state == "playing"
    }

    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(Value::as_f64)
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Reads a single entity.
    async fn state(&self, entity_id: &str) -> Result<EntityState>;

    /// Reads every entity.
    async fn states(&self) -> Result<Vec<EntityState>>;

    /// Invokes a service with a JSON object as service data.
    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()>;

    /// Forces the integration behind `entity_id` to poll its source now.
    async fn update_entity(&self, entity_id: &str) -> Result<()> {
        self.call_service(
            "homeassistant",
            "update_entity",
            json!({ "entity_id": entity_id }),
        )
        .await
    }

    async fn media_pause(&self, entity_id: &str) -> Result<()> {
        self.call_service("media_player", "media_pause", json!({ "entity_id": entity_id }))
            .await
    }

    async fn media_play(&self, entity_id: &str) -> Result<()> {
        self.call_service("media_player", "media_play", json!({ "entity_id": entity_id }))
            .await
    }

    /// Sets an `input_text`, truncated to the 255 characters it accepts.
    async fn set_text(&self, entity_id: &str, value: &str) -> Result<()> {
        let value: String = value.chars().take(255).collect();
        self.call_service(
            "input_text",
            "set_value",
            json!({ "entity_id": entity_id, "value": value }),
        )
        .await
    }

    async fn turn_on(&self, entity_id: &str) -> Result<()> {
        self.call_service("input_boolean", "turn_on", json!({ "entity_id": entity_id }))
            .await
    }

    async fn turn_off(&self, entity_id: &str) -> Result<()> {
        self.call_service("input_boolean", "turn_off", json!({ "entity_id": entity_id }))
            .await
    }

    /// Navigates the display to `path`, optionally reverting to the default
    /// view by itself after `revert`.
    async fn navigate(&self, device: &str, path: &str, revert: Option<Duration>) -> Result<()> {
        let mut data = json!({ "device": device, "path": path });
        if let Some(revert) = revert {
            data["revert_timeout"] = json!(revert.as_secs());
        }
        self.call_service("view_assist", "navigate", data).await
    }
}

/// Home Assistant REST API client.
pub struct HomeAssistant {
    http_client: HttpClient,
}

impl HomeAssistant {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built from `config`,
    /// including when it carries no token.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
        })
    }
}

#[async_trait]
impl ControlPlane for HomeAssistant {
    async fn state(&self, entity_id: &str) -> Result<EntityState> {
        let url = self.http_client.url(&format!("api/states/{entity_id}"))?;
        let response = self.http_client.execute(self.http_client.get(url)).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(Into::into)
    }

    async fn states(&self) -> Result<Vec<EntityState>> {
        let url = self.http_client.url("api/states")?;
        let response = self.http_client.execute(self.http_client.get(url)).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(Into::into)
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()> {
        let url = self
            .http_client
            .url(&format!("api/services/{domain}/{service}"))?;
        let body = serde_json::to_vec(&data)?;
        trace!("{domain}.{service}: {data}");

        // The response lists changed states, which nothing here needs.
        self.http_client
            .execute(self.http_client.post(url, body))
            .await
            .map(|_| ())
    }
}

/// Substitutes configured entity ids that do not exist on the control plane
/// with the first plausible candidate.
///
/// Discovery is best effort: entities without a candidate keep their
/// configured id.
pub fn discover(entities: &mut Entities, states: &[EntityState]) {
    let exists = |id: &str| states.iter().any(|state| state.entity_id == id);
    let find = |prefix: &str, hint: &str, exclude: &str| {
        states
            .iter()
            .map(|state| state.entity_id.as_str())
            .find(|id| id.starts_with(prefix) && id.contains(hint) && *id != exclude)
            .map(ToOwned::to_owned)
    };

    if !exists(&entities.monitored) {
        match find("media_player.", "spotify", "") {
            Some(id) => {
                info!("monitored entity {} not found, using {id}", entities.monitored);
                entities.monitored = id;
            }
            None => warn!("monitored entity {} not found", entities.monitored),
        }
    }

    if !exists(&entities.satellite) {
        match find("assist_satellite.", "", "") {
            Some(id) => {
                info!("satellite entity {} not found, using {id}", entities.satellite);
                entities.satellite = id;
            }
            None => warn!("satellite entity {} not found", entities.satellite),
        }
    }

    if !exists(&entities.secondary) {
        match find("media_player.", "mediaplayer", &entities.monitored) {
            Some(id) => {
                info!("secondary entity {} not found, using {id}", entities.secondary);
                entities.secondary = id;
            }
            None => warn!("secondary entity {} not found", entities.secondary),
        }
    }
}
