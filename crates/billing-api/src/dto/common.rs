//! Common DTOs used across the API

use serde::{Deserialize, Serialize};

/// Liveness response for `GET /`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}
