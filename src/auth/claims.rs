use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID). Tokens issued with an `id` claim are accepted too.
    #[serde(alias = "id")]
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
    /// Additional custom claims
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_claim_alias() {
        let claims: Claims =
            serde_json::from_str(r#"{"id":"64f0c2","exp":4102444800,"iat":1700000000}"#).unwrap();
        assert_eq!(claims.user_id(), "64f0c2");
    }
}
