use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Successful answer of the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Issue time, seconds since the epoch
    pub created_at: i64,
    /// Lifetime of the access token in seconds
    pub expires_in: i64,
}

/// Body of a non-2xx answer of the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl std::fmt::Display for OAuthErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => f.write_str(&self.error),
        }
    }
}

/// Persisted credentials.
///
/// `expires` is the absolute instant (epoch millis) at which the access
/// token stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    pub expires: i64,
}

impl TokenData {
    /// Build stored credentials from an endpoint answer received at `now`.
    ///
    /// The expiry is anchored on the server's `created_at`; if that lands at
    /// or before `now` (skewed clock, replayed answer) it is anchored on `now`
    /// instead so a freshly stored token is never already expired.
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let lifetime_ms = response.expires_in.max(0).saturating_mul(1000);
        let server_expiry = response
            .created_at
            .saturating_mul(1000)
            .saturating_add(lifetime_ms);
        let now_ms = now.timestamp_millis();
        let expires = if server_expiry > now_ms {
            server_expiry
        } else {
            now_ms.saturating_add(lifetime_ms)
        };

        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        from_millis(self.expires)
    }

    /// True while the token stays valid for at least `margin` past `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now.timestamp_millis() < self.expires.saturating_sub(margin.num_milliseconds())
    }

    /// Instant at which the token should be refreshed.
    pub fn refresh_due_at(&self, margin: Duration) -> DateTime<Utc> {
        from_millis(self.expires.saturating_sub(margin.num_milliseconds()))
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(created_at: i64, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            created_at,
            expires_in,
        }
    }

    #[test]
    fn expiry_is_created_at_plus_lifetime_in_millis() {
        let now = Utc::now();
        let created_at = now.timestamp();
        let token = TokenData::from_response(response(created_at, 7200), now);
        assert_eq!(token.expires, (created_at + 7200) * 1000);
    }

    #[test]
    fn stale_created_at_is_anchored_on_now() {
        let now = Utc::now();
        let token = TokenData::from_response(response(now.timestamp() - 10_000, 7200), now);
        assert!(token.expires > now.timestamp_millis());
        assert_eq!(token.expires, now.timestamp_millis() + 7_200_000);
    }

    #[test]
    fn freshness_respects_margin() {
        let now = Utc::now();
        let token = TokenData {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires: (now + Duration::seconds(90)).timestamp_millis(),
        };
        assert!(token.is_fresh(now, Duration::seconds(60)));
        assert!(!token.is_fresh(now, Duration::seconds(120)));
    }

    #[test]
    fn token_data_uses_camel_case_keys() {
        let token = TokenData {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires: 42,
        };
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["accessToken"], "a");
        assert_eq!(json["refreshToken"], "r");
        assert_eq!(json["expires"], 42);
    }
}
