//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (initial OAuth flow completion)
//! 2. Token refresh (proactive and request-time refresh)
//!
//! Both operations POST a JSON body to `TOKEN_ENDPOINT` with different grant
//! types. Anthropic's token endpoint requires `application/json`, not the
//! standard OAuth 2.0 form-encoded body — sending form data here is a wire
//! protocol violation the server will reject.

use serde::{Deserialize, Serialize};

use crate::constants::{ANTHROPIC_CLIENT_ID, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when storing
/// the credential.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    pub scope: Option<String>,
    pub subscription_type: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    code_verifier: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    /// Deliberately duplicates `code_verifier`. The vendor's token endpoint
    /// does not otherwise tie the exchange back to the authorization
    /// request; reusing the verifier as `state` is how the original
    /// implementation closes that loop, so this is not a bug to "simplify".
    state: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
}

/// Whether a failed refresh is recoverable by retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The refresh token itself is dead; only re-enrollment will fix it.
    Terminal,
    /// Retrying the same refresh token later may succeed.
    Transient,
}

/// Classify a failed refresh response.
///
/// A 400 whose body mentions `invalid_grant` or `expired` means the refresh
/// token has been revoked or has expired server-side — retrying will never
/// help. Anything else, including a 401 or 403 (clock skew, a load balancer
/// hiccup), is assumed transient and left to the retry loop.
pub fn classify_refresh_failure(status: u16, body: &str) -> RefreshOutcome {
    let lower = body.to_ascii_lowercase();
    if status == 400 && (lower.contains("invalid_grant") || lower.contains("expired")) {
        return RefreshOutcome::Terminal;
    }
    RefreshOutcome::Transient
}

/// Exchange an authorization code for tokens (initial OAuth flow).
///
/// This is the second step of the PKCE flow: the user has authorized in
/// their browser, and we received the authorization code. `state` must be
/// the same string as `verifier` per the vendor's contract (see
/// `ExchangeRequest::state`).
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let body = ExchangeRequest {
        grant_type: "authorization_code",
        code,
        code_verifier: verifier,
        redirect_uri,
        client_id: ANTHROPIC_CLIENT_ID,
        state: verifier,
    };

    let response = client
        .post(TOKEN_ENDPOINT)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {text}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// Called proactively by the background refresh task (before expiration)
/// and reactively at request time (when a token is about to expire).
pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<TokenResponse> {
    let body = RefreshRequest {
        grant_type: "refresh_token",
        refresh_token: refresh,
        client_id: ANTHROPIC_CLIENT_ID,
    };

    let response = client
        .post(TOKEN_ENDPOINT)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        return Err(match classify_refresh_failure(status.as_u16(), &text) {
            RefreshOutcome::Terminal => Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {text}"
            )),
            RefreshOutcome::Transient => {
                Error::TokenExchange(format!("token refresh returned {status}: {text}"))
            }
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes_minimal() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(token.expires_in, 3600);
        assert_eq!(token.scope, None);
    }

    #[test]
    fn token_response_defaults_expires_in_when_absent() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn token_response_tolerates_missing_refresh_token() {
        let json = r#"{"access_token":"at_abc","expires_in":60}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.refresh_token, None);
    }

    #[test]
    fn token_response_carries_scope_and_subscription() {
        let json = r#"{"access_token":"a","refresh_token":"r","expires_in":60,"scope":"user:profile","subscription_type":"pro"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.scope.as_deref(), Some("user:profile"));
        assert_eq!(token.subscription_type.as_deref(), Some("pro"));
    }

    #[test]
    fn exchange_request_serializes_with_duplicated_state() {
        let body = ExchangeRequest {
            grant_type: "authorization_code",
            code: "abc123",
            code_verifier: "verifier-value",
            redirect_uri: "https://example.test/cb",
            client_id: ANTHROPIC_CLIENT_ID,
            state: "verifier-value",
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"state\":\"verifier-value\""));
        assert!(json.contains("\"code_verifier\":\"verifier-value\""));
        assert!(json.contains("\"grant_type\":\"authorization_code\""));
    }

    #[test]
    fn classify_refresh_failure_400_invalid_grant_is_terminal() {
        assert_eq!(
            classify_refresh_failure(400, "{\"error\":\"invalid_grant\"}"),
            RefreshOutcome::Terminal
        );
    }

    #[test]
    fn classify_refresh_failure_400_expired_is_terminal() {
        assert_eq!(
            classify_refresh_failure(400, "token has EXPIRED"),
            RefreshOutcome::Terminal
        );
    }

    #[test]
    fn classify_refresh_failure_400_other_is_transient() {
        assert_eq!(
            classify_refresh_failure(400, "malformed request"),
            RefreshOutcome::Transient
        );
    }

    #[test]
    fn classify_refresh_failure_401_403_are_transient() {
        assert_eq!(classify_refresh_failure(401, ""), RefreshOutcome::Transient);
        assert_eq!(classify_refresh_failure(403, ""), RefreshOutcome::Transient);
    }

    #[test]
    fn classify_refresh_failure_5xx_is_transient() {
        assert_eq!(classify_refresh_failure(500, ""), RefreshOutcome::Transient);
        assert_eq!(classify_refresh_failure(503, ""), RefreshOutcome::Transient);
    }

    #[test]
    fn exchange_uses_correct_endpoint() {
        assert_eq!(
            TOKEN_ENDPOINT,
            "https://console.anthropic.com/v1/oauth/token"
        );
    }

    #[test]
    fn client_id_matches_known_public_client() {
        assert_eq!(ANTHROPIC_CLIENT_ID, "9d1c250a-e61b-44d9-88ed-5944d1962f5e");
    }
}
