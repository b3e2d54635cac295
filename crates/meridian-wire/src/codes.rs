//! Meridian error-code constants
//!
//! The closed set of `errorCode` values the runtime reacts to. Anything
//! not listed here propagates to the caller unclassified.

/// Session token invalid or expired.
pub const INVALID_TOKEN: &str = "errors.com.meridian.common.oauth.invalid_token";

/// Token failed server-side verification (rotated signing key, revoked).
pub const TOKEN_VERIFICATION_FAILED: &str =
    "errors.com.meridian.common.authentication.token_verification_failed";

/// Batch gateway's unauthorized marker (it has no envelope of its own).
pub const GATEWAY_UNAUTHORIZED: &str = "error.gateway.401";

/// Rate limit / capacity throttle. With a Retry-After it is a rate
/// limit; without one the service is shedding load.
pub const THROTTLED: &str = "errors.com.meridian.common.throttled";

/// Generic server-side failure, safe to retry.
pub const SERVER_ERROR: &str = "errors.com.meridian.common.server_error";

/// Optimistic-concurrency conflict, safe to retry.
pub const CONCURRENT_MODIFICATION: &str =
    "errors.com.meridian.common.concurrent_modification_error";

/// Wrong username/password/device secret.
pub const INVALID_ACCOUNT_CREDENTIALS: &str =
    "errors.com.meridian.account.invalid_account_credentials";

/// Login requires a second factor; the envelope metadata names the method.
pub const SECOND_FACTOR_REQUIRED: &str =
    "errors.com.meridian.common.two_factor_authentication.required";

/// Second-factor code rejected.
pub const SECOND_FACTOR_CODE_INVALID: &str =
    "errors.com.meridian.accountportal.second_factor_code_invalid";

/// Portal-side input validation failure (also covers malformed 2fa codes).
pub const PORTAL_VALIDATION: &str = "errors.com.meridian.accountportal.validation";

/// Portal enforced a captcha on this login.
pub const CAPTCHA_INVALID: &str = "errors.com.meridian.accountportal.captcha_invalid";

/// One-time exchange code unknown or already consumed.
pub const EXCHANGE_CODE_NOT_FOUND: &str =
    "errors.com.meridian.account.oauth.exchange_code_not_found";

/// One-time authorization code unknown or already consumed.
pub const AUTHORIZATION_CODE_NOT_FOUND: &str =
    "errors.com.meridian.account.oauth.authorization_code_not_found";

/// Refresh token rejected; a full reauthentication is required.
pub const INVALID_REFRESH_TOKEN: &str =
    "errors.com.meridian.account.auth_token.invalid_refresh_token";

/// The account must complete a corrective action before tokens are
/// issued. Envelope metadata carries `correctiveAction` and a
/// `continuation` token.
pub const CORRECTIVE_ACTION_REQUIRED: &str =
    "errors.com.meridian.account.corrective_action_required";
