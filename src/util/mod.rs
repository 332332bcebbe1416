//! Utility functions shared by the fetch, enrichment and notification paths.
//!
//! - **URL validation**: scheme checks and SSRF filtering for feed URLs, and
//!   HTTPS enforcement for credential-bearing API endpoints
//! - **Bounded reads**: response bodies read under a hard size cap

mod body;
mod url_validator;

pub use body::{read_limited_bytes, BodyError};
pub use url_validator::{validate_api_endpoint, validate_url, UrlValidationError};
