//! Authentication error taxonomy.
//!
//! Every failure mode of signature verification maps to a well-known S3
//! error code and HTTP status so the front-end can render the standard XML
//! envelope without inspecting messages.

/// Errors produced during SigV4 verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header and no presigned query parameters.
    #[error("request is missing required authentication information")]
    MissingSecurityHeader,

    /// The `Authorization` header does not match the SigV4 grammar.
    #[error("authorization header is malformed: {reason}")]
    AuthorizationHeaderMalformed {
        /// What specifically failed to parse.
        reason: String,
    },

    /// The access key id does not exist or is not usable.
    #[error("the access key id does not exist: {access_key_id}")]
    InvalidAccessKeyId {
        /// The unknown access key id.
        access_key_id: String,
    },

    /// The computed signature differs from the provided one.
    #[error("the request signature does not match")]
    SignatureDoesNotMatch,

    /// The request time is too far from server time.
    #[error("the difference between request time and server time is too large")]
    RequestTimeTooSkewed,

    /// The presigned URL has expired.
    #[error("the provided token has expired")]
    ExpiredToken,

    /// A presigned URL parameter is missing or out of range.
    #[error("invalid presigned URL: {reason}")]
    InvalidPresignedUrl {
        /// What specifically is invalid.
        reason: String,
    },

    /// The caller is authenticated but not allowed to do this.
    #[error("access denied")]
    AccessDenied,
}

impl AuthError {
    /// The S3 error code string for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSecurityHeader => "MissingSecurityHeader",
            Self::AuthorizationHeaderMalformed { .. } => "AuthorizationHeaderMalformed",
            Self::InvalidAccessKeyId { .. } => "InvalidAccessKeyId",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Self::RequestTimeTooSkewed => "RequestTimeTooSkewed",
            Self::ExpiredToken => "ExpiredToken",
            Self::InvalidPresignedUrl { .. } => "InvalidPresignedURL",
            Self::AccessDenied => "AccessDenied",
        }
    }

    /// The HTTP status the front-end should answer with.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingSecurityHeader
            | Self::AuthorizationHeaderMalformed { .. }
            | Self::ExpiredToken
            | Self::InvalidPresignedUrl { .. } => 400,
            Self::InvalidAccessKeyId { .. }
            | Self::SignatureDoesNotMatch
            | Self::RequestTimeTooSkewed
            | Self::AccessDenied => 403,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_codes_and_statuses() {
        let cases: Vec<(AuthError, &str, u16)> = vec![
            (AuthError::MissingSecurityHeader, "MissingSecurityHeader", 400),
            (
                AuthError::AuthorizationHeaderMalformed {
                    reason: "bad".to_owned(),
                },
                "AuthorizationHeaderMalformed",
                400,
            ),
            (
                AuthError::InvalidAccessKeyId {
                    access_key_id: "AK".to_owned(),
                },
                "InvalidAccessKeyId",
                403,
            ),
            (AuthError::SignatureDoesNotMatch, "SignatureDoesNotMatch", 403),
            (AuthError::RequestTimeTooSkewed, "RequestTimeTooSkewed", 403),
            (AuthError::ExpiredToken, "ExpiredToken", 400),
            (
                AuthError::InvalidPresignedUrl {
                    reason: "expires".to_owned(),
                },
                "InvalidPresignedURL",
                400,
            ),
            (AuthError::AccessDenied, "AccessDenied", 403),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
        }
    }
}
