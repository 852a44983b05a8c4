use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use tracing::debug;

use super::{claims::Claims, IdentityError};

const PROVIDER_AUDIENCE: &str = "authenticated";

/// Checks access tokens against the project JWT secret so that an expired
/// token and a garbled one can be told apart without a network round trip.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    audience: String,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            audience: PROVIDER_AUDIENCE.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, IdentityError> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.leeway = 0;

        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => {
                debug!(user_id = %data.claims.sub, "access token verified");
                Ok(data.claims)
            }
            Err(e) => Err(classify(e.kind())),
        }
    }
}

fn classify(kind: &ErrorKind) -> IdentityError {
    match kind {
        ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => IdentityError::InvalidToken,
        other => IdentityError::Rejected(format!("{other:?}")),
    }
}
