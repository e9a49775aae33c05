use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use service_core::error::AppError;

/// JSON body that may be left out. An empty body yields `T::default()`;
/// a body that is present must parse, or the request is rejected.
pub struct OptionalJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for OptionalJson<T>
where
    T: DeserializeOwned + Default + Send + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Failed to read request body: {}", e))
        })?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(T::default()));
        }

        match Json::<T>::from_bytes(&bytes) {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::JsonDataError(e)) => Err(AppError::invalid_field(
                "body",
                "invalid_value",
                e.body_text(),
            )),
            Err(e) => Err(AppError::BadRequest(anyhow::anyhow!(
                "Malformed JSON body: {}",
                e.body_text()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct VersionBody {
        expected_version: Option<i32>,
    }

    async fn extract(raw: &'static str) -> Result<VersionBody, AppError> {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(raw))
            .unwrap();
        OptionalJson::<VersionBody>::from_request(req, &())
            .await
            .map(|OptionalJson(v)| v)
    }

    #[tokio::test]
    async fn test_empty_body_is_default() {
        assert_eq!(extract("").await.unwrap(), VersionBody::default());
        assert_eq!(extract("  \n").await.unwrap(), VersionBody::default());
    }

    #[tokio::test]
    async fn test_present_body_is_parsed() {
        let parsed = extract(r#"{"expectedVersion":3}"#).await.unwrap();
        assert_eq!(parsed.expected_version, Some(3));
    }

    #[tokio::test]
    async fn test_wrong_types_are_validation_errors() {
        let err = extract(r#"{"expectedVersion":"99"}"#).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_malformed_syntax_is_bad_request() {
        let err = extract(r#"{"expectedVersion":"#).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
