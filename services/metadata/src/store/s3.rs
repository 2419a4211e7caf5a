use super::{MergedMetadata, ObjectAttributes, ObjectListing, ObjectRecord, ObjectStore, StoreError};
use crate::classifier::SystemField;
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{DateTime, DateTimeFormat};
use aws_sdk_s3::types::{MetadataDirective, ServerSideEncryption, StorageClass};
use aws_sdk_s3::Client as S3Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};

/// Characters left unescaped in a copy source key; `/` separates the bucket
/// from the key and must survive.
static COPY_SOURCE_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// [`ObjectStore`] backed by the AWS S3 SDK
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    /// Create a store using the default AWS credential chain
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            "S3 store initialized"
        );

        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> Result<ObjectListing, StoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket))?;

        let keys: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect();

        debug!(count = keys.len(), "Listed objects");

        Ok(ObjectListing {
            keys,
            next_token: response.next_continuation_token().map(String::from),
        })
    }

    #[instrument(skip(self))]
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord, StoreError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let etag = output
            .e_tag()
            .map(String::from)
            .ok_or_else(|| StoreError::Request(format!("No etag returned for {}", key)))?;

        let mut system = BTreeMap::new();
        let present = [
            (SystemField::CacheControl, output.cache_control()),
            (SystemField::ContentDisposition, output.content_disposition()),
            (SystemField::ContentEncoding, output.content_encoding()),
            (SystemField::ContentLanguage, output.content_language()),
            (SystemField::ContentType, output.content_type()),
            (
                SystemField::WebsiteRedirectLocation,
                output.website_redirect_location(),
            ),
        ];
        for (field, value) in present {
            if let Some(value) = value {
                system.insert(field, value.to_string());
            }
        }

        #[allow(deprecated)]
        let expires = expires_header(output.expires_string(), output.expires())?;
        if let Some(expires) = expires {
            system.insert(SystemField::Expires, expires);
        }

        let user = output
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let attributes = ObjectAttributes {
            storage_class: output.storage_class().map(|c| c.as_str().to_string()),
            server_side_encryption: output
                .server_side_encryption()
                .map(|e| e.as_str().to_string()),
            ssekms_key_id: output.ssekms_key_id().map(String::from),
        };

        Ok(ObjectRecord {
            key: key.to_string(),
            etag,
            system,
            user,
            attributes,
        })
    }

    /// Replace metadata with an in-place copy. A single CopyObject is limited
    /// to 5 GiB; larger objects fail here and are reported per object.
    /// Objects encrypted with customer-provided keys (SSE-C) cannot be
    /// copied without the key and fail the same way.
    #[instrument(skip(self, metadata))]
    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        metadata: &MergedMetadata,
        if_match: &str,
    ) -> Result<(), StoreError> {
        let user: HashMap<String, String> = metadata
            .user
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut request = self
            .client
            .copy_object()
            .bucket(bucket)
            .key(key)
            .copy_source(copy_source(bucket, key))
            .copy_source_if_match(if_match)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(user))
            .set_storage_class(
                metadata
                    .attributes
                    .storage_class
                    .as_deref()
                    .map(StorageClass::from),
            )
            .set_server_side_encryption(
                metadata
                    .attributes
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            )
            .set_ssekms_key_id(metadata.attributes.ssekms_key_id.clone());

        for (field, value) in &metadata.system {
            request = match field {
                SystemField::CacheControl => request.cache_control(value),
                SystemField::ContentDisposition => request.content_disposition(value),
                SystemField::ContentEncoding => request.content_encoding(value),
                SystemField::ContentLanguage => request.content_language(value),
                SystemField::ContentType => request.content_type(value),
                SystemField::Expires => request.expires(parse_expires(value)?),
                SystemField::WebsiteRedirectLocation => request.website_redirect_location(value),
            };
        }

        request.send().await.map_err(|e| map_sdk_error(e, key))?;

        debug!("Copy successful");
        Ok(())
    }
}

/// `bucket/key` with the key percent-encoded, as CopyObject expects
fn copy_source(bucket: &str, key: &str) -> String {
    format!(
        "{}/{}",
        bucket,
        utf8_percent_encode(key, &COPY_SOURCE_ENCODE_SET)
    )
}

/// The object's `Expires` header as stored. The raw header is preferred; a
/// parsed date that cannot be rendered back fails the fetch so the copy never
/// drops the field.
fn expires_header(
    raw: Option<&str>,
    parsed: Option<&DateTime>,
) -> Result<Option<String>, StoreError> {
    if let Some(raw) = raw {
        return Ok(Some(raw.to_string()));
    }

    parsed
        .map(|expires| {
            expires
                .fmt(DateTimeFormat::HttpDate)
                .map_err(|e| StoreError::Request(format!("Unreadable Expires value: {}", e)))
        })
        .transpose()
}

/// Parse an `Expires` value given either as an HTTP date or RFC 3339
fn parse_expires(value: &str) -> Result<DateTime, StoreError> {
    DateTime::from_str(value, DateTimeFormat::HttpDate)
        .or_else(|_| DateTime::from_str(value, DateTimeFormat::DateTime))
        .map_err(|e| StoreError::Request(format!("Invalid Expires value '{}': {}", value, e)))
}

/// Map an SDK failure onto the store error taxonomy. `target` names the
/// bucket or key the request was about.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, target: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());

    match (err.code(), status) {
        (Some("NoSuchBucket"), _) => StoreError::NoSuchBucket(target.to_string()),
        (Some("NoSuchKey") | Some("NotFound"), _) | (_, Some(404)) => {
            StoreError::NotFound(target.to_string())
        }
        (Some("PreconditionFailed"), _) | (_, Some(412)) => {
            StoreError::PreconditionFailed(target.to_string())
        }
        (Some("AccessDenied"), _) | (_, Some(403)) => StoreError::AccessDenied(target.to_string()),
        _ => StoreError::Request(DisplayErrorContext(&err).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(copy_source("bucket", "tiles/1/2.png"), "bucket/tiles/1/2.png");
        assert_eq!(
            copy_source("bucket", "dir/file name+1.txt"),
            "bucket/dir/file%20name%2B1.txt"
        );
        assert_eq!(copy_source("bucket", "é"), "bucket/%C3%A9");
    }

    #[test]
    fn test_parse_expires_accepts_http_date_and_rfc3339() {
        let http = parse_expires("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        let rfc = parse_expires("2015-10-21T07:28:00Z").unwrap();
        assert_eq!(http, rfc);
    }

    #[test]
    fn test_expires_header_prefers_raw_value() {
        let parsed = DateTime::from_secs(1_445_412_480);
        assert_eq!(
            expires_header(Some("Wed, 21 Oct 2015 07:28:00 GMT"), Some(&parsed)).unwrap(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string())
        );
        assert_eq!(
            expires_header(None, Some(&parsed)).unwrap(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string())
        );
        assert_eq!(expires_header(None, None).unwrap(), None);
    }

    #[test]
    fn test_unrenderable_expires_fails_the_fetch() {
        // Year 10000 is outside the HTTP date range
        let parsed = DateTime::from_secs(253_402_300_800);
        assert!(matches!(
            expires_header(None, Some(&parsed)),
            Err(StoreError::Request(_))
        ));
    }

    #[test]
    fn test_parse_expires_rejects_garbage() {
        assert!(matches!(
            parse_expires("next tuesday"),
            Err(StoreError::Request(_))
        ));
    }
}
