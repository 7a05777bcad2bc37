//! Amazon SQS adapter using the HTTP query API.
//!
//! Implements the same push/pull/delete contract as the local engines by
//! delegating to a managed queue. There is no queueing logic here: SQS owns
//! ordering, leases and redelivery.
//!
//! Requests are signed with AWS Signature V4 by hand and responses are parsed
//! with `quick-xml`, which keeps the adapter testable against a mock HTTP
//! server. Set `endpoint` in [`AwsSqsConfig`] to target LocalStack or a mock.
//!
//! ## Mapping
//!
//! - push: `SendMessage`; the returned handle is the SQS message id
//! - pull: `ReceiveMessage` with `MaxNumberOfMessages=1` and the requested
//!   `VisibilityTimeout`; the returned handle is the receipt handle
//! - delete: `DeleteMessage` with the receipt handle

use crate::client::QueueProvider;
use crate::clock::Clock;
use crate::error::{ConfigurationError, QueueError};
use crate::message::{
    DeleteOutcome, DeleteRequest, Message, PullRequest, PushRequest, QueueName, VisibilityTimeout,
};
use crate::provider::{AwsSqsConfig, ProviderType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";

// ============================================================================
// Error Types
// ============================================================================

/// SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error: {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl From<SqsError> for QueueError {
    fn from(error: SqsError) -> Self {
        match error {
            SqsError::Authentication(message) => QueueError::AuthenticationFailed { message },
            SqsError::NetworkError(message) => QueueError::ConnectionFailed { message },
            SqsError::ServiceError { code, message } => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code,
                message,
            },
            SqsError::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            SqsError::InvalidReceipt(message) => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code: "ReceiptHandleIsInvalid".to_string(),
                message,
            },
            SqsError::ConfigurationError(message) => {
                QueueError::Configuration(ConfigurationError::Invalid { message })
            }
            SqsError::MalformedResponse(message) => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code: "MalformedResponse".to_string(),
                message,
            },
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 request signer.
///
/// Canonical request, string to sign, then a four-step HMAC key derivation
/// (date, region, service, `aws4_request`).
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Headers to attach: `Authorization`, `x-amz-date` and `host`
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> HashMap<String, String> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_query_string = canonical_query(query_params);
        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{:x}",
            algorithm,
            amz_date,
            credential_scope,
            Sha256::digest(canonical_request.as_bytes())
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization_header);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        headers
    }

    /// Hex signature of `string_to_sign` under the key derived for `date_stamp`
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sorted, percent-encoded `k=v&...`
fn canonical_query(params: &HashMap<String, String>) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// SQS Queue
// ============================================================================

/// Queue backed by Amazon SQS
pub struct SqsQueue {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    config: AwsSqsConfig,
    endpoint: String,
    host: String,
    clock: Arc<dyn Clock>,
    queue_url_cache: RwLock<HashMap<QueueName, String>>,
}

impl SqsQueue {
    pub fn new(config: AwsSqsConfig, clock: Arc<dyn Clock>) -> Result<Self, SqsError> {
        if config.region.is_empty() {
            return Err(SqsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let signer = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => Some(AwsV4Signer::new(
                access_key.clone(),
                secret_key.clone(),
                config.region.clone(),
            )),
            _ => None,
        };

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", config.region))
            .trim_end_matches('/')
            .to_string();

        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| SqsError::ConfigurationError(format!("Invalid endpoint: {}", e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SqsError::ConfigurationError(format!(
                    "Endpoint has no host: {}",
                    endpoint
                )))
            }
        };

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SqsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer,
            config,
            endpoint,
            host,
            clock,
            queue_url_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve and cache the queue URL
    async fn get_queue_url(&self, queue_name: &QueueName) -> Result<String, SqsError> {
        {
            let cache = self.queue_url_cache.read().await;
            if let Some(url) = cache.get(queue_name) {
                return Ok(url.clone());
            }
        }

        let params = action_params("GetQueueUrl", [("QueueName", queue_name.as_str())]);
        let response = self.make_request(&params).await.map_err(|e| match e {
            SqsError::QueueNotFound(_) => SqsError::QueueNotFound(queue_name.to_string()),
            other => other,
        })?;
        let queue_url = first_element_text(&response, b"QueueUrl")?
            .ok_or_else(|| SqsError::MalformedResponse("QueueUrl not found".to_string()))?;

        self.queue_url_cache
            .write()
            .await
            .insert(queue_name.clone(), queue_url.clone());
        debug!(queue = %queue_name, url = %queue_url, "Resolved queue URL");

        Ok(queue_url)
    }

    /// Signed POST to the query API; returns the response body
    async fn make_request(&self, params: &HashMap<String, String>) -> Result<String, SqsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SqsError::Authentication("No credentials configured".to_string()))?;

        let auth_headers = signer.sign_request("POST", &self.host, "/", params, "", &Utc::now());
        let url = format!("{}/?{}", self.endpoint, canonical_query(params));

        let mut request = self.http_client.post(&url);
        for (key, value) in auth_headers {
            request = request.header(&key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                SqsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }
        Ok(body)
    }

    pub async fn push(&self, uri: &QueueName, content: String) -> Result<Message, SqsError> {
        let queue_url = self.get_queue_url(uri).await?;
        let params = action_params(
            "SendMessage",
            [("QueueUrl", queue_url.as_str()), ("MessageBody", content.as_str())],
        );

        let response = self.make_request(&params).await?;
        let message_id = first_element_text(&response, b"MessageId")?
            .ok_or_else(|| SqsError::MalformedResponse("MessageId not found".to_string()))?;

        debug!(queue = %uri, message_id = %message_id, "Sent message");
        Ok(Message::new(
            uri.clone(),
            message_id,
            content,
            self.clock.now_ms(),
        ))
    }

    pub async fn pull(
        &self,
        uri: &QueueName,
        timeout: VisibilityTimeout,
    ) -> Result<Option<Message>, SqsError> {
        let queue_url = self.get_queue_url(uri).await?;
        let timeout_secs = timeout.as_secs().to_string();
        let params = action_params(
            "ReceiveMessage",
            [
                ("QueueUrl", queue_url.as_str()),
                ("MaxNumberOfMessages", "1"),
                ("VisibilityTimeout", timeout_secs.as_str()),
                ("WaitTimeSeconds", "0"),
            ],
        );

        let response = self.make_request(&params).await?;
        let Some((receipt_handle, body)) = parse_receive_message_response(&response)? else {
            return Ok(None);
        };

        let now = self.clock.now_ms();
        Ok(Some(Message::new(
            uri.clone(),
            receipt_handle,
            body,
            now + timeout.as_millis(),
        )))
    }

    /// A stale or unknown receipt handle is reported as not in flight
    pub async fn delete(&self, message: &Message) -> Result<DeleteOutcome, SqsError> {
        let queue_url = self.get_queue_url(&message.uri).await?;
        let params = action_params(
            "DeleteMessage",
            [
                ("QueueUrl", queue_url.as_str()),
                ("ReceiptHandle", message.handle.as_str()),
            ],
        );

        match self.make_request(&params).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(SqsError::InvalidReceipt(reason)) => {
                debug!(queue = %message.uri, %reason, "Receipt handle rejected");
                Ok(DeleteOutcome::NotInFlight)
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for SqsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsQueue")
            .field("region", &self.config.region)
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.signer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl QueueProvider for SqsQueue {
    async fn send_message(&self, request: &PushRequest) -> Result<Message, QueueError> {
        request.validate()?;
        let uri = request.queue_name()?;
        Ok(self.push(&uri, request.content.clone()).await?)
    }

    async fn receive_message(&self, request: &PullRequest) -> Result<Option<Message>, QueueError> {
        let uri = request.queue_name()?;
        let timeout = request.visibility_timeout()?;
        Ok(self.pull(&uri, timeout).await?)
    }

    async fn delete_message(&self, request: &DeleteRequest) -> Result<DeleteOutcome, QueueError> {
        request.validate()?;
        Ok(self.delete(&request.message).await?)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AwsSqs
    }
}

// ============================================================================
// Request and response helpers
// ============================================================================

fn action_params<'a>(
    action: &str,
    extra: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("Action".to_string(), action.to_string());
    params.insert("Version".to_string(), API_VERSION.to_string());
    for (key, value) in extra {
        params.insert(key.to_string(), value.to_string());
    }
    params
}

/// Text of the first `<name>` element, if any
fn first_element_text(xml: &str, name: &[u8]) -> Result<Option<String>, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == name => inside = true,
            Ok(Event::Text(e)) if inside => {
                return e
                    .unescape()
                    .map(|s| Some(s.into_owned()))
                    .map_err(|e| SqsError::MalformedResponse(format!("Failed to parse XML: {}", e)));
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == name => inside = false,
            Ok(Event::Eof) => return Ok(None),
            Err(e) => {
                return Err(SqsError::MalformedResponse(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
}

/// `(receipt_handle, body)` of the first message in a ReceiveMessage response
fn parse_receive_message_response(xml: &str) -> Result<Option<(String, String)>, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut in_message = false;
    let mut field: Option<&'static str> = None;
    let mut receipt_handle = None;
    let mut body = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => in_message = true,
                b"ReceiptHandle" if in_message => field = Some("ReceiptHandle"),
                b"Body" if in_message => field = Some("Body"),
                _ => field = None,
            },
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| SqsError::MalformedResponse(format!("Failed to parse XML: {}", e)))?
                    .into_owned();
                match field.take() {
                    Some("ReceiptHandle") => receipt_handle = Some(text),
                    Some("Body") => body = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                return match (receipt_handle, body) {
                    (Some(handle), Some(body)) => Ok(Some((handle, body))),
                    (Some(handle), None) => Ok(Some((handle, String::new()))),
                    _ => Err(SqsError::MalformedResponse(
                        "Message without ReceiptHandle".to_string(),
                    )),
                };
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) => return Ok(None),
            Err(e) => {
                return Err(SqsError::MalformedResponse(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
}

fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let code = first_element_text(xml, b"Code")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Unknown".to_string());
    let message = first_element_text(xml, b"Message")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => SqsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::ServiceError { code, message },
    }
}
