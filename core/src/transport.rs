//! Batch transmission to the ingestion endpoint.
//!
//! Contratto dell'endpoint: `POST` di un array JSON di eventi già
//! rumorizzati, risposta JSON. Successo solo se HTTP 2xx **e** il body
//! non contiene un campo `error`. Tutto il resto (errore di rete, status
//! non-2xx, body vuoto o non JSON, campo `error`) è un fallimento
//! recuperabile: nessun panic, nessun errore propagato all'host.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{body_excerpt, TransmissionError};
use crate::event::NoisedEvent;

/// Successful acknowledgement from the ingestion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAck {
    /// HTTP status (2xx).
    pub status: u16,
    /// Parsed JSON body.
    pub body: Value,
}

/// Sends noised batches somewhere.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmits one batch. Never panics; every failure is a [`TransmissionError`].
    async fn send_batch(&self, batch: &[NoisedEvent]) -> Result<ServerAck, TransmissionError>;
}

/// Classifies a raw HTTP response.
///
/// Funzione pura: tutta la logica di successo/fallimento sta qui, così
/// è testabile senza rete.
pub fn classify_response(url: &str, status: u16, body: &str) -> Result<ServerAck, TransmissionError> {
    if !(200..300).contains(&status) {
        return Err(TransmissionError::HttpStatus {
            url: url.to_owned(),
            status,
            body: body_excerpt(body),
        });
    }

    if body.trim().is_empty() {
        return Err(TransmissionError::EmptyBody {
            url: url.to_owned(),
            status,
        });
    }

    let parsed: Value = serde_json::from_str(body).map_err(|_| TransmissionError::MalformedBody {
        url: url.to_owned(),
        status,
        body: body_excerpt(body),
    })?;

    if let Some(error) = parsed.get("error").filter(|e| !e.is_null()) {
        let error = error
            .as_str()
            .map_or_else(|| error.to_string(), str::to_owned);
        return Err(TransmissionError::Rejected {
            url: url.to_owned(),
            status,
            error: body_excerpt(&error),
        });
    }

    Ok(ServerAck {
        status,
        body: parsed,
    })
}

/// HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport for `endpoint` with a per-request timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &[NoisedEvent]) -> Result<ServerAck, TransmissionError> {
        debug!(endpoint = %self.endpoint, events = batch.len(), "posting batch");

        let response = self
            .client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await
            .map_err(|e| TransmissionError::Network {
                url: self.endpoint.clone(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| TransmissionError::Network {
            url: self.endpoint.clone(),
            message: format!("failed to read response body: {e}"),
        })?;

        classify_response(&self.endpoint, status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::event::{AnalyticsEvent, DeviceClass, PageContext};
    use crate::identity::AttributionContext;

    const URL: &str = "https://ingest.example/api/events";

    fn batch() -> Vec<NoisedEvent> {
        let event = AnalyticsEvent::new(
            "pageview",
            1.0,
            "sess",
            DeviceClass::Desktop,
            &PageContext::new("https://site.example/", None, "ua"),
            &AttributionContext::default(),
        );
        vec![event.noised(0.25, 1.0)]
    }

    #[test]
    fn success_requires_2xx_and_no_error_field() {
        let ack = classify_response(URL, 200, r#"{"success":true}"#).expect("success");
        assert_eq!(ack.status, 200);
        assert_eq!(ack.body["success"], true);

        let null_error = classify_response(URL, 201, r#"{"error":null}"#);
        assert!(null_error.is_ok());
    }

    #[test]
    fn non_2xx_is_a_failure_with_details() {
        let err = classify_response(URL, 500, "boom").unwrap_err();
        assert_eq!(
            err,
            TransmissionError::HttpStatus {
                url: URL.into(),
                status: 500,
                body: "boom".into()
            }
        );
    }

    #[test]
    fn empty_and_malformed_bodies_are_failures() {
        assert!(matches!(
            classify_response(URL, 200, "  "),
            Err(TransmissionError::EmptyBody { status: 200, .. })
        ));
        assert!(matches!(
            classify_response(URL, 200, "<html>"),
            Err(TransmissionError::MalformedBody { status: 200, .. })
        ));
    }

    #[test]
    fn application_error_field_is_a_failure() {
        let err = classify_response(URL, 200, r#"{"error":"quota exceeded"}"#).unwrap_err();
        assert_eq!(
            err,
            TransmissionError::Rejected {
                url: URL.into(),
                status: 200,
                error: "quota exceeded".into()
            }
        );

        let structured = classify_response(URL, 200, r#"{"error":{"code":7}}"#).unwrap_err();
        assert!(matches!(structured, TransmissionError::Rejected { ref error, .. } if error.contains("7")));
    }

    #[tokio::test]
    async fn http_transport_posts_json_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/api/events", server.uri());
        let transport = HttpTransport::new(endpoint.clone(), Duration::from_secs(5)).expect("client");
        assert_eq!(transport.endpoint(), endpoint);

        let ack = transport.send_batch(&batch()).await.expect("ack");
        assert_eq!(ack.status, 200);

        let requests = server.received_requests().await.expect("recording enabled");
        let sent: Value = serde_json::from_slice(&requests[0].body).expect("json body");
        let events = sent.as_array().expect("array payload");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["epsilon"], 1.0);
        assert_eq!(events[0]["eventType"], "pageview");
    }

    #[tokio::test]
    async fn http_transport_reports_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), Duration::from_secs(5)).expect("client");
        let err = transport.send_batch(&batch()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        // Porta 9 (discard) su loopback: connessione rifiutata.
        let transport =
            HttpTransport::new("http://127.0.0.1:9/ingest", Duration::from_secs(2)).expect("client");
        let err = transport.send_batch(&batch()).await.unwrap_err();
        assert!(matches!(err, TransmissionError::Network { .. }));
    }
}
