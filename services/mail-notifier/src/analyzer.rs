//! HTTP client for the text analysis service
//!
//! The service exposes `POST {url}/summarize` answering
//! `{"success": true, "summary_text": "..."}` and `POST {url}/tone` answering
//! `{"success": true, "label": "...", "score": 0.7, "urgency": "high"}`.
//! Both take `{"text": "..."}`.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use inbox_monitor::{DispatchError, Enricher, ToneScore, Urgency};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

type AnalyzerResult<T> = Result<T, DispatchError>;

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct SummaryResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    summary_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ToneResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    urgency: Option<Urgency>,
    #[serde(default)]
    error: Option<String>,
}

/// `Enricher` backed by the analysis service.
pub struct HttpTextAnalyzer {
    http: reqwest::Client,
    base_url: Url,
    token: Option<Secret<String>>,
}

impl HttpTextAnalyzer {
    pub fn new(http: reqwest::Client, base_url: Url, token: Option<Secret<String>>) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    fn endpoint(&self, name: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(name);
        }
        url
    }

    async fn post<T: DeserializeOwned>(&self, name: &str, text: &str) -> AnalyzerResult<T> {
        let mut request = self
            .http
            .post(self.endpoint(name))
            .json(&AnalyzeRequest { text });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Enrichment(format!("{name}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Enrichment(format!(
                "{name} returned {status}: {}",
                body.trim()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DispatchError::Enrichment(format!("{name}: invalid response: {e}")))
    }

    async fn summary(&self, text: &str) -> AnalyzerResult<String> {
        let response: SummaryResponse = self.post("summarize", text).await?;
        match (response.success, response.summary_text) {
            (true, Some(summary)) => {
                debug!(chars = summary.len(), "summary received");
                Ok(summary)
            }
            _ => Err(DispatchError::Enrichment(format!(
                "summarize: {}",
                response.error.as_deref().unwrap_or("no summary in response")
            ))),
        }
    }

    async fn tone_score(&self, text: &str) -> AnalyzerResult<ToneScore> {
        let response: ToneResponse = self.post("tone", text).await?;
        match (response.success, response.label, response.urgency) {
            (true, Some(label), Some(urgency)) => Ok(ToneScore {
                label,
                score: response.score.unwrap_or_default(),
                urgency,
            }),
            _ => Err(DispatchError::Enrichment(format!(
                "tone: {}",
                response.error.as_deref().unwrap_or("incomplete tone in response")
            ))),
        }
    }
}

impl Enricher for HttpTextAnalyzer {
    fn summarize<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = AnalyzerResult<String>> + Send + 'a>> {
        Box::pin(self.summary(text))
    }

    fn tone<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = AnalyzerResult<ToneScore>> + Send + 'a>> {
        Box::pin(self.tone_score(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Seen {
        auth: Mutex<Vec<Option<String>>>,
        texts: Mutex<Vec<String>>,
    }

    #[derive(Deserialize)]
    struct Body {
        text: String,
    }

    fn record(seen: &Seen, headers: &HeaderMap, body: Body) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.auth.lock().unwrap().push(auth);
        seen.texts.lock().unwrap().push(body.text);
    }

    /// Analysis service that summarizes to the first sentence and calls
    /// anything containing "urgent" high urgency.
    async fn start_analyzer() -> (Url, Arc<Seen>) {
        let seen = Arc::new(Seen::default());
        let summarize_seen = seen.clone();
        let tone_seen = seen.clone();
        let app = Router::new()
            .route(
                "/api/summarize",
                post(move |headers: HeaderMap, Json(body): Json<Body>| {
                    let seen = summarize_seen.clone();
                    async move {
                        let first = body.text.split('.').next().unwrap_or_default().to_string();
                        record(&seen, &headers, body);
                        Json(serde_json::json!({ "success": true, "summary_text": format!("{first}.") }))
                    }
                }),
            )
            .route(
                "/api/tone",
                post(move |headers: HeaderMap, Json(body): Json<Body>| {
                    let seen = tone_seen.clone();
                    async move {
                        let urgent = body.text.contains("urgent");
                        record(&seen, &headers, body);
                        Json(serde_json::json!({
                            "success": true,
                            "label": if urgent { "NEGATIVE" } else { "NEUTRAL" },
                            "score": 0.75,
                            "urgency": if urgent { "high" } else { "low" },
                        }))
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (Url::parse(&format!("http://{addr}/api/")).unwrap(), seen)
    }

    async fn start_static(status: StatusCode, body: serde_json::Value) -> Url {
        let app = Router::new().fallback(move || {
            let body = body.clone();
            async move { (status, Json(body)) }
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn summarize_posts_text_with_bearer_token() {
        let (url, seen) = start_analyzer().await;
        let analyzer = HttpTextAnalyzer::new(
            reqwest::Client::new(),
            url,
            Some(Secret::new("hf_token".to_string())),
        );

        let summary = analyzer
            .summarize("Budget approved. Details follow in the attachment.")
            .await
            .unwrap();
        assert_eq!(summary, "Budget approved.");
        assert_eq!(
            *seen.auth.lock().unwrap(),
            vec![Some("Bearer hf_token".to_string())]
        );
    }

    #[tokio::test]
    async fn tone_parses_label_score_and_urgency() {
        let (url, seen) = start_analyzer().await;
        let analyzer = HttpTextAnalyzer::new(reqwest::Client::new(), url, None);

        let tone = analyzer.tone("This is urgent, call me").await.unwrap();
        assert_eq!(tone.label, "NEGATIVE");
        assert_eq!(tone.urgency, Urgency::High);
        assert!((tone.score - 0.75).abs() < f32::EPSILON);
        assert_eq!(*seen.auth.lock().unwrap(), vec![None]);
        assert_eq!(*seen.texts.lock().unwrap(), vec!["This is urgent, call me"]);
    }

    #[tokio::test]
    async fn unsuccessful_response_is_an_enrichment_error() {
        let url = start_static(
            StatusCode::OK,
            serde_json::json!({ "success": false, "error": "model not loaded" }),
        )
        .await;
        let analyzer = HttpTextAnalyzer::new(reqwest::Client::new(), url, None);

        match analyzer.summarize("some text").await {
            Err(DispatchError::Enrichment(msg)) => assert!(msg.contains("model not loaded"), "got: {msg}"),
            other => panic!("expected Enrichment error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_an_enrichment_error() {
        let url = start_static(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "boom" }),
        )
        .await;
        let analyzer = HttpTextAnalyzer::new(reqwest::Client::new(), url, None);

        match analyzer.tone("some text").await {
            Err(DispatchError::Enrichment(msg)) => assert!(msg.contains("500"), "got: {msg}"),
            other => panic!("expected Enrichment error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_service_is_an_enrichment_error() {
        let analyzer = HttpTextAnalyzer::new(
            reqwest::Client::new(),
            Url::parse("http://127.0.0.1:1").unwrap(),
            None,
        );
        assert!(matches!(
            analyzer.summarize("text").await,
            Err(DispatchError::Enrichment(_))
        ));
    }
}
