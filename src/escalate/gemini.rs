use super::Analyzer;
use crate::error::Error;
use base64::Engine;
use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use std::{thread, time::Duration};
use tracing::{info, instrument, warn};

const ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const SERVICE: &str = "gemini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(self) -> Result<String, Error> {
        let text = self
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            Err(Error::EmptyAnalysis)
        } else {
            Ok(text.to_owned())
        }
    }
}

/// Retry `attempt` while it reports rate limiting, waiting `backoff * n` before the nth retry.
pub(crate) fn with_rate_limit_retries<T, F, S>(
    max_attempts: u32,
    backoff: Duration,
    mut sleep: S,
    mut attempt: F,
) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
    S: FnMut(Duration),
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt() {
            Err(Error::RateLimited(service)) if tries < max_attempts => {
                let wait = backoff * tries;
                warn!(message = "rate limited, retrying", service, ?wait, tries);
                sleep(wait);
            }
            result => return result,
        }
    }
}

/// Google Gemini `generateContent` with an inline JPEG.
pub(crate) struct Gemini {
    client: Client,
    api_key: Option<String>,
    model: String,
    max_attempts: u32,
    backoff: Duration,
}

impl Gemini {
    pub(crate) fn new(api_key: Option<String>, model: String) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::BuildHttpClient)?;
        Ok(Self {
            client,
            api_key: api_key
                .map(|key| key.trim().to_owned())
                .filter(|key| !key.is_empty()),
            model,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        })
    }

    fn generate(&self, api_key: &str, jpeg: &[u8], prompt: &str) -> Result<String, Error> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    {
                        "inline_data": {
                            "mime_type": "image/jpeg",
                            "data": base64::engine::general_purpose::STANDARD.encode(jpeg),
                        }
                    }
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/{}:generateContent", ENDPOINT, self.model))
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .map_err(|e| Error::Request(SERVICE, e))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(SERVICE));
        }

        response
            .error_for_status()
            .map_err(|e| Error::Request(SERVICE, e))?
            .json::<GenerateResponse>()
            .map_err(|e| Error::Request(SERVICE, e))?
            .text()
    }
}

impl Analyzer for Gemini {
    #[instrument(name = "Gemini::analyze", skip(self, jpeg, prompt), fields(model = %self.model))]
    fn analyze(&self, jpeg: &[u8], prompt: &str) -> Result<String, Error> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(Error::MissingApiKey("GEMINI_API_KEY"))?;
        let text = with_rate_limit_retries(self.max_attempts, self.backoff, thread::sleep, || {
            self.generate(api_key, jpeg, prompt)
        })?;
        info!(message = "analysis complete", chars = text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::{with_rate_limit_retries, Gemini, GenerateResponse};
    use crate::{error::Error, escalate::Analyzer};
    use std::time::Duration;

    #[test]
    fn response_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {
                        "parts": [{"text": "Call emergency services. "}, {"text": "Start CPR.\n"}],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(
            response.text().unwrap(),
            "Call emergency services. Start CPR."
        );
    }

    #[test]
    fn empty_response_is_an_error() {
        let response: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(matches!(response.text(), Err(Error::EmptyAnalysis)));
    }

    #[test]
    fn retries_only_rate_limits() {
        let mut waits = vec![];
        let mut calls = 0;
        let result = with_rate_limit_retries(
            3,
            Duration::from_secs(15),
            |wait| waits.push(wait),
            || {
                calls += 1;
                if calls < 3 {
                    Err(Error::RateLimited("gemini"))
                } else {
                    Ok("done")
                }
            },
        );
        assert_eq!(result.unwrap(), "done");
        assert_eq!(waits, vec![Duration::from_secs(15), Duration::from_secs(30)]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = with_rate_limit_retries(
            3,
            Duration::from_secs(1),
            |_| {},
            || {
                calls += 1;
                Err(Error::RateLimited("gemini"))
            },
        );
        assert!(matches!(result, Err(Error::RateLimited(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_rate_limit_retries(
            3,
            Duration::from_secs(1),
            |_| panic!("should not sleep"),
            || {
                calls += 1;
                Err(Error::EmptyAnalysis)
            },
        );
        assert!(matches!(result, Err(Error::EmptyAnalysis)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn missing_key_fails_without_a_request() {
        let gemini = Gemini::new(Some("  ".to_owned()), "gemini-2.5-flash".to_owned()).unwrap();
        assert!(matches!(
            gemini.analyze(&[1, 2, 3], "prompt"),
            Err(Error::MissingApiKey("GEMINI_API_KEY"))
        ));
    }
}
