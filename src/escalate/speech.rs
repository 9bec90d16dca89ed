use super::Synthesizer;
use crate::error::Error;
use reqwest::blocking::Client;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

const ENDPOINT: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const SERVICE: &str = "elevenlabs";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MODEL_ID: &str = "eleven_multilingual_v2";

pub(crate) const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// ElevenLabs streaming text-to-speech, returning mp3 bytes.
pub(crate) struct ElevenLabs {
    client: Client,
    api_key: Option<String>,
    voice_id: String,
}

impl ElevenLabs {
    pub(crate) fn new(api_key: Option<String>, voice_id: String) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::BuildHttpClient)?;
        Ok(Self {
            client,
            api_key: api_key
                .map(|key| key.trim().to_owned())
                .filter(|key| !key.is_empty()),
            voice_id: voice_id.trim().to_owned(),
        })
    }

    fn url(&self) -> String {
        format!("{}/{}/stream", ENDPOINT, self.voice_id)
    }
}

fn payload(text: &str) -> serde_json::Value {
    serde_json::json!({
        "text": text,
        "model_id": MODEL_ID,
        "voice_settings": {
            "stability": 0.5,
            "similarity_boost": 0.75,
        },
    })
}

impl Synthesizer for ElevenLabs {
    #[instrument(name = "ElevenLabs::synthesize", skip(self, text))]
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, Error> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(Error::MissingApiKey("ELEVENLABS_API_KEY"))?;

        let start = Instant::now();
        let audio = self
            .client
            .post(self.url())
            .header("xi-api-key", api_key)
            .header("Accept", "audio/mpeg")
            .json(&payload(text))
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .map_err(|e| Error::Request(SERVICE, e))?;

        info!(
            message = "speech synthesized",
            bytes = audio.len(),
            elapsed = ?start.elapsed()
        );
        Ok(audio.to_vec())
    }
}
