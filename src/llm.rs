use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::warn;

use crate::util::RetryPolicy;

/// Blocking client for the Generative Model Service (Ollama-compatible
/// `/api/chat`, non-streaming). One prompt in, one verbatim response out.
pub struct LlmClient {
    http: Client,
    base_url: String,
    model: String,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build llm http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            retry,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Single non-retried liveness probe.
    pub fn ping(&self) -> Result<()> {
        let response = self
            .http
            .get(&self.base_url)
            .send()
            .with_context(|| format!("llm service unreachable at {}", self.base_url))?;

        if !response.status().is_success() {
            bail!("llm service at {} answered {}", self.base_url, response.status());
        }

        Ok(())
    }

    /// Sends one prompt and returns the model's full text response verbatim.
    /// Transport errors and 5xx answers are retried with backoff; exhausting
    /// the retries surfaces the last error to the caller.
    pub fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [ { "role": "user", "content": prompt } ],
            "stream": false,
        });

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=self.retry.attempts {
            match self.http.post(&url).json(&body).send() {
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(anyhow!(
                        "llm completion: server error {} from {}",
                        response.status(),
                        self.base_url
                    ));
                }
                Ok(response) => {
                    let status = response.status();
                    let value: Value = response
                        .json()
                        .context("llm completion: invalid json response")?;

                    if !status.is_success() {
                        bail!("llm completion: unexpected status {status}: {value}");
                    }

                    return parse_chat_response(&value).ok_or_else(|| {
                        anyhow!("llm completion: response carried no message content")
                    });
                }
                Err(err) => {
                    last_error = Some(
                        anyhow::Error::new(err).context("llm completion: request failed"),
                    );
                }
            }

            if attempt < self.retry.attempts {
                warn!(attempt, model = %self.model, "transient llm failure, retrying");
                thread::sleep(self.retry.delay_for(attempt));
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("llm completion: exhausted retries against {}", self.base_url)))
    }
}

fn parse_chat_response(value: &Value) -> Option<String> {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
