use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Lookups run before the pipeline, inside the per-session turn lock,
/// so a slow clinic service must not stall note processing.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Read-only lookup into the surrounding clinic CRUD layer. Only display
/// names flow in; nothing is ever written back.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn patient_display_name(&self, patient_id: &str) -> Option<String>;
}

/// Default when no clinic service is configured: every lookup misses.
pub struct NoopDirectory;

#[async_trait]
impl DirectoryClient for NoopDirectory {
    async fn patient_display_name(&self, _patient_id: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct PatientRecord {
    full_name: String,
}

pub struct HttpDirectoryClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDirectoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, LOOKUP_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn patient_display_name(&self, patient_id: &str) -> Option<String> {
        let url = format!("{}/clinic/patients/{}", self.base_url, patient_id);
        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, patient_id, "patient lookup failed");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        response
            .json::<PatientRecord>()
            .await
            .ok()
            .map(|record| record.full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn noop_directory_always_misses() {
        assert_eq!(NoopDirectory.patient_display_name("p1").await, None);
    }

    #[tokio::test]
    async fn unresponsive_clinic_service_degrades_to_none() {
        // Bound a socket but never answer; the lookup must give up on
        // its own timeout instead of hanging the caller.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client =
            HttpDirectoryClient::with_timeout(format!("http://{addr}"), Duration::from_millis(100));

        let started = Instant::now();
        let name = client.patient_display_name("p1").await;

        assert_eq!(name, None);
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[tokio::test]
    async fn unreachable_clinic_service_degrades_to_none() {
        let client = HttpDirectoryClient::new("http://127.0.0.1:9");
        assert_eq!(client.patient_display_name("p1").await, None);
    }
}
