use chat_service::config::ChatConfig;
use chat_service::services::providers::mock::MockTextProvider;
use chat_service::services::providers::TextProvider;
use chat_service::startup::Application;
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub const TEST_API_KEY: &str = "test-api-key";

pub fn test_config(overrides: &[(&str, &str)]) -> ChatConfig {
    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("GEMINI_API_KEY".to_string(), TEST_API_KEY.to_string());
    vars.insert("CHAT_STREAM_IDLE_TIMEOUT_SECS".to_string(), "2".to_string());
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let common = CoreConfig {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0, // Random port for testing
    };
    ChatConfig::from_lookup(common, |key| vars.get(key).cloned())
        .expect("Failed to build test configuration")
}

pub struct TestApp {
    pub address: String,
    pub provider: Arc<MockTextProvider>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn(provider: MockTextProvider, overrides: &[(&str, &str)]) -> Self {
        let config = test_config(overrides);
        let provider = Arc::new(provider);
        let upstream: Arc<dyn TextProvider> = provider.clone();

        let app = Application::build_with_provider(config, upstream)
            .await
            .expect("Failed to build test application");

        let address = format!("http://127.0.0.1:{}", app.port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to accept connections
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            provider,
            client,
        }
    }

    pub async fn post_chat(&self, body: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/ai-chat", self.address))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("Failed to send request")
    }
}
