//! sing-box HTTP control-API client

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::common::{ClientTraffic, Error, Result, Traffic, TrafficAggregator};
use crate::core::{check_port, ControlApi};
use crate::model::CoreType;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SingBoxApi {
    base_url: String,
    client: Client,
    connected: AtomicBool,
}

impl SingBoxApi {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::api("sing-box API is not initialized"))
        }
    }

    /// Send a request and require one of `ok` as the response status.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        ok: &[StatusCode],
        action: &str,
    ) -> Result<()> {
        self.ensure_connected()?;
        let mut req = self.client.request(method, self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::api(format!("failed to {}: {}", action, e)))?;

        let status = resp.status();
        if !ok.contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::api(format!(
                "failed to {}: status {}, body: {}",
                action,
                status.as_u16(),
                body
            )));
        }
        Ok(())
    }
}

fn segment(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

#[async_trait]
impl ControlApi for SingBoxApi {
    async fn connect(port: u32) -> Result<Self> {
        let port = check_port(CoreType::SingBox, port)?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let api = SingBoxApi {
            base_url: format!("http://127.0.0.1:{}", port),
            client,
            connected: AtomicBool::new(true),
        };

        // any HTTP answer counts as alive
        if let Err(e) = api.client.get(api.url("/stats")).send().await {
            api.close();
            return Err(Error::api(format!("failed to connect to sing-box API: {}", e)));
        }
        debug!("Connected to sing-box API on port {}", port);
        Ok(api)
    }

    async fn get_traffic(&self, reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        self.ensure_connected()?;
        let path = if reset { "/stats?reset=true" } else { "/stats" };
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Error::api(format!("failed to query sing-box stats: {}", e)))?;

        if resp.status() != StatusCode::OK {
            return Err(Error::api(format!(
                "sing-box API returned status {}",
                resp.status().as_u16()
            )));
        }

        let stats: HashMap<String, i64> = resp
            .json()
            .await
            .map_err(|e| Error::parse(format!("failed to parse stats: {}", e)))?;

        let mut agg = TrafficAggregator::new();
        for (key, value) in &stats {
            agg.record(key, *value);
        }
        Ok(agg.finish())
    }

    async fn add_inbound(&self, inbound: &Value) -> Result<()> {
        self.call(
            Method::POST,
            "/inbounds",
            Some(inbound),
            &[StatusCode::OK, StatusCode::CREATED],
            "add inbound",
        )
        .await
    }

    async fn del_inbound(&self, tag: &str) -> Result<()> {
        self.call(
            Method::DELETE,
            &format!("/inbounds/{}", segment(tag)),
            None,
            &[StatusCode::OK, StatusCode::NO_CONTENT],
            "delete inbound",
        )
        .await
    }

    async fn add_user(&self, _protocol: &str, tag: &str, user: &Value) -> Result<()> {
        self.call(
            Method::POST,
            &format!("/inbounds/{}/users", segment(tag)),
            Some(user),
            &[StatusCode::OK, StatusCode::CREATED],
            "add user",
        )
        .await
    }

    async fn remove_user(&self, tag: &str, email: &str) -> Result<()> {
        self.call(
            Method::DELETE,
            &format!("/inbounds/{}/users/{}", segment(tag), segment(email)),
            None,
            &[StatusCode::OK, StatusCode::NO_CONTENT],
            "remove user",
        )
        .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}
