//! HTTP transport for the phone's `/CGI/Execute` interface

use super::{ClientError, StepTransport};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use std::net::Ipv6Addr;
use std::time::Duration;

const EXECUTE_PATH: &str = "/CGI/Execute";
const EXECUTE_CONTENT_TYPE: &str = "text/xml;charset=utf-8";

/// Posts payloads with basic auth, sharing one connection pool across phones
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    username: String,
    password: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport that fails any call exceeding `timeout`
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        // Phones sit on the voice LAN; never route them through a system proxy
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            username: username.into(),
            password: password.into(),
            timeout,
        })
    }

    /// URL of the execute endpoint for an address
    pub fn execute_url(address: &str) -> String {
        match address.parse::<Ipv6Addr>() {
            Ok(_) => format!("http://[{}]{}", address, EXECUTE_PATH),
            Err(_) => format!("http://{}{}", address, EXECUTE_PATH),
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

#[async_trait]
impl StepTransport for HttpTransport {
    async fn post(&self, address: &str, payload: &str) -> Result<u16, ClientError> {
        let url = Self::execute_url(address);

        // The phone reads the form field `XML` but insists on an xml content type
        let mut request = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("XML", payload)])
            .build()
            .map_err(|e| ClientError::classify_reqwest(&e, &url, self.timeout_ms()))?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(EXECUTE_CONTENT_TYPE));

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| ClientError::classify_reqwest(&e, &url, self.timeout_ms()))?;

        Ok(response.status().as_u16())
    }

    fn name(&self) -> &'static str {
        "HTTP"
    }
}
